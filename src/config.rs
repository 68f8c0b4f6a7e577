use crate::{
    address::{
        interface_ipv4, passive_addrs, resolve_bind_address, resolve_host_port_pair, resolve_port,
    },
    negotiate::{ConnectionDescriptor, Support},
};
use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Parser};
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
};
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nylon.conf";
pub const DEFAULT_PIDFILE: &str = "/var/run/nylon.pid";
pub const DEFAULT_ALLOW: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1080;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A SOCKS4/SOCKS4A/SOCKS5 proxy server with a transparent mirror mode",
    long_about = None
)]
pub struct Args {
    /// Increase verbosity, repeat for more
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Ask for syslog output
    #[arg(short, long)]
    pub syslog: bool,

    /// Allowed clients: whitespace separated hosts or ip[/prefix] entries
    #[arg(short, long, value_name = "LIST")]
    pub allow: Option<String>,

    /// Denied clients: whitespace separated hosts or ip[/prefix] entries
    #[arg(short, long, value_name = "LIST")]
    pub deny: Option<String>,

    /// Forward every client to this target instead of speaking SOCKS
    #[arg(short, long, value_name = "HOST:PORT")]
    pub mirror: Option<String>,

    /// Listening port, numeric or a service name
    #[arg(short, long, value_name = "PORT|SERVICE")]
    pub port: Option<String>,

    /// Interface or address to listen on
    #[arg(short = 'i', long = "bind-interface", value_name = "IF|IP")]
    pub bind_interface: Option<String>,

    /// Interface or address outbound connections originate from
    #[arg(short = 'I', long = "connect-interface", value_name = "IF|IP")]
    pub connect_interface: Option<String>,

    /// PID file path
    #[arg(short = 'P', long)]
    pub pidfile: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Disable SOCKS4
    #[arg(short = '4', long = "no-socks4")]
    pub no_socks4: bool,

    /// Disable SOCKS5
    #[arg(short = '5', long = "no-socks5")]
    pub no_socks5: bool,

    /// Show relay endpoints numerically instead of by host name
    #[arg(short = 'n', long = "numeric")]
    pub numeric: bool,
}

/// ConfigFile is a parsed INI-style configuration file, queried by section
/// and key
#[derive(Debug, Default)]
pub struct ConfigFile {
    values: HashMap<(String, String), String>,
}

/// ConfigFile implementation block
impl ConfigFile {
    /// load reads and parses the file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in configuration file {}", path.display()))
    }

    /// parse accepts `[Section]` headers, `Key = value` lines and `#` or `;`
    /// comments. Keys before the first section header are an error
    pub fn parse(text: &str) -> Result<Self> {
        let mut values = HashMap::new();
        let mut section: Option<String> = None;

        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest
                    .strip_suffix(']')
                    .ok_or_else(|| anyhow!("line {}: unterminated section header", n + 1))?;
                section = Some(name.trim().to_string());
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("line {}: expected key = value", n + 1))?;
            let Some(section) = section.as_ref() else {
                bail!("line {}: key outside of any section", n + 1);
            };

            values.insert(
                (section.clone(), key.trim().to_string()),
                value.trim().to_string(),
            );
        }

        Ok(Self { values })
    }

    /// get_str returns the value of `key` in `section`
    pub fn get_str(&self, section: &str, key: &str) -> Option<&str> {
        self.values
            .get(&(section.to_string(), key.to_string()))
            .map(String::as_str)
    }

    /// get_num returns the numeric value of `key` in `section`, or `default`
    /// when the key is absent
    pub fn get_num(&self, section: &str, key: &str, default: u32) -> Result<u32> {
        match self.get_str(section, key) {
            Some(v) => v
                .parse()
                .with_context(|| format!("[{section}] {key}: not a number: {v}")),
            None => Ok(default),
        }
    }
}

/// Settings is the merged configuration: built-in defaults, then the
/// configuration file, then the command line
#[derive(Debug, Clone)]
pub struct Settings {
    pub verbose: u8,
    pub syslog: bool,
    pub allow: String,
    pub deny: String,
    pub mirror: Option<String>,
    pub port: Option<String>,
    pub bind_interface: Option<String>,
    pub connect_interface: Option<String>,
    pub pidfile: PathBuf,
    pub support: Support,
    pub config_path: PathBuf,

    /// Reverse resolve relay endpoints for session descriptions
    pub resolve_names: bool,

    /// The configuration file existed and was read
    pub config_found: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            verbose: 0,
            syslog: false,
            allow: DEFAULT_ALLOW.to_string(),
            deny: String::new(),
            mirror: None,
            port: None,
            bind_interface: None,
            connect_interface: None,
            pidfile: PathBuf::from(DEFAULT_PIDFILE),
            support: Support::ALL,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            resolve_names: true,
            config_found: false,
        }
    }
}

/// Endpoints are the resolved addresses the server needs to start
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub descriptor: ConnectionDescriptor,
    pub listen_addrs: Vec<SocketAddr>,
}

/// Settings implementation block
impl Settings {
    /// load merges the configuration file named by `args` (skipped when it
    /// does not exist) with `args`
    pub fn load(args: &Args) -> Result<Self> {
        let file = match fs::metadata(&args.config) {
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            _ => Some(ConfigFile::load(&args.config)?),
        };
        Self::merge(file.as_ref(), args)
    }

    /// merge layers an optional parsed configuration file and the command
    /// line over the defaults
    pub fn merge(file: Option<&ConfigFile>, args: &Args) -> Result<Self> {
        let mut s = Settings {
            config_path: args.config.clone(),
            ..Default::default()
        };

        if let Some(file) = file {
            s.config_found = true;

            let text = |key: &str| file.get_str("Server", key).map(str::to_string);
            s.bind_interface = text("Binding-Interface");
            s.connect_interface = text("Connecting-Interface");
            s.mirror = text("Mirror-Address");
            if let Some(allow) = text("Allow-IP") {
                s.allow = allow;
            }
            if let Some(deny) = text("Deny-IP") {
                s.deny = deny;
            }
            s.port = text("Port");
            if let Some(pidfile) = file.get_str("General", "PIDFile") {
                s.pidfile = PathBuf::from(pidfile);
            }
            s.verbose = u8::try_from(file.get_num("General", "Verbose", 0)?).unwrap_or(u8::MAX);
            s.syslog = file.get_num("General", "Syslog", 0)? != 0;
        }

        // Command line repeats add to the file's verbosity
        s.verbose = s.verbose.saturating_add(args.verbose);
        s.syslog |= args.syslog;

        if let Some(allow) = &args.allow {
            s.allow = allow.clone();
        }
        if let Some(deny) = &args.deny {
            s.deny = deny.clone();
        }
        if args.mirror.is_some() {
            s.mirror = args.mirror.clone();
        }
        if args.port.is_some() {
            s.port = args.port.clone();
        }
        if args.numeric {
            s.resolve_names = false;
        }
        if args.bind_interface.is_some() {
            s.bind_interface = args.bind_interface.clone();
        }
        if args.connect_interface.is_some() {
            s.connect_interface = args.connect_interface.clone();
        }
        if let Some(pidfile) = &args.pidfile {
            s.pidfile = pidfile.clone();
        }
        if args.no_socks4 {
            s.support = s.support.without(Support::SOCKS4);
        }
        if args.no_socks5 {
            s.support = s.support.without(Support::SOCKS5);
        }

        Ok(s)
    }

    /// log_level maps verbosity onto a tracing level
    pub fn log_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }

    /// resolve looks up the mirror target, the connecting interface and the
    /// listening addresses. Any failure is a configuration error
    pub async fn resolve(&self) -> Result<Endpoints> {
        let mut descriptor = ConnectionDescriptor {
            support: self.support,
            resolve_names: self.resolve_names,
            ..Default::default()
        };

        if let Some(mirror) = self.mirror.as_deref() {
            let addr = resolve_host_port_pair(mirror)
                .await
                .context("error resolving mirror host:port address")?;
            debug!("mirror target {mirror} is {addr}");
            descriptor.mirror = Some(addr);
        }

        // An explicit port wins; mirror mode otherwise listens on the
        // mirror's port
        let port = match (self.port.as_deref(), descriptor.mirror) {
            (Some(port), _) => resolve_port(port).context("unable to resolve port")?,
            (None, Some(mirror)) => mirror.port(),
            (None, None) => DEFAULT_PORT,
        };

        if let Some(ifip) = self.connect_interface.as_deref() {
            let bind = resolve_bind_address(ifip, 0)
                .await
                .context("error resolving connecting if/ip address")?
                .into_iter()
                .next();
            descriptor.bind = bind;
            if interface_ipv4(ifip).is_some() {
                descriptor.bind_interface = Some(ifip.to_string());
            }
        }

        let listen_addrs = match self.bind_interface.as_deref() {
            Some(ifip) => resolve_bind_address(ifip, port)
                .await
                .context("error resolving binding if/ip address")?,
            None => passive_addrs(port),
        };

        Ok(Endpoints {
            descriptor,
            listen_addrs,
        })
    }
}
