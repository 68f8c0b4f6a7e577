use crate::address::resolve_host_all;
use anyhow::{Context, Result, anyhow};
use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// AccessList gates which client addresses may use the proxy. Deny rules
/// always win; an empty allow set admits everything not denied, a non-empty
/// one acts as a whitelist
#[derive(Debug, Clone, Default)]
pub struct AccessList {
    allow: Vec<Ipv4Net>,
    deny: Vec<Ipv4Net>,
}

/// AccessList implementation block
impl AccessList {
    /// configure builds both rule sets from whitespace separated
    /// `host[/prefix]` lists. Any entry that cannot be parsed or resolved
    /// fails the whole configuration
    pub async fn configure(allow_specs: &str, deny_specs: &str) -> Result<Self> {
        let allow = build_rules(allow_specs)
            .await
            .context("error making allow list")?;
        let deny = build_rules(deny_specs)
            .await
            .context("error making deny list")?;

        debug!("access list: {} allow, {} deny rules", allow.len(), deny.len());

        Ok(Self { allow, deny })
    }

    /// from_rules builds an AccessList from already parsed networks
    pub fn from_rules(allow: Vec<Ipv4Net>, deny: Vec<Ipv4Net>) -> Self {
        Self { allow, deny }
    }

    /// is_allowed evaluates the rules for a peer address. Non-IPv4 peers
    /// never match a rule
    pub fn is_allowed(&self, peer: IpAddr) -> bool {
        let matches = |rules: &[Ipv4Net]| match peer {
            IpAddr::V4(ip) => rules.iter().any(|net| net.contains(&ip)),
            IpAddr::V6(_) => false,
        };

        if matches(&self.deny) {
            return false;
        }

        if matches(&self.allow) {
            return true;
        }

        self.allow.is_empty()
    }
}

/// build_rules expands a host list into networks, one per resolved address
async fn build_rules(specs: &str) -> Result<Vec<Ipv4Net>> {
    let mut rules = Vec::new();

    for spec in specs.split_whitespace() {
        let (host, prefix) = match spec.split_once('/') {
            Some((host, prefix)) => {
                let prefix: u8 = prefix
                    .parse()
                    .with_context(|| format!("invalid prefix length in {spec}"))?;
                (host, prefix)
            }
            None => (spec, 32),
        };

        // Literals skip the resolver
        let addrs = match host.parse::<Ipv4Addr>() {
            Ok(ip) => vec![ip],
            Err(_) => resolve_host_all(host).await?,
        };

        for addr in addrs {
            let net = Ipv4Net::new(addr, prefix)
                .map_err(|_| anyhow!("invalid prefix length in {spec}"))?;
            rules.push(net.trunc());
        }
    }

    Ok(rules)
}
