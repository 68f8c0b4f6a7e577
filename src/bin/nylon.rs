use anyhow::Result;
use clap::Parser;
use nylon::{
    AccessList, Args, Ledger, Server, Settings, Shutdown,
    monitor::{SignalMonitor, restart},
    pidfile::write_pidfile,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();
    let settings = Settings::load(&args)?;

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_max_level(settings.log_level())
        .init();

    if !settings.config_found {
        info!("skipping configuration file: {}", settings.config_path.display());
    }
    if settings.syslog {
        warn!("syslog output is not available, logging to stderr");
    }

    // Resolve everything up front; any failure here is fatal
    let endpoints = settings.resolve().await?;
    let access = AccessList::configure(&settings.allow, &settings.deny).await?;

    let mut server = Server::new(
        endpoints.listen_addrs,
        Arc::new(endpoints.descriptor),
        Arc::new(access),
    );
    server.bind()?;

    let ledger = Ledger::new();
    write_pidfile(&settings.pidfile, &ledger);

    let mut signals = SignalMonitor::new()?;

    // Run it
    match server.run_until(ledger, signals.recv()).await? {
        Shutdown::Terminate => Ok(()),
        Shutdown::Restart => restart(),
    }
}
