//! Process signal handling

use anyhow::Result;
use tracing::info;

/// Shutdown is why the supervisor stopped accepting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Release everything and exit
    Terminate,

    /// Release everything and re-execute the program image
    Restart,
}

/// SignalMonitor turns process signals into a shutdown reason: SIGTERM and
/// SIGINT terminate, SIGHUP restarts
#[cfg(unix)]
pub struct SignalMonitor {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalMonitor {
    /// new installs the signal handlers
    pub fn new() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    /// recv waits for the next handled signal
    pub async fn recv(&mut self) -> Shutdown {
        let (name, shutdown) = tokio::select! {
            _ = self.sigterm.recv() => ("SIGTERM", Shutdown::Terminate),
            _ = self.sigint.recv() => ("SIGINT", Shutdown::Terminate),
            _ = self.sighup.recv() => ("SIGHUP", Shutdown::Restart),
        };

        match shutdown {
            Shutdown::Terminate => info!("received {name}, exiting"),
            Shutdown::Restart => info!("received {name}, restarting"),
        }

        shutdown
    }
}

#[cfg(not(unix))]
pub struct SignalMonitor;

#[cfg(not(unix))]
impl SignalMonitor {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> Shutdown {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for CTRL-C: {e}");
            std::future::pending::<()>().await;
        }
        info!("received CTRL-C, exiting");
        Shutdown::Terminate
    }
}

/// restart replaces the current process with a fresh copy of itself, run
/// with the same arguments. Returns only on failure.
///
/// Active relays do not survive a restart: the supervisor tears every
/// session down before this runs.
#[cfg(unix)]
pub fn restart() -> Result<()> {
    use anyhow::Context;
    use std::{env, os::unix::process::CommandExt, process::Command};

    let exe = env::current_exe().context("failed to locate program image")?;
    let args: Vec<_> = env::args_os().skip(1).collect();

    info!("re-executing {}", exe.display());
    let err = Command::new(&exe).args(&args).exec();

    Err(anyhow::Error::new(err).context(format!("failed to re-execute {}", exe.display())))
}

#[cfg(not(unix))]
pub fn restart() -> Result<()> {
    anyhow::bail!("restart is not supported on this platform")
}
