use crate::{
    access::AccessList,
    ledger::Ledger,
    monitor::Shutdown,
    negotiate::{ConnectionDescriptor, Negotiation, negotiate},
    relay::{RelaySession, Termination},
};
use anyhow::{Context, Result, anyhow, bail};
use socket2::{Domain, Protocol, Socket, Type};
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::{JoinError, JoinSet},
    time,
};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Pending-connection queue length for every listener
pub const LISTEN_BACKLOG: i32 = 10;

/// Server is the connection supervisor: it owns the listeners, applies the
/// access list, and runs one task per accepted client
pub struct Server {
    pub listen_addrs: Vec<SocketAddr>,
    descriptor: Arc<ConnectionDescriptor>,
    access: Arc<AccessList>,
    listeners: Vec<TcpListener>,
}

/// Server implementation block
impl Server {
    /// new is a constructor for the Server type
    pub fn new(
        listen_addrs: Vec<SocketAddr>,
        descriptor: Arc<ConnectionDescriptor>,
        access: Arc<AccessList>,
    ) -> Self {
        Self {
            listen_addrs,
            descriptor,
            access,
            listeners: Vec::new(),
        }
    }

    /// bind opens one listener per listening address and returns the bound
    /// local addresses. Binding twice is an error
    pub fn bind(&mut self) -> Result<Vec<SocketAddr>> {
        if !self.listeners.is_empty() {
            bail!("bind can only be called once");
        }
        if self.listen_addrs.is_empty() {
            bail!("no listening address");
        }

        let mut bound = Vec::with_capacity(self.listen_addrs.len());
        for addr in &self.listen_addrs {
            let listener = bind_listener(*addr)?;
            let local = listener.local_addr()?;

            info!("listening on {local}");

            bound.push(local);
            self.listeners.push(listener);
        }

        Ok(bound)
    }

    /// run_until accepts clients until `shutdown` resolves. Every listener is
    /// registered in `ledger`; on shutdown the ledger runs, live connections
    /// are told to tear down, and their tasks are awaited
    pub async fn run_until<F>(mut self, ledger: Ledger, shutdown: F) -> Result<Shutdown>
    where
        F: Future<Output = Shutdown>,
    {
        if self.listeners.is_empty() {
            self.bind()?;
        }

        let (conn_tx, mut conn_rx) = mpsc::channel::<(TcpStream, SocketAddr)>(64);

        for listener in self.listeners.drain(..) {
            let local = listener.local_addr()?;
            let handle = tokio::spawn(accept_loop(listener, self.access.clone(), conn_tx.clone()));
            let abort = handle.abort_handle();
            ledger.push(format!("listener {local}"), move || {
                debug!("closing listener {local}");
                abort.abort();
            });
        }
        drop(conn_tx);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                reason = &mut shutdown => break Ok(reason),
                accepted = conn_rx.recv() => match accepted {
                    Some((inbound, peer)) => {
                        let descriptor = self.descriptor.clone();
                        let stop = stop_rx.clone();
                        tasks.spawn(async move {
                            (peer, handle_connection(inbound, peer, descriptor, stop).await)
                        });
                    }
                    None => break Err(anyhow!("every listener has stopped")),
                },
                Some(joined) = tasks.join_next() => reap(joined),
            }
        };

        ledger.run_all();

        if !tasks.is_empty() {
            debug!("stopping {} live connection(s)", tasks.len());
        }
        let _ = stop_tx.send(true);
        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }

        outcome
    }
}

/// bind_listener creates a non-blocking listening socket the way every
/// listener is set up: SO_REUSEADDR (best effort), bind, listen
fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("socket()")?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!("setsockopt(SO_REUSEADDR) on {addr}: {e}");
    }

    socket
        .set_nonblocking(true)
        .context("failed to make listener non-blocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind() {addr}"))?;
    socket
        .listen(LISTEN_BACKLOG)
        .with_context(|| format!("listen() {addr}"))?;

    TcpListener::from_std(socket.into()).context("failed to register listener")
}

/// accept_loop hands every allowed client to the supervisor. Denied clients
/// are closed on the spot
async fn accept_loop(
    listener: TcpListener,
    access: Arc<AccessList>,
    tx: mpsc::Sender<(TcpStream, SocketAddr)>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed with error: {e}");
                time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if !access.is_allowed(peer.ip()) {
            debug!("rejected connection from {peer}");
            continue;
        }

        debug!("new client: {peer}");

        if tx.send((stream, peer)).await.is_err() {
            break;
        }
    }
}

/// handle_connection negotiates with a client and relays its traffic. The
/// connection keeps its own ledger, run when the supervisor stops it
async fn handle_connection(
    mut inbound: TcpStream,
    peer: SocketAddr,
    descriptor: Arc<ConnectionDescriptor>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let outbound = tokio::select! {
        negotiated = negotiate(&mut inbound, &descriptor) => {
            match negotiated.with_context(|| format!("negotiation with {peer} failed"))? {
                Negotiation::Relay(outbound) => outbound,
                Negotiation::NoRelay => {
                    debug!("served {peer} without relaying");
                    return Ok(());
                }
            }
        }
        _ = stop.changed() => {
            debug!("shutdown while negotiating with {peer}");
            return Ok(());
        }
    };

    let mut session = RelaySession::new(inbound, outbound)?;
    if descriptor.resolve_names {
        session.resolve_names().await;
    }
    let span = info_span!("session", conn = %session.description());

    let ledger = Ledger::new();
    let teardown = session.teardown();
    let on_target = teardown.clone();
    ledger.push(format!("client {}", session.client_addr()), move || teardown.fire());
    ledger.push(format!("target {}", session.target_addr()), move || on_target.fire());

    async move {
        info!("relaying");

        let relay = session.run();
        tokio::pin!(relay);

        let outcome = tokio::select! {
            outcome = &mut relay => outcome,
            _ = stop.changed() => {
                ledger.run_all();
                relay.await
            }
        };

        match outcome? {
            Termination::Closed => info!("closed"),
            Termination::TornDown => info!("torn down"),
        }

        Ok(())
    }
    .instrument(span)
    .await
}

/// reap logs how a finished connection task ended
fn reap(joined: Result<(SocketAddr, Result<()>), JoinError>) {
    match joined {
        Ok((_, Ok(()))) => {}
        Ok((peer, Err(e))) => warn!("connection {peer}: {e:#}"),
        Err(e) if e.is_panic() => error!("connection task panicked: {e}"),
        Err(e) => debug!("connection task cancelled: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn loopback_server() -> Server {
        Server::new(
            vec!["127.0.0.1:0".parse().unwrap()],
            Arc::new(ConnectionDescriptor::default()),
            Arc::new(AccessList::default()),
        )
    }

    #[tokio::test]
    async fn bind_reports_local_addresses() {
        let mut server = loopback_server();
        let bound = server.bind().unwrap();

        assert_eq!(bound.len(), 1);
        assert!(bound[0].ip().is_loopback());
        assert_ne!(bound[0].port(), 0);
        assert!(server.bind().is_err());
    }

    #[tokio::test]
    async fn listener_port_can_be_rebound_immediately() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();

        // Leave a connection in TIME_WAIT on the port
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = first.accept().await.unwrap();
        drop(accepted);
        drop(client);
        drop(first);

        let second = bind_listener(addr).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn shutdown_runs_the_ledger_and_closes_listeners() {
        let mut server = loopback_server();
        let addr = server.bind().unwrap()[0];

        let ledger = Ledger::new();
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        ledger.push("marker", move || flag.store(true, Ordering::SeqCst));

        let reason = server
            .run_until(ledger.clone(), async { Shutdown::Restart })
            .await
            .unwrap();

        assert_eq!(reason, Shutdown::Restart);
        assert!(released.load(Ordering::SeqCst));
        assert!(ledger.is_empty());

        // The accept task is gone once it observes the abort
        time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
