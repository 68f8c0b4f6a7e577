//! Bidirectional byte relay between a client and its target.
//!
//! Each side of a session is a [`PeerBuffer`]. A peer's buffer holds bytes
//! waiting to be written to that peer's own socket, and is filled by reads
//! on the *other* socket. After every readiness event both peers are
//! rescheduled:
//!
//! - wait for writability while the peer has unsent bytes
//! - wait for readability while the other buffer has room, unless this peer
//!   already saw EOF and the other side still has bytes to flush
//!
//! The first EOF (or hard read error) on a side only marks it half closed.
//! Seeing it again once that side is rearmed ends the session.

use crate::address::reverse_lookup;
use anyhow::{Context, Result, anyhow};
use std::{
    future,
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::Arc,
};
use tokio::{
    io::{Interest, Ready},
    net::TcpStream,
    sync::Notify,
};
use tracing::{debug, trace};

/// Per-direction buffer capacity
pub const BUFFER_SIZE: usize = 1024;

const CLIENT: usize = 0;
const TARGET: usize = 1;

/// peer_of returns the arena index of the other side
const fn peer_of(idx: usize) -> usize {
    idx ^ 1
}

/// Termination is how a session ended without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// A side reported EOF a second time
    Closed,

    /// Teardown was requested from outside, e.g. by a ledger entry
    TornDown,
}

/// Teardown asks a running session to release its sockets and stop. Firing
/// before the session waits on it is not lost
#[derive(Debug, Clone, Default)]
pub struct Teardown {
    notify: Arc<Notify>,
}

/// Teardown implementation block
impl Teardown {
    /// fire requests the session to end
    pub fn fire(&self) {
        self.notify.notify_one();
    }

    async fn requested(&self) {
        self.notify.notified().await;
    }
}

/// PeerBuffer is one side of a relay session
#[derive(Debug)]
struct PeerBuffer {
    stream: TcpStream,
    addr: SocketAddr,
    buf: Box<[u8]>,

    /// Bytes buffered and not yet written to `stream`
    pos: usize,

    /// EOF or a hard read error was seen once on `stream`
    half_closed: bool,
}

/// PeerBuffer implementation block
impl PeerBuffer {
    fn new(stream: TcpStream, addr: SocketAddr, capacity: usize) -> Self {
        Self {
            stream,
            addr,
            buf: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
            half_closed: false,
        }
    }

    fn pending(&self) -> bool {
        self.pos > 0
    }

    fn has_room(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// consume drops `n` written bytes, moving the unwritten tail to the
    /// front of the buffer
    fn consume(&mut self, n: usize) {
        if n >= self.pos {
            self.pos = 0;
        } else {
            self.buf.copy_within(n..self.pos, 0);
            self.pos -= n;
        }
    }
}

/// RelaySession pumps bytes between a client and a target stream until one
/// side closes, a fatal error occurs, or teardown is requested
#[derive(Debug)]
pub struct RelaySession {
    ends: [PeerBuffer; 2],
    description: String,
    teardown: Teardown,
}

/// RelaySession implementation block
impl RelaySession {
    /// new pairs the client and target streams
    pub fn new(client: TcpStream, target: TcpStream) -> Result<Self> {
        Self::with_capacity(client, target, BUFFER_SIZE)
    }

    /// with_capacity pairs the streams using buffers of `capacity` bytes
    pub fn with_capacity(client: TcpStream, target: TcpStream, capacity: usize) -> Result<Self> {
        let client_addr = client
            .peer_addr()
            .context("failed to retrieve address information from client")?;
        let target_addr = target
            .peer_addr()
            .context("failed to retrieve address information from target")?;

        let description = format!("{client_addr} <=> {target_addr}");

        Ok(Self {
            ends: [
                PeerBuffer::new(client, client_addr, capacity),
                PeerBuffer::new(target, target_addr, capacity),
            ],
            description,
            teardown: Teardown::default(),
        })
    }

    /// description is the "client <=> target" string used in logs
    pub fn description(&self) -> &str {
        &self.description
    }

    /// resolve_names rewrites the description using host names where the
    /// endpoints have one, keeping the numeric form otherwise
    pub async fn resolve_names(&mut self) {
        let (client, target) = tokio::join!(
            endpoint_name(self.client_addr()),
            endpoint_name(self.target_addr()),
        );
        self.description = format!("{client} <=> {target}");
    }

    /// client_addr is the client's address
    pub fn client_addr(&self) -> SocketAddr {
        self.ends[CLIENT].addr
    }

    /// target_addr is the target's address
    pub fn target_addr(&self) -> SocketAddr {
        self.ends[TARGET].addr
    }

    /// teardown returns a handle that ends this session from outside
    pub fn teardown(&self) -> Teardown {
        self.teardown.clone()
    }

    /// run relays until the session ends. Both sockets are closed when it
    /// returns, whatever the outcome
    pub async fn run(mut self) -> Result<Termination> {
        debug!("connecting {}", self.description);

        loop {
            let client_interest = self.interest(CLIENT);
            let target_interest = self.interest(TARGET);

            if client_interest.is_none() && target_interest.is_none() {
                return Err(anyhow!("relay stalled: neither side can make progress"));
            }

            let (idx, ready) = {
                let [client, target] = &self.ends;
                tokio::select! {
                    r = armed(&client.stream, client_interest) => (CLIENT, r),
                    r = armed(&target.stream, target_interest) => (TARGET, r),
                    _ = self.teardown.requested() => return Ok(Termination::TornDown),
                }
            };

            let ready = ready.with_context(|| format!("({}) readiness", self.description))?;

            if let Some(end) = self.handle(idx, ready)? {
                return Ok(end);
            }
        }
    }

    /// interest computes what `idx` should wait for, if anything
    fn interest(&self, idx: usize) -> Option<Interest> {
        let d = &self.ends[idx];
        let peer = &self.ends[peer_of(idx)];

        let write = d.pending().then_some(Interest::WRITABLE);
        let read = (peer.has_room() && !(d.half_closed && peer.pending()))
            .then_some(Interest::READABLE);

        match (read, write) {
            (Some(r), Some(w)) => Some(r | w),
            (r, w) => r.or(w),
        }
    }

    /// handle services one readiness event on `idx`
    fn handle(&mut self, idx: usize, ready: Ready) -> Result<Option<Termination>> {
        if ready.is_readable() || ready.is_read_closed() {
            if let Some(end) = self.read_into_peer(idx)? {
                return Ok(Some(end));
            }
        }

        if ready.is_writable() || ready.is_write_closed() {
            self.flush(idx)?;
        }

        Ok(None)
    }

    /// pair_mut borrows `idx` and its peer at once
    fn pair_mut(&mut self, idx: usize) -> (&mut PeerBuffer, &mut PeerBuffer) {
        let [client, target] = &mut self.ends;
        if idx == CLIENT {
            (client, target)
        } else {
            (target, client)
        }
    }

    /// read_into_peer reads from `idx`'s socket into its peer's buffer
    fn read_into_peer(&mut self, idx: usize) -> Result<Option<Termination>> {
        let description = self.description.clone();
        let (d, peer) = self.pair_mut(idx);

        if !peer.has_room() {
            return Ok(None);
        }

        match d.stream.try_read(&mut peer.buf[peer.pos..]) {
            Ok(0) => {
                if !d.half_closed {
                    trace!("({description}) EOF from {}", d.addr);
                    d.half_closed = true;
                    return Ok(None);
                }
                debug!("({description}) terminated connection");
                Ok(Some(Termination::Closed))
            }
            Ok(n) => {
                trace!("({description}) read {n} bytes from {}", d.addr);
                peer.pos += n;
                Ok(None)
            }
            Err(e) if is_transient(&e) => Ok(None),
            Err(e) => {
                if !d.half_closed {
                    trace!("({description}) read error from {}: {e}", d.addr);
                    d.half_closed = true;
                    return Ok(None);
                }
                Err(anyhow!(e).context(format!("({description}) read from {}", d.addr)))
            }
        }
    }

    /// flush writes `idx`'s pending bytes to its own socket
    fn flush(&mut self, idx: usize) -> Result<()> {
        let d = &mut self.ends[idx];

        if !d.pending() {
            return Ok(());
        }

        match d.stream.try_write(&d.buf[..d.pos]) {
            Ok(n) => {
                trace!("({}) wrote {n} of {} bytes to {}", self.description, d.pos, d.addr);
                d.consume(n);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(anyhow!(e).context(format!("({}) write to {}", self.description, d.addr))),
        }
    }
}

/// endpoint_name formats `addr` as host:port, with the host reverse
/// resolved when possible
async fn endpoint_name(addr: SocketAddr) -> String {
    let name = match addr {
        SocketAddr::V4(v4) => reverse_lookup(*v4.ip()).await,
        SocketAddr::V6(_) => None,
    };

    match name {
        Some(host) => format!("{host}:{}", addr.port()),
        None => addr.to_string(),
    }
}

/// armed waits for `interest` on `stream`, or forever when unarmed
async fn armed(stream: &TcpStream, interest: Option<Interest>) -> io::Result<Ready> {
    match interest {
        Some(interest) => stream.ready(interest).await,
        None => future::pending().await,
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}
