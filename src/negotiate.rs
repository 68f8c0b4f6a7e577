use crate::{socks4, socks5};
use anyhow::{Context, Result, bail};
use std::{net::SocketAddr, ops::BitOr};
use tokio::{
    io::AsyncReadExt,
    net::{TcpSocket, TcpStream},
};
use tracing::{debug, warn};

/// Support is the set of proxy protocols a listener accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Support(u8);

/// Support implementation block
impl Support {
    pub const NONE: Support = Support(0);
    pub const SOCKS4: Support = Support(0x01);
    pub const SOCKS5: Support = Support(0x02);
    pub const ALL: Support = Support(0x03);

    /// contains reports whether every protocol in `other` is enabled
    pub fn contains(self, other: Support) -> bool {
        self.0 & other.0 == other.0
    }

    /// without returns the set with the protocols of `other` cleared
    pub fn without(self, other: Support) -> Support {
        Support(self.0 & !other.0)
    }
}

impl BitOr for Support {
    type Output = Support;

    fn bitor(self, rhs: Support) -> Support {
        Support(self.0 | rhs.0)
    }
}

impl Default for Support {
    fn default() -> Self {
        Support::ALL
    }
}

/// ConnectionDescriptor is the per-listener configuration shared read-only by
/// every accepted connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionDescriptor {
    /// Forward every connection here instead of negotiating
    pub mirror: Option<SocketAddr>,

    /// Local address outbound sockets bind to
    pub bind: Option<SocketAddr>,

    /// Device outbound sockets bind to, when the connecting interface was
    /// given by name
    pub bind_interface: Option<String>,

    /// Upstream proxy; carried but not negotiated through
    pub chain: Option<SocketAddr>,

    /// Enabled protocols
    pub support: Support,

    /// Describe relay endpoints by host name rather than address
    pub resolve_names: bool,
}

/// Negotiation is the successful outcome of talking to a client. Failure is
/// the `Err` side of `negotiate`
#[derive(Debug)]
pub enum Negotiation {
    /// Relay between the client and this outbound stream
    Relay(TcpStream),

    /// The request was served; close the client without relaying
    NoRelay,
}

/// negotiate obtains the outbound side of a new connection: straight to the
/// mirror target when one is configured, otherwise through whichever SOCKS
/// version the client's first byte selects
pub async fn negotiate(
    client: &mut TcpStream,
    conn: &ConnectionDescriptor,
) -> Result<Negotiation> {
    if let Some(mirror) = conn.mirror {
        return mirror_connect(mirror, conn).await.map(Negotiation::Relay);
    }

    let mut version = [0u8; 1];
    client
        .read_exact(&mut version)
        .await
        .context("failed to read protocol version")?;

    match version[0] {
        socks4::VERSION => {
            if !conn.support.contains(Support::SOCKS4) {
                warn!("SOCKS4 support turned off");
                bail!("SOCKS4 support turned off");
            }
            socks4::negotiate(client, conn).await
        }
        socks5::VERSION => {
            if !conn.support.contains(Support::SOCKS5) {
                warn!("SOCKS5 support turned off");
                bail!("SOCKS5 support turned off");
            }
            socks5::negotiate(client, conn).await
        }
        other => bail!("unknown protocol version {other}"),
    }
}

/// prepare_outbound creates an outbound socket bound the way the descriptor
/// asks: to the connecting device and/or local address
pub fn prepare_outbound(conn: &ConnectionDescriptor) -> Result<TcpSocket> {
    let socket = TcpSocket::new_v4().context("socket()")?;

    if let Some(bind) = conn.bind {
        if let Some(iface) = conn.bind_interface.as_deref() {
            bind_device(&socket, iface)?;
        }

        socket
            .bind(bind)
            .with_context(|| format!("failed to bind outbound socket to {bind}"))?;
    }

    Ok(socket)
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_device(socket: &TcpSocket, iface: &str) -> Result<()> {
    socket
        .bind_device(Some(iface.as_bytes()))
        .with_context(|| format!("failed to bind to device {iface}"))
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_device(_socket: &TcpSocket, iface: &str) -> Result<()> {
    tracing::debug!("binding to device {iface} is not supported on this platform");
    Ok(())
}

/// mirror_connect opens the outbound side in mirror mode. The client is
/// never read from
async fn mirror_connect(mirror: SocketAddr, conn: &ConnectionDescriptor) -> Result<TcpStream> {
    let socket = prepare_outbound(conn)?;
    let outbound = socket
        .connect(mirror)
        .await
        .with_context(|| format!("failed to connect to mirror {mirror}"))?;

    debug!("mirroring to {mirror}");
    Ok(outbound)
}
