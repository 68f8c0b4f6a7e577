//! SOCKS4 and SOCKS4A negotiation, including the RESOLVE (240) extension
//! used by resolve-only clients.

use crate::{
    address::resolve_host,
    negotiate::{ConnectionDescriptor, Negotiation, prepare_outbound},
};
use anyhow::{Context, Result, anyhow, bail};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, warn};

/// Protocol selector byte
pub const VERSION: u8 = 0x04;

/// Version byte of every reply
const REPLY_VERSION: u8 = 0x00;

/// Longest SOCKS4A hostname accepted, terminator included
const MAX_HOSTNAME: usize = 256;

/// Command represents the SOCKS4 commands this proxy serves
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Connect = 0x01,
    Resolve = 0xF0,
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS4 command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0xF0 => Some(Command::Resolve),
            _ => None,
        }
    }
}

/// ReplyCode represents the SOCKS4 reply status
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyCode {
    Granted = 0x5A,
    Rejected = 0x5B,
}

/// Request is a parsed SOCKS4 request header
#[derive(Debug, Clone, Copy)]
struct Request {
    command: Command,
    port: u16,
    addr: Ipv4Addr,
}

/// Request implementation block
impl Request {
    /// wants_hostname reports whether a hostname follows the user id: the
    /// 0.0.0.x (x != 0) SOCKS4A marker, or a RESOLVE to port 0
    fn wants_hostname(&self) -> bool {
        let [a, b, c, d] = self.addr.octets();
        (a == 0 && b == 0 && c == 0 && d != 0)
            || (self.command == Command::Resolve && self.port == 0)
    }
}

/// negotiate serves a SOCKS4/4A request. The version byte has already been
/// consumed by the caller
pub async fn negotiate(
    client: &mut TcpStream,
    conn: &ConnectionDescriptor,
) -> Result<Negotiation> {
    // SOCKS4 request format
    // +----+----+----+----+----+----+----+----+----+----+....+----+
    // | VN | CD | DSTPORT |      DSTIP        | USERID       |NULL|
    // +----+----+----+----+----+----+----+----+----+----+....+----+
    //    1    1      2              4           variable       1
    // SOCKS4A appends a NUL terminated hostname after USERID

    let mut header = [0u8; 7];
    client
        .read_exact(&mut header)
        .await
        .context("failed to read SOCKS4 request")?;

    let command = Command::from_byte(header[0]).ok_or_else(|| {
        warn!("client attempted unsupported SOCKS4 command {}", header[0]);
        anyhow!("unsupported SOCKS4 command {}", header[0])
    })?;

    let mut request = Request {
        command,
        port: u16::from_be_bytes([header[1], header[2]]),
        addr: Ipv4Addr::new(header[3], header[4], header[5], header[6]),
    };

    skip_userid(client).await?;

    // A failed lookup still gets a reply, just a negative one
    let mut resolved = true;
    if request.wants_hostname() {
        let hostname = read_hostname(client).await?;
        match resolve_host(&hostname).await {
            Ok(ip) => {
                debug!("resolved {hostname} to {ip}");
                request.addr = ip;
            }
            Err(e) => {
                debug!("{e:#}");
                resolved = false;
            }
        }
    }

    let (code, outcome) = match (request.command, resolved) {
        (_, false) => (
            ReplyCode::Rejected,
            Err(anyhow!("failed to resolve SOCKS4A hostname")),
        ),
        (Command::Resolve, true) => (ReplyCode::Granted, Ok(Negotiation::NoRelay)),
        (Command::Connect, true) => {
            let target = SocketAddr::V4(SocketAddrV4::new(request.addr, request.port));
            let socket = prepare_outbound(conn)?;

            match socket.connect(target).await {
                Ok(outbound) => (ReplyCode::Granted, Ok(Negotiation::Relay(outbound))),
                Err(e) => {
                    warn!("connect to {target} failed: {e}");
                    (
                        ReplyCode::Rejected,
                        Err(anyhow!(e).context(format!("connect to {target} failed"))),
                    )
                }
            }
        }
    };

    send_reply(client, code, request.port, request.addr).await?;

    outcome
}

/// skip_userid consumes the NUL terminated user id, which is not used
async fn skip_userid(client: &mut TcpStream) -> Result<()> {
    loop {
        let byte = client.read_u8().await.context("failed to read SOCKS4 user id")?;
        if byte == 0 {
            return Ok(());
        }
    }
}

/// read_hostname reads a NUL terminated SOCKS4A hostname
async fn read_hostname(client: &mut TcpStream) -> Result<String> {
    let mut hostname = Vec::with_capacity(MAX_HOSTNAME);

    for _ in 0..MAX_HOSTNAME {
        let byte = client.read_u8().await.context("failed to read SOCKS4A hostname")?;
        if byte == 0 {
            return Ok(String::from_utf8_lossy(&hostname).into_owned());
        }
        hostname.push(byte);
    }

    bail!("SOCKS4A hostname longer than {} bytes", MAX_HOSTNAME - 1)
}

/// send_reply writes the 8 byte SOCKS4 reply
async fn send_reply(
    client: &mut TcpStream,
    code: ReplyCode,
    port: u16,
    addr: Ipv4Addr,
) -> Result<()> {
    // SOCKS4 reply format
    // +----+----+----+----+----+----+----+----+
    // | VN | CD | DSTPORT |      DSTIP        |
    // +----+----+----+----+----+----+----+----+
    //    1    1      2              4

    let mut reply = [0u8; 8];
    reply[0] = REPLY_VERSION;
    reply[1] = code as u8;
    reply[2..4].copy_from_slice(&port.to_be_bytes());
    reply[4..8].copy_from_slice(&addr.octets());

    client
        .write_all(&reply)
        .await
        .context("failed to send SOCKS4 reply")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{negotiate::negotiate as negotiate_any, testing::socket_pair};
    use tokio::net::TcpListener;

    fn request(command: u8, port: u16, addr: [u8; 4], tail: &[u8]) -> Vec<u8> {
        let mut buf = vec![VERSION, command];
        buf.extend_from_slice(&port.to_be_bytes());
        buf.extend_from_slice(&addr);
        buf.extend_from_slice(b"nobody\0");
        buf.extend_from_slice(tail);
        buf
    }

    async fn exchange(req: &[u8]) -> (Result<Negotiation>, Vec<u8>) {
        let (mut client, mut inbound) = socket_pair().await;
        client.write_all(req).await.unwrap();
        client.shutdown().await.unwrap();

        let outcome = negotiate_any(&mut inbound, &ConnectionDescriptor::default()).await;
        drop(inbound);

        // Unread request bytes make the close a reset; keep what arrived
        let mut reply = Vec::new();
        let _ = client.read_to_end(&mut reply).await;
        (outcome, reply)
    }

    #[tokio::test]
    async fn connect_is_granted() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();

        let (outcome, reply) = exchange(&request(1, port, [127, 0, 0, 1], &[])).await;

        let mut expected = vec![0, 90];
        expected.extend_from_slice(&port.to_be_bytes());
        expected.extend_from_slice(&[127, 0, 0, 1]);
        assert_eq!(reply, expected);

        match outcome.unwrap() {
            Negotiation::Relay(outbound) => {
                assert_eq!(outbound.peer_addr().unwrap(), target.local_addr().unwrap());
            }
            Negotiation::NoRelay => panic!("expected a relay"),
        }
    }

    #[tokio::test]
    async fn refused_connect_is_rejected() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let (outcome, reply) = exchange(&request(1, port, [127, 0, 0, 1], &[])).await;

        assert_eq!(reply.len(), 8);
        assert_eq!(reply[1], ReplyCode::Rejected as u8);
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn socks4a_hostname_is_resolved_for_connect() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();

        let (outcome, reply) = exchange(&request(1, port, [0, 0, 0, 1], b"localhost\0")).await;

        assert_eq!(reply[1], ReplyCode::Granted as u8);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
        assert!(matches!(outcome.unwrap(), Negotiation::Relay(_)));
    }

    #[tokio::test]
    async fn resolve_only_request_grants_without_relay() {
        let (outcome, reply) = exchange(&request(0xF0, 0, [0, 0, 0, 1], b"localhost\0")).await;

        assert_eq!(reply, vec![0, 90, 0, 0, 127, 0, 0, 1]);
        assert!(matches!(outcome.unwrap(), Negotiation::NoRelay));
    }

    #[tokio::test]
    async fn resolve_to_port_zero_reads_hostname_without_marker() {
        let (outcome, reply) = exchange(&request(0xF0, 0, [10, 9, 8, 7], b"localhost\0")).await;

        assert_eq!(reply, vec![0, 90, 0, 0, 127, 0, 0, 1]);
        assert!(matches!(outcome.unwrap(), Negotiation::NoRelay));
    }

    #[tokio::test]
    async fn unresolvable_hostname_is_rejected() {
        let (outcome, reply) =
            exchange(&request(1, 80, [0, 0, 0, 1], b"no-such-host.invalid\0")).await;

        assert_eq!(reply, vec![0, 91, 0, 80, 0, 0, 0, 1]);
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn unsupported_command_gets_no_reply() {
        let (outcome, reply) = exchange(&request(2, 80, [127, 0, 0, 1], &[])).await;

        assert!(outcome.is_err());
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn unterminated_hostname_fails() {
        let long = vec![b'a'; MAX_HOSTNAME + 8];
        let (outcome, reply) = exchange(&request(1, 80, [0, 0, 0, 1], &long)).await;

        assert!(outcome.is_err());
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn truncated_request_fails() {
        let (outcome, reply) = exchange(&[VERSION, 1, 0]).await;

        assert!(outcome.is_err());
        assert!(reply.is_empty());
    }
}
