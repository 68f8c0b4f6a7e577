//! SOCKS5 negotiation: "no authentication" only, IPv4 and domain name
//! destinations, CONNECT and BIND.
//!
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)

pub mod address;
pub mod auth;
pub mod commands;
pub mod protocol;

use crate::negotiate::{ConnectionDescriptor, Negotiation};
use anyhow::{Context, Result, bail};
use tokio::{io::AsyncReadExt, net::TcpStream};

use self::protocol::{Command, Version};

/// Protocol selector byte
pub const VERSION: u8 = Version::SOCKS5 as u8;

/// negotiate serves a SOCKS5 request. The version byte of the greeting has
/// already been consumed by the caller
pub async fn negotiate(
    stream: &mut TcpStream,
    conn: &ConnectionDescriptor,
) -> Result<Negotiation> {
    auth::negotiate_auth(stream).await?;

    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .context("failed to read SOCKS5 request")?;

    let [version, command, _rsv, atyp] = header;

    if version != Version::SOCKS5 as u8 {
        bail!("not SOCKS5: request version {version}");
    }

    let target = address::parse_address_from_stream(stream, atyp).await?;

    match Command::from_byte(command) {
        Some(Command::Connect) => commands::handle_connect_cmd(stream, target, conn)
            .await
            .map(Negotiation::Relay),
        Some(Command::Bind) => commands::handle_bind_cmd(stream, target)
            .await
            .map(Negotiation::Relay),
        Some(Command::UdpAssociate) => bail!("UDP ASSOCIATE not supported"),
        None => bail!("unknown SOCKS5 command {command}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{negotiate::negotiate as negotiate_any, testing::socket_pair};
    use std::net::SocketAddr;
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    fn connect_ipv4(command: u8, addr: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(addr) = addr else {
            panic!("IPv4 only");
        };
        let mut buf = vec![5, command, 0, 1];
        buf.extend_from_slice(&addr.ip().octets());
        buf.extend_from_slice(&addr.port().to_be_bytes());
        buf
    }

    fn connect_domain(domain: &str, port: u16) -> Vec<u8> {
        let mut buf = vec![5, 1, 0, 3, domain.len() as u8];
        buf.extend_from_slice(domain.as_bytes());
        buf.extend_from_slice(&port.to_be_bytes());
        buf
    }

    async fn exchange(greeting: &[u8], req: &[u8]) -> (Result<Negotiation>, Vec<u8>) {
        let (mut client, mut inbound) = socket_pair().await;
        client.write_all(greeting).await.unwrap();
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
    async fn zero_methods_still_proceed_to_request() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = target.local_addr().unwrap();

        let (outcome, reply) = exchange(&[5, 0], &connect_ipv4(1, addr)).await;

        let mut expected = vec![5, 0, 5, 0, 0, 1, 127, 0, 0, 1];
        expected.extend_from_slice(&addr.port().to_be_bytes());
        assert_eq!(reply, expected);

        match outcome.unwrap() {
            Negotiation::Relay(outbound) => assert_eq!(outbound.peer_addr().unwrap(), addr),
            Negotiation::NoRelay => panic!("expected a relay"),
        }
    }

    #[tokio::test]
    async fn offered_methods_are_discarded() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = target.local_addr().unwrap();

        let (outcome, reply) = exchange(&[5, 3, 0, 1, 2], &connect_ipv4(1, addr)).await;

        assert_eq!(&reply[..2], &[5, 0]);
        assert_eq!(reply[3], 0);
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn refused_connect_reports_failure() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let (outcome, reply) = exchange(&[5, 1, 0], &connect_ipv4(1, addr)).await;

        assert_eq!(reply.len(), 12);
        assert_eq!(&reply[2..6], &[5, 1, 0, 1]);
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn domain_connect_echoes_resolved_address() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();

        let (outcome, reply) = exchange(&[5, 1, 0], &connect_domain("localhost", port)).await;

        let mut expected = vec![5, 0, 5, 0, 0, 1, 127, 0, 0, 1];
        expected.extend_from_slice(&port.to_be_bytes());
        assert_eq!(reply, expected);
        assert!(matches!(outcome.unwrap(), Negotiation::Relay(_)));
    }

    #[tokio::test]
    async fn unresolvable_domain_gets_no_reply() {
        let (outcome, reply) =
            exchange(&[5, 1, 0], &connect_domain("no-such-host.invalid", 80)).await;

        // Only the method selection was ever sent
        assert_eq!(reply, vec![5, 0]);
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn udp_associate_is_refused() {
        let addr: SocketAddr = "127.0.0.1:53".parse().unwrap();
        let (outcome, reply) = exchange(&[5, 1, 0], &connect_ipv4(3, addr)).await;

        assert_eq!(reply, vec![5, 0]);
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn unknown_address_type_fails() {
        let (outcome, reply) = exchange(&[5, 1, 0], &[5, 1, 0, 4, 0, 0]).await;

        assert_eq!(reply, vec![5, 0]);
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn wrong_request_version_fails() {
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let mut req = connect_ipv4(1, addr);
        req[0] = 4;

        let (outcome, reply) = exchange(&[5, 1, 0], &req).await;

        assert_eq!(reply, vec![5, 0]);
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn bind_replies_twice_and_relays_the_accepted_peer() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bind_addr = probe.local_addr().unwrap();
        drop(probe);

        let (mut client, mut inbound) = socket_pair().await;
        client.write_all(&[5, 1, 0]).await.unwrap();
        client.write_all(&connect_ipv4(2, bind_addr)).await.unwrap();

        let negotiation = tokio::spawn(async move {
            let outcome = negotiate_any(&mut inbound, &ConnectionDescriptor::default()).await;
            (outcome, inbound)
        });

        let mut first = [0u8; 12];
        client.read_exact(&mut first).await.unwrap();
        assert_eq!(&first[..2], &[5, 0]);
        assert_eq!(&first[2..6], &[5, 0, 0, 1]);
        assert_eq!(&first[6..10], &[127, 0, 0, 1]);
        assert_eq!(&first[10..12], &bind_addr.port().to_be_bytes());

        let incoming = tokio::net::TcpStream::connect(bind_addr).await.unwrap();
        let SocketAddr::V4(incoming_addr) = incoming.local_addr().unwrap() else {
            panic!("IPv4 only");
        };

        let mut second = [0u8; 10];
        client.read_exact(&mut second).await.unwrap();
        assert_eq!(&second[..4], &[5, 0, 0, 1]);
        assert_eq!(&second[4..8], &incoming_addr.ip().octets());
        assert_eq!(&second[8..10], &incoming_addr.port().to_be_bytes());

        let (outcome, _inbound) = negotiation.await.unwrap();
        match outcome.unwrap() {
            Negotiation::Relay(outbound) => {
                assert_eq!(outbound.peer_addr().unwrap(), SocketAddr::V4(incoming_addr));
            }
            Negotiation::NoRelay => panic!("expected a relay"),
        }
    }
}
