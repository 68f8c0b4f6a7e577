use crate::{address::resolve_host, socks5::protocol::AddressType};
use anyhow::{Context, Result, anyhow};
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::{io::AsyncReadExt, net::TcpStream};
use tracing::debug;

/// parse_address_from_stream reads DST.ADDR and DST.PORT for the given
/// address type. Domain names are resolved to IPv4 before returning
pub async fn parse_address_from_stream(
    stream: &mut TcpStream,
    atyp: u8,
) -> Result<SocketAddrV4> {
    let ip = match AddressType::from_byte(atyp) {
        Some(AddressType::IPv4) => {
            let mut addr = [0u8; 4];
            stream
                .read_exact(&mut addr)
                .await
                .context("failed to read IPv4 address")?;
            Ipv4Addr::from(addr)
        }
        Some(AddressType::DomainName) => {
            // First octet in DomainName contains the number of
            // octets to follow
            let len = stream
                .read_u8()
                .await
                .context("failed to read domain length")?;

            let mut domain = vec![0u8; len as usize];
            stream
                .read_exact(&mut domain)
                .await
                .context("failed to read domain")?;
            let domain = String::from_utf8_lossy(&domain);

            let ip = resolve_host(&domain).await?;
            debug!("resolved {domain} to {ip}");
            ip
        }
        None => return Err(anyhow!("unsupported address type {atyp}")),
    };

    let port = stream.read_u16().await.context("failed to read port")?;

    Ok(SocketAddrV4::new(ip, port))
}
