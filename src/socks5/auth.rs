use crate::socks5::protocol::{AuthMethod, Version};
use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// negotiate_auth consumes the client's method list and always selects
/// "no authentication required". The version byte has already been read
pub async fn negotiate_auth(stream: &mut TcpStream) -> Result<()> {
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 0 to 255 |
    // +----+----------+----------+

    let n_methods = stream
        .read_u8()
        .await
        .context("failed to read SOCKS5 method count")?;

    // Methods are discarded; nothing but no-auth is offered
    let mut methods = vec![0u8; n_methods as usize];
    stream
        .read_exact(&mut methods)
        .await
        .context("failed to read SOCKS5 methods")?;
    trace!("client offered methods {methods:?}");

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+

    stream
        .write_all(&[Version::SOCKS5 as u8, AuthMethod::NoAuth as u8])
        .await
        .context("failed to send SOCKS5 method selection")?;

    Ok(())
}
