use crate::{
    negotiate::{ConnectionDescriptor, prepare_outbound},
    socks5::protocol::{AddressType, RSV, ReplyCode, Version},
};
use anyhow::{Context, Result, anyhow, bail};
use std::net::{SocketAddr, SocketAddrV4};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpSocket, TcpStream},
};
use tracing::{debug, warn};

// ================
// CONNECT COMMAND
// ================

/// handle_connect_cmd connects to the requested target and reports the
/// outcome. The reply echoes the requested address and port, not the
/// outbound socket's local address
pub async fn handle_connect_cmd(
    stream: &mut TcpStream,
    target: SocketAddrV4,
    conn: &ConnectionDescriptor,
) -> Result<TcpStream> {
    let socket = prepare_outbound(conn)?;

    match socket.connect(SocketAddr::V4(target)).await {
        Ok(outbound) => {
            send_reply(stream, ReplyCode::Succeeded, target).await?;
            Ok(outbound)
        }
        Err(e) => {
            warn!("connect to {target} failed: {e}");
            send_reply(stream, ReplyCode::ServerFailure, target).await?;
            Err(anyhow!(e).context(format!("connect to {target} failed")))
        }
    }
}

// =============
// BIND COMMAND
// =============

/// handle_bind_cmd listens on the address the client asked for, reports
/// success, then waits for exactly one inbound connection and reports its
/// peer. The accepted stream becomes the outbound side
pub async fn handle_bind_cmd(stream: &mut TcpStream, target: SocketAddrV4) -> Result<TcpStream> {
    let socket = TcpSocket::new_v4().context("socket()")?;
    socket
        .bind(SocketAddr::V4(target))
        .with_context(|| format!("failed to bind {target}"))?;
    let listener = socket.listen(1).context("listen()")?;

    send_reply(stream, ReplyCode::Succeeded, target).await?;

    let (accepted, peer) = listener.accept().await.context("accept()")?;
    debug!("BIND on {target} accepted {peer}");

    let SocketAddr::V4(peer) = peer else {
        bail!("BIND accepted non-IPv4 peer {peer}");
    };
    send_reply(stream, ReplyCode::Succeeded, peer).await?;

    Ok(accepted)
}

// =========
// HELPERS
// =========

/// send_reply handles logic for sending replies from the SOCKS server to
/// the client
pub async fn send_reply(
    stream: &mut TcpStream,
    reply_code: ReplyCode,
    addr: SocketAddrV4,
) -> Result<()> {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   |    4     |    2     |
    // +----+-----+-------+------+----------+----------+

    let mut reply = [0u8; 10];
    reply[0] = Version::SOCKS5 as u8;
    reply[1] = reply_code as u8;
    reply[2] = RSV;
    reply[3] = AddressType::IPv4 as u8;
    reply[4..8].copy_from_slice(&addr.ip().octets());
    reply[8..10].copy_from_slice(&addr.port().to_be_bytes());

    stream
        .write_all(&reply)
        .await
        .context("failed to send SOCKS5 reply")
}
