//! UDP-over-stream relay for UDP_ASSOCIATE sessions
//!
//! One local UDP socket per session. Frames read from the tunnel are sent to
//! their decoded target; datagrams arriving on the socket are framed with
//! their source address and written back onto the tunnel.

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::protocol::{Address, UdpPacket};
use super::relay::RelayResult;
use crate::error::{Direction, Error, Result};
use crate::logger::log;

/// Largest datagram we can receive
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Bind a dual-stack socket on `[::]:0`, or `0.0.0.0:0` when IPv6 is unavailable.
fn bind_udp() -> io::Result<UdpSocket> {
    let dual_stack = || -> io::Result<Socket> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_only_v6(false)?;
        socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)).into())?;
        Ok(socket)
    };

    let socket = match dual_stack() {
        Ok(socket) => socket,
        Err(e) => {
            log::debug!(error = %e, "IPv6 UDP bind failed, using IPv4");
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
            socket
        }
    };
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Adapt `target` to the family of the local socket.
///
/// Returns `None` when an IPv6 target cannot be reached from an IPv4 socket.
fn target_for(local: SocketAddr, target: SocketAddr) -> Option<SocketAddr> {
    match (local, target) {
        (SocketAddr::V6(_), SocketAddr::V4(v4)) => {
            Some(SocketAddr::new(v4.ip().to_ipv6_mapped().into(), v4.port()))
        }
        (SocketAddr::V4(_), SocketAddr::V6(v6)) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddr::new(ip.into(), v6.port())),
        _ => Some(target),
    }
}

async fn tunnel_to_udp<R>(reader: &mut R, socket: &UdpSocket, sent: &mut u64) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let local = socket.local_addr()?;
    while let Some(packet) = UdpPacket::read_from(reader).await? {
        let resolved = match packet.addr.to_socket_addr().await {
            Ok(addr) => addr,
            Err(e) => {
                log::debug!(target_addr = %packet.addr, error = %e, "Failed to resolve UDP target address");
                continue;
            }
        };
        let Some(target) = target_for(local, resolved) else {
            log::debug!(target_addr = %resolved, "IPv6 UDP target unreachable from IPv4 socket");
            continue;
        };

        socket
            .send_to(&packet.payload, target)
            .await
            .map_err(|source| Error::Relay {
                direction: Direction::LeftToRight,
                source,
            })?;
        *sent += packet.payload.len() as u64;
    }
    Ok(())
}

async fn udp_to_tunnel<W>(socket: &UdpSocket, writer: &mut W, received: &mut u64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let relay_err = |source| Error::Relay {
        direction: Direction::RightToLeft,
        source,
    };

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut frame = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);
    loop {
        let (n, from) = socket.recv_from(&mut buf).await.map_err(relay_err)?;
        frame.clear();
        UdpPacket::encode(&Address::from(from), &buf[..n], &mut frame)?;
        writer.write_all(&frame).await.map_err(relay_err)?;
        writer.flush().await.map_err(relay_err)?;
        *received += n as u64;
    }
}

/// Relay UDP datagrams carried as frames on `tunnel`.
///
/// Ends cleanly on tunnel end of stream or when `cancel` fires.
pub async fn relay_udp<S>(tunnel: S, cancel: CancellationToken, buffer_size: usize) -> RelayResult
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let socket = match bind_udp() {
        Ok(socket) => socket,
        Err(e) => return RelayResult::failed(Error::Io(e)),
    };
    if let Ok(local) = socket.local_addr() {
        log::debug!(local = %local, "UDP relay socket bound");
    }

    let (reader, mut writer) = tokio::io::split(tunnel);
    let mut reader = BufReader::with_capacity(buffer_size, reader);

    let mut sent = 0u64;
    let mut received = 0u64;

    let result = tokio::select! {
        r = tunnel_to_udp(&mut reader, &socket, &mut sent) => r,
        r = udp_to_tunnel(&socket, &mut writer, &mut received) => r,
        _ = cancel.cancelled() => Ok(()),
    };

    RelayResult {
        received,
        sent,
        error: result.err(),
    }
}
