//! Connection handling logic
//!
//! Reads the handshake from a freshly accepted TLS stream while recording it,
//! decides between proxying and camouflage, and dispatches the command.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::ConnConfig;
use crate::core::{
    read_credential, relay_tcp, relay_udp, Address, Authenticator, Command, FallbackSender,
    PeekableStream, Request,
};
use crate::error::{Error, Result};
use crate::logger::log;
use crate::transport::ConnectionMeta;

/// State shared by every connection task of one server
pub struct ConnContext {
    pub authenticator: Arc<dyn Authenticator>,
    pub conn_config: ConnConfig,
    pub fallback: FallbackSender,
}

/// Process a single connection after the TLS handshake.
///
/// Returns [`Error::AuthFailure`] when the connection was handed to the
/// fallback consumer instead of being proxied.
pub async fn process_connection<S>(
    ctx: &ConnContext,
    stream: S,
    meta: ConnectionMeta,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let conn_config = &ctx.conn_config;
    let peer_addr = meta.peer_addr.to_string();
    let mut stream = PeekableStream::new(stream);

    stream.start_capture();
    let credential =
        match tokio::time::timeout(conn_config.request_timeout, read_credential(&mut stream)).await {
            Ok(Ok(credential)) => Some(credential),
            Ok(Err(e)) => {
                log::debug!(peer = %peer_addr, error = %e, "Short handshake");
                None
            }
            Err(_) => {
                log::debug!(peer = %peer_addr, "Handshake read timeout");
                None
            }
        };

    let authenticated = credential
        .as_ref()
        .and_then(|c| ctx.authenticator.authenticate(c));

    if authenticated.is_none() {
        log::authentication(&peer_addr, false);
        stream.stop_capture();
        ctx.fallback
            .hand_off(
                Box::pin(stream),
                meta.peer_addr,
                cancel,
                conn_config.fallback_handoff_timeout,
            )
            .await?;
        return Err(Error::AuthFailure);
    }
    log::authentication(&peer_addr, true);

    let request =
        match tokio::time::timeout(conn_config.request_timeout, Request::read_from(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "request read timed out",
                )))
            }
        };
    // The handshake belongs to us, not to the target
    stream.discard_capture();

    match request.command {
        Command::Connect => handle_connect(conn_config, stream, request.addr, &peer_addr).await,
        Command::UdpAssociate => {
            log::debug!(peer = %peer_addr, "Starting UDP associate");
            let result = relay_udp(stream, cancel.child_token(), conn_config.buffer_size).await;
            log::debug!(
                peer = %peer_addr,
                up = result.sent,
                down = result.received,
                "UDP relay finished"
            );
            result.into_result().map(|_| ())
        }
        Command::Unknown(cmd) => Err(Error::framing(format!("unknown command {:#04x}", cmd))),
    }
}

/// Dial the target within `connect_timeout`.
async fn dial(target: &Address, connect_timeout: std::time::Duration) -> Result<TcpStream> {
    let connect = async {
        let addr = target.to_socket_addr().await?;
        TcpStream::connect(addr).await
    };
    match tokio::time::timeout(connect_timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(Error::Dial {
            target: target.to_string(),
            source,
        }),
        Err(_) => Err(Error::Dial {
            target: target.to_string(),
            source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}

/// Handle TCP CONNECT command
async fn handle_connect<S>(
    conn_config: &ConnConfig,
    client_stream: S,
    target: Address,
    peer_addr: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = dial(&target, conn_config.connect_timeout).await?;
    log::debug!(peer = %peer_addr, target_addr = %target, "Connected to target");

    let result = relay_tcp(
        client_stream,
        remote,
        conn_config.relay_shutdown_wait,
        conn_config.buffer_size,
    )
    .await;
    log::debug!(
        peer = %peer_addr,
        target_addr = %target,
        up = result.sent,
        down = result.received,
        "Relay finished"
    );
    result.into_result().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{channel, FallbackListener, MemoryAuthenticator};
    use crate::utils::password_to_hex;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn context() -> (ConnContext, FallbackListener) {
        let (fallback, listener) = channel();
        let auth = MemoryAuthenticator::from_passwords(&["secret".to_string()]);
        let conn_config = ConnConfig {
            request_timeout: Duration::from_millis(300),
            relay_shutdown_wait: Duration::from_millis(200),
            fallback_handoff_timeout: Duration::from_millis(300),
            ..ConnConfig::default()
        };
        let ctx = ConnContext {
            authenticator: Arc::new(auth),
            conn_config,
            fallback,
        };
        (ctx, listener)
    }

    fn meta() -> ConnectionMeta {
        ConnectionMeta::new("127.0.0.1:50000".parse().unwrap())
    }

    fn handshake(password: &str, command: Command, addr: Address) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Request { command, addr }
            .encode(&password_to_hex(password), &mut buf)
            .unwrap();
        buf.to_vec()
    }

    async fn echo_target() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_relays_to_target() {
        let (ctx, _listener) = context();
        let target = echo_target().await;
        let (mut client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(async move { process_connection(&ctx, server, meta(), &cancel).await });

        let mut request = handshake("secret", Command::Connect, Address::from(target));
        request.extend_from_slice(b"hello target");
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hello target");

        client.shutdown().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok(), "unexpected error: {:?}", result);
    }

    #[tokio::test]
    async fn test_wrong_password_is_replayed_to_fallback() {
        let (ctx, listener) = context();
        let (mut client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();

        let request = handshake("wrong", Command::Connect, Address::IPv4([10, 0, 0, 1], 80));
        client.write_all(&request).await.unwrap();

        let task = tokio::spawn(async move { process_connection(&ctx, server, meta(), &cancel).await });

        let (mut fallback_stream, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, meta().peer_addr);

        client.write_all(b"more").await.unwrap();
        let mut seen = vec![0u8; request.len() + 4];
        fallback_stream.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen[..request.len()], &request[..]);
        assert_eq!(&seen[request.len()..], b"more");

        assert!(matches!(task.await.unwrap(), Err(Error::AuthFailure)));
    }

    #[tokio::test]
    async fn test_short_http_request_goes_to_fallback() {
        let (ctx, listener) = context();
        let (mut client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();

        // Shorter than a credential; the read times out and the bytes are replayed
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let task = tokio::spawn(async move { process_connection(&ctx, server, meta(), &cancel).await });

        let (mut fallback_stream, _) = listener.accept().await.unwrap();
        let mut seen = [0u8; 18];
        fallback_stream.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"GET / HTTP/1.1\r\n\r\n");
        assert!(matches!(task.await.unwrap(), Err(Error::AuthFailure)));
    }

    #[tokio::test]
    async fn test_unknown_command_aborts_without_fallback() {
        let (ctx, listener) = context();
        let (mut client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();

        let request = handshake("secret", Command::Unknown(0x7f), Address::IPv4([127, 0, 0, 1], 80));
        client.write_all(&request).await.unwrap();

        let result = process_connection(&ctx, server, meta(), &cancel).await;
        assert!(matches!(result, Err(Error::Framing(ref msg)) if msg.contains("0x7f")));

        let nothing = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(nothing.is_err(), "nothing should reach the fallback");
    }

    #[tokio::test]
    async fn test_truncated_request_after_auth_is_framing_error() {
        let (ctx, _listener) = context();
        let (mut client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();

        let request = handshake("secret", Command::Connect, Address::Domain("example.com".into(), 443));
        client.write_all(&request[..request.len() - 4]).await.unwrap();
        client.shutdown().await.unwrap();

        let result = process_connection(&ctx, server, meta(), &cancel).await;
        assert!(matches!(result, Err(Error::Framing(_))));
    }

    #[tokio::test]
    async fn test_dial_failure_names_target() {
        let (ctx, _listener) = context();
        let (mut client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();

        // Bind then drop to get a port with nothing listening
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let request = handshake("secret", Command::Connect, Address::from(closed));
        client.write_all(&request).await.unwrap();

        let result = process_connection(&ctx, server, meta(), &cancel).await;
        match result {
            Err(Error::Dial { target, .. }) => assert_eq!(target, closed.to_string()),
            other => panic!("expected dial error, got {:?}", other),
        }
    }
}
