//! Core proxy server implementation
//!
//! The Server owns the TCP listener, the TLS acceptor and the fallback
//! listener, and spawns one task per accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::fallback::{self, FallbackListener};
use super::hooks::Authenticator;
use crate::config::ConnConfig;
use crate::error::{Error, Result};
use crate::handler::{process_connection, ConnContext};
use crate::logger::log;
use crate::transport::ConnectionMeta;

/// Pause after a failed accept, so fd exhaustion does not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Core proxy server
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: TlsAcceptor,
    ctx: Arc<ConnContext>,
    fallback: FallbackListener,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Listener that receives connections failing authentication
    pub fn fallback_listener(&self) -> FallbackListener {
        self.fallback.clone()
    }

    /// Run the accept loop until `cancel` fires.
    ///
    /// On return the fallback listener is closed and the TCP listener dropped.
    /// Connections already being served keep running until their peers close.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        log::info!(
            address = %self.local_addr,
            backlog = self.ctx.conn_config.backlog,
            "Server started"
        );

        loop {
            let (stream, peer_addr) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!(error = %e, "Failed to accept connection");
                        if !accept_backoff(&cancel).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let acceptor = self.acceptor.clone();
            let ctx = Arc::clone(&self.ctx);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                handle_accepted(acceptor, ctx, stream, ConnectionMeta::new(peer_addr), cancel).await;
            });
        }

        self.fallback.close();
        log::info!(address = %self.local_addr, "Server stopped");
        Ok(())
    }
}

/// Sleep out the accept backoff. False when `cancel` fired first.
async fn accept_backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

/// TLS handshake, then hand the stream to the connection handler.
async fn handle_accepted(
    acceptor: TlsAcceptor,
    ctx: Arc<ConnContext>,
    stream: TcpStream,
    meta: ConnectionMeta,
    cancel: CancellationToken,
) {
    let peer_addr = meta.peer_addr.to_string();
    log::connection(&peer_addr, "new");

    let handshake = tokio::time::timeout(
        ctx.conn_config.tls_handshake_timeout,
        acceptor.accept(stream),
    )
    .await;

    let result = match handshake {
        Ok(Ok(tls_stream)) => {
            log::debug!(peer = %peer_addr, "TLS handshake successful");
            process_connection(&ctx, tls_stream, meta, &cancel).await
        }
        Ok(Err(e)) => {
            log::debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
            Ok(())
        }
        Err(_) => {
            log::debug!(peer = %peer_addr, "TLS handshake timeout");
            Ok(())
        }
    };

    match result {
        Ok(()) => {}
        Err(e) if e.is_expected() => log::debug!(peer = %peer_addr, reason = %e, "Connection not proxied"),
        Err(e) => log::warn!(peer = %peer_addr, error = %e, "Connection error"),
    }
    log::connection(&peer_addr, "closed");
}

/// Builder for constructing a Server
pub struct ServerBuilder {
    listen_addr: Option<SocketAddr>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    conn_config: ConnConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// Create a new server builder with default connection settings
    pub fn new() -> Self {
        Self {
            listen_addr: None,
            tls_config: None,
            authenticator: None,
            conn_config: ConnConfig::default(),
        }
    }

    /// Set the address to listen on
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Set TLS configuration
    pub fn tls_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Set authenticator
    pub fn authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(auth);
        self
    }

    /// Set connection configuration
    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = config;
        self
    }

    /// Bind the listener and build the server.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(self) -> Result<Server> {
        let listen_addr = self
            .listen_addr
            .ok_or_else(|| Error::Config("listen address is required".to_string()))?;
        let tls_config = self
            .tls_config
            .ok_or_else(|| Error::Config("TLS configuration is required".to_string()))?;
        let authenticator = self
            .authenticator
            .ok_or_else(|| Error::Config("authenticator is required".to_string()))?;

        let listener = bind_listener(listen_addr, self.conn_config.backlog)?;
        let local_addr = listener.local_addr()?;
        let (fallback_tx, fallback) = fallback::channel();

        Ok(Server {
            listener,
            local_addr,
            acceptor: TlsAcceptor::from(tls_config),
            ctx: Arc::new(ConnContext {
                authenticator,
                conn_config: self.conn_config,
                fallback: fallback_tx,
            }),
            fallback,
        })
    }
}

/// Bind TCP listener with SO_REUSEADDR for fast restarts
fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    // Allow immediate rebind after restart (skip TIME_WAIT)
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MemoryAuthenticator;

    fn tls_config() -> Arc<rustls::ServerConfig> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.cert.der().clone()], key)
            .unwrap();
        Arc::new(config)
    }

    fn authenticator() -> Arc<dyn Authenticator> {
        Arc::new(MemoryAuthenticator::from_passwords(&["secret".to_string()]))
    }

    #[tokio::test]
    async fn test_builder_requires_listen_addr() {
        let result = Server::builder()
            .tls_config(tls_config())
            .authenticator(authenticator())
            .bind();
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("listen address")));
    }

    #[tokio::test]
    async fn test_builder_requires_tls_and_authenticator() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let no_tls = Server::builder().listen_addr(addr).authenticator(authenticator()).bind();
        assert!(matches!(no_tls, Err(Error::Config(_))));

        let no_auth = Server::builder().listen_addr(addr).tls_config(tls_config()).bind();
        assert!(matches!(no_auth, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_reports_ephemeral_port() {
        let server = Server::builder()
            .listen_addr("127.0.0.1:0".parse().unwrap())
            .tls_config(tls_config())
            .authenticator(authenticator())
            .conn_config(ConnConfig {
                backlog: 16,
                ..ConnConfig::default()
            })
            .bind()
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(!server.fallback_listener().is_closed());
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel_and_closes_fallback() {
        let server = Server::builder()
            .listen_addr("127.0.0.1:0".parse().unwrap())
            .tls_config(tls_config())
            .authenticator(authenticator())
            .bind()
            .unwrap();
        let addr = server.local_addr();
        let fallback = server.fallback_listener();
        let cancel = CancellationToken::new();

        let serving = tokio::spawn(server.serve(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .expect("serve should return after cancel")
            .unwrap()
            .unwrap();
        assert!(matches!(fallback.accept().await, Err(Error::ListenerClosed)));

        // The listener is gone with the server
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_backoff_yields_to_cancel() {
        let cancel = CancellationToken::new();
        assert!(accept_backoff(&cancel).await);

        cancel.cancel();
        let resumed = tokio::time::timeout(ACCEPT_ERROR_BACKOFF / 4, accept_backoff(&cancel))
            .await
            .expect("cancel must cut the backoff short");
        assert!(!resumed);
    }
}
