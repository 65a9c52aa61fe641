//! Stream abstraction shared by the orchestrator and the fallback listener
//!
//! Both personalities of the port (proxy and fallback) see the same boxed stream
//! type, so the fallback consumer never learns which concrete transport or
//! wrapper produced a connection.

use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Unified transport stream trait combining AsyncRead + AsyncWrite + Send + Unpin
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Unified transport stream type
pub type TransportStream = Pin<Box<dyn AsyncStream>>;

/// Connection metadata
#[derive(Debug, Clone, Copy)]
pub struct ConnectionMeta {
    /// Client peer address
    pub peer_addr: SocketAddr,
}

impl ConnectionMeta {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self { peer_addr }
    }
}
