//! Core proxy server module
//!
//! This module contains the core proxy functionality:
//! - Protocol codec (handshake, addresses, UDP frames)
//! - Credential checks
//! - Capture-and-replay streams and the fallback listener
//! - TCP and UDP relays
//! - The server accept loop

mod auth;
mod fallback;
pub mod hooks;
mod peek;
mod protocol;
mod relay;
mod server;
mod udp;

pub use auth::MemoryAuthenticator;
pub use fallback::{channel, FallbackListener, FallbackSender};
pub use hooks::{Authenticator, Credential};
pub use peek::PeekableStream;
pub use protocol::{read_credential, Address, Command, Request, UdpPacket, CRLF};
pub use relay::{relay_tcp, RelayResult, DEFAULT_SHUTDOWN_WAIT};
pub use server::{Server, ServerBuilder};
pub use udp::relay_udp;
