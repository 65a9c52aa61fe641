//! Trojan proxy server with a camouflage fallback
//!
//! Architecture:
//! - `core/`: Protocol codec, capture-and-replay streams, relays and the server
//! - `transport`: Stream abstraction shared by the proxy and fallback paths
//! - `handler`: Per-connection processing
//! - `fallback`: Forwarder that serves failed-auth connections from a real web server
//! - `config`, `tls`, `logger`: Ambient setup used by the binary

pub mod config;
pub mod core;
pub mod error;
pub mod fallback;
pub mod handler;
pub mod logger;
pub mod tls;
pub mod transport;
pub mod utils;

pub use error::{Error, Result};
