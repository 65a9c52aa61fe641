//! Hook traits for extensibility
//!
//! The orchestrator only needs one collaborator from the outside world: something
//! that can tell whether a presented credential belongs to the configured set.

use std::fmt;

use crate::error::{Error, Result};
use crate::utils::HEX_SHA224_LEN;

/// A registered credential: the 56-byte hex SHA-224 token a client presents.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credential([u8; HEX_SHA224_LEN]);

impl Credential {
    pub fn new(token: [u8; HEX_SHA224_LEN]) -> Self {
        Self(token)
    }

    /// Parse an already hashed token (56 hex characters).
    pub fn from_hex(token: &str) -> Result<Self> {
        let bytes = token.as_bytes();
        if bytes.len() != HEX_SHA224_LEN || !bytes.iter().all(u8::is_ascii_hexdigit) {
            return Err(Error::Config(format!(
                "credential must be {} hex characters",
                HEX_SHA224_LEN
            )));
        }
        let mut raw = [0u8; HEX_SHA224_LEN];
        raw.copy_from_slice(&bytes.to_ascii_lowercase());
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; HEX_SHA224_LEN] {
        &self.0
    }
}

impl fmt::Debug for Credential {
    // Only a prefix, enough to tell users apart in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = std::str::from_utf8(&self.0[..8]).unwrap_or("????????");
        write!(f, "Credential({}…)", prefix)
    }
}

/// Authenticator trait for credential validation
///
/// Synchronous: the check is a scan over an in-memory set built at startup,
/// never an I/O operation.
pub trait Authenticator: Send + Sync {
    /// Returns the matching credential, or `None` if the candidate is not registered.
    fn authenticate(&self, candidate: &[u8]) -> Option<Credential>;
}
