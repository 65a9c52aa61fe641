//! In-memory credential set

use super::hooks::{Authenticator, Credential};
use crate::utils::password_to_hex;

/// Authenticator over a fixed, ordered credential set.
///
/// Passwords are hashed once at construction; `authenticate` only compares bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuthenticator {
    credentials: Vec<Credential>,
}

impl MemoryAuthenticator {
    /// Build from already hashed credentials. Duplicates are dropped, order kept.
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let mut set: Vec<Credential> = Vec::new();
        for cred in credentials {
            if !set.contains(&cred) {
                set.push(cred);
            }
        }
        Self { credentials: set }
    }

    /// Build from plaintext passwords, hashing each one to its wire token.
    pub fn from_passwords(passwords: &[String]) -> Self {
        Self::new(
            passwords
                .iter()
                .map(|pw| Credential::new(password_to_hex(pw))),
        )
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

impl Authenticator for MemoryAuthenticator {
    fn authenticate(&self, candidate: &[u8]) -> Option<Credential> {
        self.credentials
            .iter()
            .find(|cred| cred.as_bytes().as_slice() == candidate)
            .copied()
    }
}
