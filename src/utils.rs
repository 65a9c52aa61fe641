use sha2::{Digest, Sha224};

/// Length of a hex-encoded SHA-224 digest
pub const HEX_SHA224_LEN: usize = 56;

/// Hash password using SHA224
pub fn hash_password(password: &str) -> [u8; 28] {
    let mut hasher = Sha224::new();
    hasher.update(password.as_bytes());
    let result = hasher.finalize();
    let mut hash = [0u8; 28];
    hash.copy_from_slice(&result);
    hash
}

/// Convert password to the 56-byte hex token clients put on the wire
pub fn password_to_hex(password: &str) -> [u8; HEX_SHA224_LEN] {
    let hash = hash_password(password);
    let hex_string = hex::encode(hash);
    let mut hex_bytes = [0u8; HEX_SHA224_LEN];
    hex_bytes.copy_from_slice(hex_string.as_bytes());
    hex_bytes
}
