//! TLS server configuration from PEM files

use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::logger::log;

/// Load a certificate chain and private key into a ready-to-use server config.
///
/// Encrypted private keys are not supported.
pub fn load_tls_config(cert_path: &Path, key_path: &Path, alpn: &[String]) -> Result<Arc<ServerConfig>> {
    let cert_file = File::open(cert_path)
        .map_err(|e| Error::Tls(format!("open {}: {}", cert_path.display(), e)))?;
    let mut reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("read {}: {}", cert_path.display(), e)))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path)
        .map_err(|e| Error::Tls(format!("open {}: {}", key_path.display(), e)))?;
    let mut reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Tls(format!("read {}: {}", key_path.display(), e)))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", key_path.display())))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // Session tickets let returning clients skip the full handshake
    if let Ok(ticketer) = rustls::crypto::ring::Ticketer::new() {
        config.ticketer = ticketer;
    }
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    log::debug!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        alpn = ?alpn,
        "TLS configuration loaded"
    );

    Ok(Arc::new(config))
}
