//! Configuration module
//!
//! CLI arguments (with environment variable fallbacks) point at a TOML file
//! that describes the listener, credentials, TLS material and tuning knobs.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::{Deserialize, Deserializer};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{Credential, MemoryAuthenticator, DEFAULT_SHUTDOWN_WAIT};
use crate::logger::LogLevel;
use crate::utils::password_to_hex;

/// Smallest accepted relay buffer
const MIN_BUFFER_SIZE: usize = 1024;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// CLI arguments
///
/// Supports environment variables with TROJAN_CLOAK_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Camouflaged TLS tunnel proxy")]
pub struct CliArgs {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long = "config", env = "TROJAN_CLOAK_CONFIG")]
    pub config: PathBuf,

    /// Log level override: trace, debug, info, warn, error
    #[arg(long, env = "TROJAN_CLOAK_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(short = 't', long = "test")]
    pub test: bool,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnConfig {
    /// TLS handshake timeout
    pub tls_handshake_timeout: Duration,
    /// Bound on reading the handshake header
    pub request_timeout: Duration,
    /// TCP connect timeout to target server
    pub connect_timeout: Duration,
    /// Grace window for the other relay direction once one ends
    pub relay_shutdown_wait: Duration,
    /// Bound on queueing a connection for the fallback consumer
    pub fallback_handoff_timeout: Duration,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// TCP listen backlog
    pub backlog: i32,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            tls_handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            relay_shutdown_wait: DEFAULT_SHUTDOWN_WAIT,
            fallback_handoff_timeout: Duration::from_secs(5),
            buffer_size: 32 * 1024,
            backlog: 1024,
        }
    }
}

/// `[ssl]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SslConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,
}

fn default_alpn() -> Vec<String> {
    vec!["h2".to_string(), "http/1.1".to_string()]
}

/// `[tcp]` section; every field falls back to [`ConnConfig::default`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub tls_handshake_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub relay_shutdown_wait: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub fallback_handoff_timeout: Duration,
    pub buffer_size: usize,
    pub backlog: i32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        let conn = ConnConfig::default();
        Self {
            tls_handshake_timeout: conn.tls_handshake_timeout,
            request_timeout: conn.request_timeout,
            connect_timeout: conn.connect_timeout,
            relay_shutdown_wait: conn.relay_shutdown_wait,
            fallback_handoff_timeout: conn.fallback_handoff_timeout,
            buffer_size: conn.buffer_size,
            backlog: conn.backlog,
        }
    }
}

/// `[log]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default().as_str().to_string(),
        }
    }
}

/// Server configuration file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    pub local_port: u16,
    /// Plaintext passwords, hashed once at load
    #[serde(default)]
    pub password: Vec<String>,
    /// Pre-hashed 56-character hex credentials
    #[serde(default)]
    pub password_hashes: Vec<String>,
    /// Upstream web server (`host:port`) that receives unauthenticated traffic
    pub fallback_addr: String,
    pub ssl: SslConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_local_addr() -> String {
    "0.0.0.0".to_string()
}

impl Config {
    /// Read and parse a TOML file. Does not validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.password.is_empty() && self.password_hashes.is_empty() {
            return Err(anyhow!("at least one password or password hash is required"));
        }
        if self.local_port == 0 {
            return Err(anyhow!("local_port must be greater than 0"));
        }
        self.listen_addr()?;

        if !host_port_valid(&self.fallback_addr) {
            return Err(anyhow!(
                "fallback_addr must be host:port, got '{}'",
                self.fallback_addr
            ));
        }

        if self.ssl.cert.as_os_str().is_empty() {
            return Err(anyhow!("ssl.cert is required"));
        }
        if self.ssl.key.as_os_str().is_empty() {
            return Err(anyhow!("ssl.key is required"));
        }
        if !self.ssl.cert.exists() {
            return Err(anyhow!(
                "TLS certificate file not found: {}",
                self.ssl.cert.display()
            ));
        }
        if !self.ssl.key.exists() {
            return Err(anyhow!(
                "TLS private key file not found: {}",
                self.ssl.key.display()
            ));
        }

        let tcp = &self.tcp;
        if tcp.buffer_size < MIN_BUFFER_SIZE {
            return Err(anyhow!("tcp.buffer_size must be at least {}", MIN_BUFFER_SIZE));
        }
        if tcp.backlog <= 0 {
            return Err(anyhow!("tcp.backlog must be greater than 0"));
        }
        for (name, value) in [
            ("tls_handshake_timeout", tcp.tls_handshake_timeout),
            ("request_timeout", tcp.request_timeout),
            ("connect_timeout", tcp.connect_timeout),
            ("relay_shutdown_wait", tcp.relay_shutdown_wait),
            ("fallback_handoff_timeout", tcp.fallback_handoff_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("tcp.{} must be greater than 0", name));
            }
        }

        if LogLevel::parse(&self.log.level).is_none() {
            return Err(anyhow!("unknown log level '{}'", self.log.level));
        }

        self.authenticator()?;
        Ok(())
    }

    /// Socket address to bind
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        (self.local_addr.as_str(), self.local_port)
            .to_socket_addrs()
            .with_context(|| format!("invalid local_addr '{}'", self.local_addr))?
            .next()
            .ok_or_else(|| anyhow!("local_addr '{}' resolved to nothing", self.local_addr))
    }

    /// Build the credential set from plaintext and pre-hashed entries
    pub fn authenticator(&self) -> Result<MemoryAuthenticator> {
        let mut credentials: Vec<Credential> = self
            .password
            .iter()
            .map(|pw| Credential::new(password_to_hex(pw)))
            .collect();
        for hash in &self.password_hashes {
            let credential = Credential::from_hex(hash)
                .with_context(|| format!("invalid password hash '{}'", hash))?;
            credentials.push(credential);
        }
        Ok(MemoryAuthenticator::new(credentials))
    }

    pub fn conn_config(&self) -> ConnConfig {
        ConnConfig {
            tls_handshake_timeout: self.tcp.tls_handshake_timeout,
            request_timeout: self.tcp.request_timeout,
            connect_timeout: self.tcp.connect_timeout,
            relay_shutdown_wait: self.tcp.relay_shutdown_wait,
            fallback_handoff_timeout: self.tcp.fallback_handoff_timeout,
            buffer_size: self.tcp.buffer_size,
            backlog: self.tcp.backlog,
        }
    }

    /// Configured level, or the default when it does not parse
    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.log.level).unwrap_or_default()
    }
}

fn host_port_valid(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p != 0),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Authenticator;

    struct Fixture {
        _dir: tempfile::TempDir,
        cert: PathBuf,
        key: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "cert").unwrap();
        std::fs::write(&key, "key").unwrap();
        Fixture {
            _dir: dir,
            cert,
            key,
        }
    }

    fn minimal_toml(f: &Fixture) -> String {
        format!(
            r#"
local_port = 8443
password = ["secret"]
fallback_addr = "127.0.0.1:80"

[ssl]
cert = "{}"
key = "{}"
"#,
            f.cert.display(),
            f.key.display()
        )
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let f = fixture();
        let config = Config::parse(&minimal_toml(&f)).unwrap();
        config.validate().unwrap();

        assert_eq!(config.local_addr, "0.0.0.0");
        assert_eq!(config.ssl.alpn, vec!["h2", "http/1.1"]);
        assert_eq!(config.conn_config(), ConnConfig::default());
        assert_eq!(config.log_level(), LogLevel::Info);
        assert_eq!(
            config.listen_addr().unwrap(),
            "0.0.0.0:8443".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_full_config() {
        let f = fixture();
        let hashed = String::from_utf8(password_to_hex("other").to_vec()).unwrap();
        let content = format!(
            r#"
local_addr = "127.0.0.1"
local_port = 443
password = ["secret", "secret"]
password_hashes = ["{hashed}"]
fallback_addr = "localhost:8080"

[ssl]
cert = "{cert}"
key = "{key}"
alpn = ["http/1.1"]

[tcp]
tls_handshake_timeout = "3s"
request_timeout = "2s"
connect_timeout = "1m"
relay_shutdown_wait = "500ms"
fallback_handoff_timeout = "7"
buffer_size = 4096
backlog = 16

[log]
level = "debug"
"#,
            hashed = hashed,
            cert = f.cert.display(),
            key = f.key.display()
        );
        let config = Config::parse(&content).unwrap();
        config.validate().unwrap();

        let conn = config.conn_config();
        assert_eq!(conn.tls_handshake_timeout, Duration::from_secs(3));
        assert_eq!(conn.connect_timeout, Duration::from_secs(60));
        assert_eq!(conn.relay_shutdown_wait, Duration::from_millis(500));
        assert_eq!(conn.fallback_handoff_timeout, Duration::from_secs(7));
        assert_eq!(conn.buffer_size, 4096);
        assert_eq!(conn.backlog, 16);
        assert_eq!(config.log_level(), LogLevel::Debug);

        let auth = config.authenticator().unwrap();
        assert_eq!(auth.len(), 2);
        assert!(auth.authenticate(&password_to_hex("secret")).is_some());
        assert!(auth.authenticate(&password_to_hex("other")).is_some());
    }

    #[test]
    fn test_no_credentials_rejected() {
        let f = fixture();
        let content = minimal_toml(&f).replace(r#"password = ["secret"]"#, "");
        let err = Config::parse(&content).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_missing_cert_file_rejected() {
        let f = fixture();
        let mut config = Config::parse(&minimal_toml(&f)).unwrap();
        config.ssl.cert = PathBuf::from("/nonexistent/cert.pem");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("certificate file not found"));
    }

    #[test]
    fn test_small_buffer_and_zero_duration_rejected() {
        let f = fixture();
        let mut config = Config::parse(&minimal_toml(&f)).unwrap();
        config.tcp.buffer_size = 512;
        assert!(config.validate().is_err());

        let mut config = Config::parse(&minimal_toml(&f)).unwrap();
        config.tcp.request_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("request_timeout"));
    }

    #[test]
    fn test_bad_password_hash_rejected() {
        let f = fixture();
        let mut config = Config::parse(&minimal_toml(&f)).unwrap();
        config.password_hashes.push("abc".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_fallback_addr_rejected() {
        let f = fixture();
        let mut config = Config::parse(&minimal_toml(&f)).unwrap();
        config.fallback_addr = "127.0.0.1".to_string();
        assert!(config.validate().is_err());
        config.fallback_addr = "[::1]:80".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_field_rejected() {
        let f = fixture();
        let content = format!("{}\nweb_root = \"/var/www\"\n", minimal_toml(&f));
        assert!(Config::parse(&content).is_err());
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let f = fixture();
        let content = format!("{}\n[tcp]\nrequest_timeout = \"soon\"\n", minimal_toml(&f));
        let err = Config::parse(&content).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid duration"));
    }

    #[test]
    fn test_load_from_file() {
        let f = fixture();
        let path = f.cert.parent().unwrap().join("config.toml");
        std::fs::write(&path, minimal_toml(&f)).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.local_port, 8443);

        let err = Config::load(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn test_cli_args() {
        let cli = CliArgs::try_parse_from(["trojan-cloak", "-c", "/etc/cloak.toml", "-t"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/cloak.toml"));
        assert!(cli.test);
        assert!(cli.log_level.is_none());
    }
}
