use std::fmt;
use std::io;
use thiserror::Error;

/// Direction of a relay copy loop.
///
/// `LeftToRight` carries what the client sent to the target, `RightToLeft`
/// carries what the target sent back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LeftToRight,
    RightToLeft,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LeftToRight => write!(f, "left->right"),
            Direction::RightToLeft => write!(f, "right->left"),
        }
    }
}

/// Error taxonomy shared by the codec, relay engine and orchestrator
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or truncated wire data
    #[error("framing error: {0}")]
    Framing(String),

    /// Credential not in the configured set. Routed to the fallback.
    #[error("authentication failed")]
    AuthFailure,

    /// Target could not be reached
    #[error("dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure in the middle of a relay
    #[error("relay {direction}: {source}")]
    Relay {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// The fallback listener has been closed
    #[error("listener closed")]
    ListenerClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn framing(msg: impl Into<String>) -> Self {
        Error::Framing(msg.into())
    }

    /// Expected outcomes that must not be reported as faults.
    pub fn is_expected(&self) -> bool {
        matches!(self, Error::AuthFailure | Error::ListenerClosed)
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}
