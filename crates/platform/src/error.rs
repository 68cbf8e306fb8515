//! Error types for Skiff

use std::fmt;

/// RFC 4253 disconnect reason: protocol error.
pub const DISCONNECT_PROTOCOL_ERROR: u32 = 2;
/// RFC 4253 disconnect reason: key exchange failed.
pub const DISCONNECT_KEY_EXCHANGE_FAILED: u32 = 3;
/// RFC 4253 disconnect reason: MAC verification failed.
pub const DISCONNECT_MAC_ERROR: u32 = 5;
/// RFC 4253 disconnect reason: compression error.
pub const DISCONNECT_COMPRESSION_ERROR: u32 = 6;
/// RFC 4253 disconnect reason: the host key could not be verified.
pub const DISCONNECT_HOST_KEY_NOT_VERIFIABLE: u32 = 9;
/// RFC 4253 disconnect reason: the connection was lost.
pub const DISCONNECT_CONNECTION_LOST: u32 = 10;
/// RFC 4253 disconnect reason: disconnected by application.
pub const DISCONNECT_BY_APPLICATION: u32 = 11;

/// Unified error type for all Skiff operations
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Wire buffer underflow or overflow
    Buffer(String),

    /// Protocol violation (unexpected message, malformed packet)
    Protocol(String),

    /// MAC verification failure
    Mac(String),

    /// No common algorithm during negotiation
    Negotiation(String),

    /// Algorithm name not present in the registry
    UnknownAlgorithm(String),

    /// No host key verifier accepted the server's key
    HostKey(String),

    /// A blocking wait expired
    Timeout(String),

    /// The peer sent SSH_MSG_DISCONNECT
    Disconnected {
        /// Reason code from the peer.
        code: u32,
        /// Human-readable description from the peer.
        message: String,
    },
}

impl Error {
    /// Maps this error to the RFC 4253 disconnect reason code that should be
    /// reported to the peer, if any.
    ///
    /// I/O errors and peer-initiated disconnects return `None`: the
    /// connection is already gone, so no outbound DISCONNECT is attempted.
    pub fn disconnect_reason(&self) -> Option<u32> {
        match self {
            Error::Buffer(_) | Error::Protocol(_) => Some(DISCONNECT_PROTOCOL_ERROR),
            Error::Mac(_) => Some(DISCONNECT_MAC_ERROR),
            Error::Negotiation(_) | Error::UnknownAlgorithm(_) => {
                Some(DISCONNECT_KEY_EXCHANGE_FAILED)
            }
            Error::HostKey(_) => Some(DISCONNECT_HOST_KEY_NOT_VERIFIABLE),
            Error::Timeout(_) => Some(DISCONNECT_BY_APPLICATION),
            Error::Io(_) | Error::Disconnected { .. } | Error::Config(_) => None,
        }
    }

    /// Produces an equivalent error.
    ///
    /// The transport stores the first failure it observes and surfaces it to
    /// every blocked caller; `std::io::Error` is not `Clone`, so I/O errors
    /// are rebuilt from their kind and message.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Config(m) => Error::Config(m.clone()),
            Error::Buffer(m) => Error::Buffer(m.clone()),
            Error::Protocol(m) => Error::Protocol(m.clone()),
            Error::Mac(m) => Error::Mac(m.clone()),
            Error::Negotiation(m) => Error::Negotiation(m.clone()),
            Error::UnknownAlgorithm(m) => Error::UnknownAlgorithm(m.clone()),
            Error::HostKey(m) => Error::HostKey(m.clone()),
            Error::Timeout(m) => Error::Timeout(m.clone()),
            Error::Disconnected { code, message } => Error::Disconnected {
                code: *code,
                message: message.clone(),
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Buffer(msg) => write!(f, "Buffer error: {}", msg),
            Error::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Error::Mac(msg) => write!(f, "MAC error: {}", msg),
            Error::Negotiation(msg) => write!(f, "Negotiation failed: {}", msg),
            Error::UnknownAlgorithm(msg) => write!(f, "Unknown algorithm: {}", msg),
            Error::HostKey(msg) => write!(f, "Host key not verifiable: {}", msg),
            Error::Timeout(msg) => write!(f, "Timed out: {}", msg),
            Error::Disconnected { code, message } => {
                write!(f, "Disconnected by peer (code {}): {}", code, message)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

/// Result type for Skiff operations
pub type Result<T> = std::result::Result<T, Error>;
