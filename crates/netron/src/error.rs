//! # Error Definitions
//!
//! Every failure the remote-object layer can report. The variants mirror the
//! kinds a caller is expected to branch on; `WireError` is the form they take
//! when they have to cross a peer boundary.

use serde::Deserialize;
use serde::Serialize;

use crate::transport::TransportError;

/// Failures of the remote-object layer.
#[derive(Debug)]
pub enum Error {
    /// A member, context, task or definition does not exist.
    NotExists(String),
    /// Write attempted on a read-only property.
    InvalidAccess(String),
    /// A definition id or peer id with no registration behind it.
    Unknown(String),
    /// The caller passed something of the wrong kind.
    NotValid(String),
    /// A peer variant does not provide this operation.
    NotImplemented(String),
    /// A name is already taken.
    Exists(String),
    /// The peer is disconnected or the runtime is gone.
    IllegalState(String),
    /// Raised by the wrapped context instance itself.
    Context(anyhow::Error),
    /// The transport failed to move bytes.
    Transport(TransportError),
    /// A packet could not be encoded or decoded.
    Codec(serde_json::Error),
    /// No reply arrived within the response timeout.
    Timeout,
}

/// The discriminant of an [`Error`], without its payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotExists,
    InvalidAccess,
    Unknown,
    NotValid,
    NotImplemented,
    Exists,
    IllegalState,
    Context,
    Transport,
    Codec,
    Timeout,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotExists(_) => ErrorKind::NotExists,
            Self::InvalidAccess(_) => ErrorKind::InvalidAccess,
            Self::Unknown(_) => ErrorKind::Unknown,
            Self::NotValid(_) => ErrorKind::NotValid,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::Exists(_) => ErrorKind::Exists,
            Self::IllegalState(_) => ErrorKind::IllegalState,
            Self::Context(_) => ErrorKind::Context,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Codec(_) => ErrorKind::Codec,
            Self::Timeout => ErrorKind::Timeout,
        }
    }

    pub(crate) fn not_implemented(operation: &str) -> Self {
        Self::NotImplemented(format!("Method '{}' is not implemented", operation))
    }

    pub(crate) fn disconnected(peer_id: &str) -> Self {
        Self::IllegalState(format!("Peer '{}' is not connected", peer_id))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotExists(msg) => write!(f, "Not exists: {}", msg),
            Self::InvalidAccess(msg) => write!(f, "Invalid access: {}", msg),
            Self::Unknown(msg) => write!(f, "Unknown: {}", msg),
            Self::NotValid(msg) => write!(f, "Not valid: {}", msg),
            Self::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Self::Exists(msg) => write!(f, "Exists: {}", msg),
            Self::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            Self::Context(e) => write!(f, "{:#}", e),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
            Self::Timeout => write!(f, "Response timed out"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An [`Error`] flattened for transmission to a remote peer.
///
/// The receiving side rebuilds an error of the same kind, so a caller on the
/// far end of a connection can branch on it exactly as a local caller would.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        let message = match e {
            Error::NotExists(msg)
            | Error::InvalidAccess(msg)
            | Error::Unknown(msg)
            | Error::NotValid(msg)
            | Error::NotImplemented(msg)
            | Error::Exists(msg)
            | Error::IllegalState(msg) => msg.clone(),
            other => other.to_string(),
        };
        Self { kind: e.kind(), message }
    }
}

impl From<WireError> for Error {
    fn from(w: WireError) -> Self {
        match w.kind {
            ErrorKind::NotExists => Self::NotExists(w.message),
            ErrorKind::InvalidAccess => Self::InvalidAccess(w.message),
            ErrorKind::Unknown => Self::Unknown(w.message),
            ErrorKind::NotValid => Self::NotValid(w.message),
            ErrorKind::NotImplemented => Self::NotImplemented(w.message),
            ErrorKind::Exists => Self::Exists(w.message),
            ErrorKind::IllegalState => Self::IllegalState(w.message),
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::Transport => Self::Transport(TransportError::Io(w.message)),
            // Codec and context failures lose their concrete type on the wire.
            ErrorKind::Context | ErrorKind::Codec => Self::Context(anyhow::Error::msg(w.message)),
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
