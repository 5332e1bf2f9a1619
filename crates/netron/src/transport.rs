//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes between peers.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about packets, values or
//!   definitions. It moves opaque, already framed buffers.
//! - **Full Duplex**: Either side may send at any time. Correlating replies
//!   with requests is the job of the peer sitting on top.

use std::fmt;

pub mod channel;
pub mod tcp;

pub use channel::ChannelTransport;
pub use tcp::TcpTransport;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The remote end is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// A frame exceeded the transport's size limit.
    PayloadTooLarge(usize),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::PayloadTooLarge(len) => write!(f, "Payload of {} bytes too large for transport", len),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A bidirectional stream of byte frames.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
///
/// # Invariants
/// - `send` delivers the whole frame or fails; frames are never split or merged.
/// - `recv` yields `Ok(None)` once the remote end has closed the stream.
/// - Implementations must not interpret the payload.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next frame. Only one task may be receiving at a time.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Shuts the outgoing direction down. The default does nothing.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
