//! In-process duplex transport built on tokio mpsc channels.

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;
use crate::transport::TransportError;

/// A duplex channel transport.
///
/// Frames sent on one end appear on the other end's `recv()` and vice versa.
/// Used to link two runtimes living in the same process.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelTransport {
    /// Creates a transport from separate tx and rx channels.
    pub fn new(
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }

    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(TransportError::ConnectionLost("Channel closed locally".into()));
        };
        tx.send(payload.to_vec())
            .map_err(|_| TransportError::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) -> transport::Result<()> {
        // Dropping the sender ends the remote receiver's stream.
        self.tx.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_duplex() {
        let (a, b) = ChannelTransport::pair();
        a.send(b"ping").await.unwrap();
        b.send(b"pong").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(b"ping".to_vec()));
        assert_eq!(a.recv().await.unwrap(), Some(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn test_close_ends_remote_stream() {
        let (a, b) = ChannelTransport::pair();
        a.close().await.unwrap();
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(a.send(b"late").await.is_err());
    }
}
