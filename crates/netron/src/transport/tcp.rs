//! # TCP Transport
//!
//! Frames are a big-endian `u32` length followed by the payload bytes.

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use crate::transport;
use crate::transport::Transport;
use crate::transport::TransportError;

/// Largest frame accepted in either direction.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A length-prefixed framing over a tokio TCP stream.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    /// Opens a connection to `addr`.
    pub async fn connect(addr: impl ToSocketAddrs) -> transport::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        let mut writer = self.writer.lock().await;
        writer.write_u32(payload.len() as u32).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > MAX_FRAME_LEN {
            return Err(TransportError::PayloadTooLarge(len));
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    async fn close(&self) -> transport::Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}
