use crate::protocol::{CodecError, LineReader, MessageCodec, TunnelMessage};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Physical transport behind a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Quic,
    WebSocket,
    Memory,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Quic => write!(f, "quic"),
            TransportKind::WebSocket => write!(f, "websocket"),
            TransportKind::Memory => write!(f, "memory"),
        }
    }
}

/// Write half of a tunnel. Callers serialize access; implementations may
/// assume a single writer.
#[async_trait]
pub trait TunnelWriter: Send {
    async fn send_message(&mut self, message: &TunnelMessage) -> Result<(), CodecError>;

    /// Best-effort close of the write direction
    async fn shutdown(&mut self);
}

/// Read half of a tunnel
#[async_trait]
pub trait TunnelReader: Send {
    /// Next envelope, `None` once the peer has closed the tunnel
    async fn next_message(&mut self) -> Result<Option<TunnelMessage>, CodecError>;
}

/// Newline-delimited JSON writer over any byte sink
pub struct LineWriter<W> {
    inner: W,
}

impl<W> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> TunnelWriter for LineWriter<W> {
    async fn send_message(&mut self, message: &TunnelMessage) -> Result<(), CodecError> {
        let line = MessageCodec::encode(message)?;
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> TunnelReader for LineReader<R> {
    async fn next_message(&mut self) -> Result<Option<TunnelMessage>, CodecError> {
        LineReader::next_message(self).await
    }
}

pub type BoxedTunnelReader = Box<dyn TunnelReader>;
pub type BoxedTunnelWriter = Box<dyn TunnelWriter>;

/// Frame a QUIC bidirectional stream as a tunnel
pub fn quic_tunnel(
    send: quinn::SendStream,
    recv: quinn::RecvStream,
) -> (BoxedTunnelReader, BoxedTunnelWriter) {
    (
        Box::new(LineReader::new(recv)),
        Box::new(LineWriter::new(send)),
    )
}

/// Frame any duplex byte stream as a tunnel
pub fn split_tunnel<S>(io: S) -> (BoxedTunnelReader, BoxedTunnelWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(io);
    (
        Box::new(LineReader::new(read)),
        Box::new(LineWriter::new(write)),
    )
}
