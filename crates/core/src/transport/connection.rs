use quinn::Connection as QuinnConnection;
use std::net::SocketAddr;

/// A QUIC connection between the relay server and one exit node
#[derive(Debug, Clone)]
pub struct Connection {
    inner: QuinnConnection,
}

impl Connection {
    pub(crate) fn new(inner: QuinnConnection) -> Self {
        Self { inner }
    }

    /// Open the tunnel stream (exit-node side)
    pub async fn open_bi(&self) -> Result<(quinn::SendStream, quinn::RecvStream), ConnectionError> {
        self.inner
            .open_bi()
            .await
            .map_err(|e| ConnectionError::StreamOpen(e.to_string()))
    }

    /// Accept the tunnel stream (server side).
    ///
    /// Quinn only surfaces a stream once the peer has written to it, so exit
    /// agents open the tunnel with a ping.
    pub async fn accept_bi(&self) -> Result<(quinn::SendStream, quinn::RecvStream), ConnectionError> {
        self.inner
            .accept_bi()
            .await
            .map_err(|e| ConnectionError::StreamAccept(e.to_string()))
    }

    /// Peer address; the registry keys nodes by it
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    /// Negotiated ALPN protocol, if any
    pub fn alpn(&self) -> Option<Vec<u8>> {
        self.inner
            .handshake_data()?
            .downcast::<quinn::crypto::rustls::HandshakeData>()
            .ok()?
            .protocol
    }

    /// Close with an application error code the peer can read back
    pub fn close(&self, error_code: u32, reason: &str) {
        self.inner.close(error_code.into(), reason.as_bytes());
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to open stream: {0}")]
    StreamOpen(String),

    #[error("Failed to accept stream: {0}")]
    StreamAccept(String),
}
