use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::Endpoint as QuinnEndpoint;
use relaymesh_common::config::protocol;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// QUIC endpoint carrying exit-node tunnels
pub struct Endpoint {
    /// Quinn endpoint
    inner: QuinnEndpoint,

    /// Local address
    local_addr: SocketAddr,
}

impl Endpoint {
    /// Bind a server endpoint that accepts exit-node tunnels.
    ///
    /// The endpoint can also dial out, which the exit agent and the tests use.
    pub async fn new(config: EndpointConfig) -> Result<Self, EndpointError> {
        let server_config = Self::create_server_config()?;
        let client_config = Self::create_client_config()?;

        let mut endpoint = QuinnEndpoint::server(server_config, config.bind_addr)
            .map_err(|e| EndpointError::BindFailed(e.to_string()))?;

        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint.local_addr()?;

        Ok(Self {
            inner: endpoint,
            local_addr,
        })
    }

    /// Bind a dial-only endpoint, used by exit agents
    pub async fn client(bind_addr: SocketAddr) -> Result<Self, EndpointError> {
        let mut endpoint = QuinnEndpoint::client(bind_addr)
            .map_err(|e| EndpointError::BindFailed(e.to_string()))?;

        endpoint.set_default_client_config(Self::create_client_config()?);

        let local_addr = endpoint.local_addr()?;

        Ok(Self {
            inner: endpoint,
            local_addr,
        })
    }

    fn transport_config() -> Result<quinn::TransportConfig, EndpointError> {
        let mut transport_config = quinn::TransportConfig::default();

        let idle = quinn::IdleTimeout::try_from(Duration::from_secs(protocol::IDLE_TIMEOUT_SECS))
            .map_err(|e| EndpointError::ConfigCreation(format!("Invalid idle timeout: {}", e)))?;
        transport_config.max_idle_timeout(Some(idle));
        transport_config.keep_alive_interval(Some(Duration::from_secs(
            protocol::KEEPALIVE_INTERVAL_SECS,
        )));

        // One bidirectional stream carries the whole tunnel
        transport_config.max_concurrent_bidi_streams(4u32.into());
        transport_config.max_concurrent_uni_streams(0u32.into());

        Ok(transport_config)
    }

    /// Server side: a fresh self-signed certificate per process
    fn create_server_config() -> Result<quinn::ServerConfig, EndpointError> {
        let certified = rcgen::generate_simple_self_signed(vec![protocol::SERVER_NAME.to_string()])
            .map_err(|e| EndpointError::CertGeneration(e.to_string()))?;
        let chain = vec![CertificateDer::from(certified.cert.der().to_vec())];
        let key = PrivateKeyDer::try_from(certified.key_pair.serialize_der())
            .map_err(|e| EndpointError::CertGeneration(format!("Invalid key: {:?}", e)))?;

        let mut tls = rustls::ServerConfig::builder_with_provider(ring_provider())
            .with_safe_default_protocol_versions()
            .map_err(config_error)?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(config_error)?;
        tls.alpn_protocols = vec![protocol::ALPN.to_vec()];

        let quic = QuicServerConfig::try_from(tls).map_err(config_error)?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic));
        server_config.transport_config(Arc::new(Self::transport_config()?));
        Ok(server_config)
    }

    /// Client side: exit agents accept the relay's self-signed certificate
    fn create_client_config() -> Result<quinn::ClientConfig, EndpointError> {
        let mut tls = rustls::ClientConfig::builder_with_provider(ring_provider())
            .with_safe_default_protocol_versions()
            .map_err(config_error)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptSelfSigned))
            .with_no_client_auth();
        tls.alpn_protocols = vec![protocol::ALPN.to_vec()];

        let quic = QuicClientConfig::try_from(tls).map_err(config_error)?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(quic));
        client_config.transport_config(Arc::new(Self::transport_config()?));
        Ok(client_config)
    }

    /// Connect to a relay server
    pub async fn connect(&self, addr: SocketAddr) -> Result<super::Connection, EndpointError> {
        let connecting = self
            .inner
            .connect(addr, protocol::SERVER_NAME)
            .map_err(|e| EndpointError::ConnectionFailed(e.to_string()))?;

        let connection = connecting
            .await
            .map_err(|e| EndpointError::ConnectionFailed(e.to_string()))?;

        Ok(super::Connection::new(connection))
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> Result<super::Connection, EndpointError> {
        let incoming = self.inner.accept().await.ok_or(EndpointError::Closed)?;

        let connection = incoming
            .await
            .map_err(|e| EndpointError::ConnectionFailed(e.to_string()))?;

        Ok(super::Connection::new(connection))
    }

    /// Get local address
    /// If bound to 0.0.0.0, returns 127.0.0.1 instead for local connections
    pub fn local_addr(&self) -> SocketAddr {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        }
        addr
    }

    /// Close the endpoint
    pub fn close(&self) {
        self.inner.close(0u32.into(), b"shutdown");
    }
}

/// Endpoint configuration
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

impl EndpointConfig {
    /// Create configuration with specific bind address
    pub fn with_bind_addr(bind_addr: SocketAddr) -> Self {
        Self { bind_addr }
    }
}

fn ring_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn config_error(e: impl std::fmt::Debug) -> EndpointError {
    EndpointError::ConfigCreation(format!("{:?}", e))
}

/// There is no PKI between relay and exit nodes; the tunnel is encrypted
/// but the server is not authenticated.
#[derive(Debug)]
struct AcceptSelfSigned;

impl ServerCertVerifier for AcceptSelfSigned {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Endpoint errors
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    #[error("Failed to create config: {0}")]
    ConfigCreation(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Endpoint is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
