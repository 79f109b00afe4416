/// SOCKS5 front end
///
/// Accepts CONNECT requests (RFC 1928) with optional username/password
/// authentication (RFC 1929) and hands the target to the relay engine. The
/// client gets exactly one reply, written once the connect outcome is known.

use super::auth::CredentialVerifier;
use super::params::{split_password, ProxyParams};
use anyhow::{anyhow, Result};
use relaymesh_core::{ConnectRequest, IngressProtocol, RelayEngine};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// SOCKS5 protocol constants
const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH_REQUIRED: u8 = 0x00;
const USERNAME_PASSWORD: u8 = 0x02;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;
const AUTH_VERSION: u8 = 0x01;
const CONNECT_COMMAND: u8 = 0x01;
const IPV4_ADDRESS: u8 = 0x01;
const DOMAIN_NAME: u8 = 0x03;
const IPV6_ADDRESS: u8 = 0x04;

/// Reply codes
const SUCCESS: u8 = 0x00;
const GENERAL_FAILURE: u8 = 0x01;
const COMMAND_NOT_SUPPORTED: u8 = 0x07;
const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Outcome of a completed handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub params: ProxyParams,
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listen_addr: SocketAddr,
    engine: Arc<RelayEngine>,
    verifier: Arc<dyn CredentialVerifier>,
}

impl Socks5Server {
    pub fn new(
        listen_addr: SocketAddr,
        engine: Arc<RelayEngine>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            listen_addr,
            engine,
            verifier,
        }
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("SOCKS5 proxy listening on {}", listener.local_addr()?);

        loop {
            let (socket, addr) = listener.accept().await?;
            debug!("SOCKS5: New connection from {}", addr);

            let engine = self.engine.clone();
            let verifier = self.verifier.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(socket, engine, verifier).await {
                    debug!("SOCKS5 client {} ended: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    engine: Arc<RelayEngine>,
    verifier: Arc<dyn CredentialVerifier>,
) -> Result<()> {
    let request = handshake(&mut stream, verifier.as_ref()).await?;
    let connect = ConnectRequest::new(request.host, request.port, IngressProtocol::Socks5)
        .with_region(request.params.region());
    debug!("SOCKS5: Request to connect to {}", connect.target());

    let established = match engine.connect(&connect).await {
        Ok(established) => established,
        Err(e) => {
            warn!("SOCKS5: No stream to {}: {}", connect.target(), e);
            send_reply(&mut stream, GENERAL_FAILURE).await?;
            return Err(e.into());
        }
    };

    if let Err(e) = send_reply(&mut stream, SUCCESS).await {
        engine.release(established).await;
        return Err(e);
    }

    info!(
        "SOCKS5 stream {} to {} via {}",
        established.id(),
        established.target(),
        established.node().id()
    );
    engine.relay(established, stream).await;
    Ok(())
}

/// Run method negotiation, authentication and the request phase.
///
/// Failures in the request phase that SOCKS5 has a reply code for are
/// answered here; the caller must not reply again after an error.
pub async fn handshake<S>(stream: &mut S, verifier: &dyn CredentialVerifier) -> Result<Socks5Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(anyhow!("Unsupported SOCKS version: {}", header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    let (username, params) = if methods.contains(&USERNAME_PASSWORD) {
        stream.write_all(&[SOCKS_VERSION, USERNAME_PASSWORD]).await?;
        let (username, params) = authenticate(stream, verifier).await?;
        (Some(username), params)
    } else if methods.contains(&NO_AUTH_REQUIRED) && !verifier.requires_auth() {
        stream.write_all(&[SOCKS_VERSION, NO_AUTH_REQUIRED]).await?;
        (None, ProxyParams::default())
    } else {
        stream.write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS]).await?;
        return Err(anyhow!("No acceptable auth methods in {:?}", methods));
    };

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(anyhow!("Invalid SOCKS version in request"));
    }
    if request[1] != CONNECT_COMMAND {
        send_reply(stream, COMMAND_NOT_SUPPORTED).await?;
        return Err(anyhow!("Unsupported command: {}", request[1]));
    }

    let host = match request[3] {
        IPV4_ADDRESS => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        DOMAIN_NAME => {
            let len = stream.read_u8().await?;
            let mut domain = vec![0u8; len as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| anyhow!("Domain name is not UTF-8"))?
        }
        IPV6_ADDRESS => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        other => {
            send_reply(stream, ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(anyhow!("Unsupported address type: {}", other));
        }
    };
    let port = stream.read_u16().await?;

    Ok(Socks5Request {
        host,
        port,
        username,
        params,
    })
}

/// RFC 1929 sub-negotiation. The password may carry routing params.
async fn authenticate<S>(
    stream: &mut S,
    verifier: &dyn CredentialVerifier,
) -> Result<(String, ProxyParams)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != AUTH_VERSION {
        return Err(anyhow!("Unsupported auth version: {}", version));
    }

    let username = read_short_string(stream).await?;
    let password = read_short_string(stream).await?;
    let (secret, params) = split_password(&password);

    if !verifier.verify(&username, secret) {
        stream.write_all(&[AUTH_VERSION, GENERAL_FAILURE]).await?;
        return Err(anyhow!("Authentication failed for {:?}", username));
    }
    stream.write_all(&[AUTH_VERSION, SUCCESS]).await?;
    Ok((username, params))
}

async fn read_short_string<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let len = stream.read_u8().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| anyhow!("Credential is not UTF-8"))
}

/// Send a SOCKS5 reply to the client
async fn send_reply<S: AsyncWrite + Unpin>(stream: &mut S, reply_code: u8) -> Result<()> {
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let reply = [
        SOCKS_VERSION,
        reply_code,
        0x00,
        IPV4_ADDRESS,
        0, 0, 0, 0,
        0, 0,
    ];

    stream.write_all(&reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::auth::{AllowAll, StaticCredentials};
    use std::collections::HashMap;
    use tokio::io::duplex;

    async fn run_handshake(
        client_bytes: Vec<u8>,
        verifier: &dyn CredentialVerifier,
    ) -> (Result<Socks5Request>, Vec<u8>) {
        let (mut client, mut server) = duplex(4096);
        client.write_all(&client_bytes).await.unwrap();
        let result = handshake(&mut server, verifier).await;
        drop(server);

        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        (result, written)
    }

    #[tokio::test]
    async fn test_ipv4_without_auth() {
        let bytes = vec![5, 1, 0, 5, 1, 0, 1, 93, 184, 216, 34, 0x01, 0xBB];
        let (result, written) = run_handshake(bytes, &AllowAll).await;

        let request = result.unwrap();
        assert_eq!(request.host, "93.184.216.34");
        assert_eq!(request.port, 443);
        assert!(request.username.is_none());
        assert_eq!(written, vec![5, 0]);
    }

    #[tokio::test]
    async fn test_domain_with_credentials_and_params() {
        let verifier = StaticCredentials::new(HashMap::from([(
            "alice".to_string(),
            "secret".to_string(),
        )]));
        let password = b"secret_country-de";
        let mut bytes = vec![5, 1, 2, 1, 5];
        bytes.extend_from_slice(b"alice");
        bytes.push(password.len() as u8);
        bytes.extend_from_slice(password);
        bytes.extend_from_slice(&[5, 1, 0, 3, 11]);
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&[0, 80]);

        let (result, written) = run_handshake(bytes, &verifier).await;
        let request = result.unwrap();
        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, 80);
        assert_eq!(request.username.as_deref(), Some("alice"));
        assert_eq!(request.params.region().as_deref(), Some("DE"));
        assert_eq!(written, vec![5, 2, 1, 0]);
    }

    #[tokio::test]
    async fn test_ipv6_target() {
        let mut bytes = vec![5, 1, 0, 5, 1, 0, 4];
        bytes.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        bytes.extend_from_slice(&[0x1F, 0x90]);

        let (result, _) = run_handshake(bytes, &AllowAll).await;
        let request = result.unwrap();
        assert_eq!(request.host, "::1");
        assert_eq!(request.port, 8080);
    }

    #[tokio::test]
    async fn test_bad_password_rejected() {
        let verifier = StaticCredentials::new(HashMap::from([(
            "alice".to_string(),
            "secret".to_string(),
        )]));
        let mut bytes = vec![5, 1, 2, 1, 5];
        bytes.extend_from_slice(b"alice");
        bytes.push(5);
        bytes.extend_from_slice(b"wrong");

        let (result, written) = run_handshake(bytes, &verifier).await;
        assert!(result.is_err());
        assert_eq!(written, vec![5, 2, 1, 1]);
    }

    #[tokio::test]
    async fn test_no_auth_refused_when_required() {
        let verifier = StaticCredentials::default();
        let (result, written) = run_handshake(vec![5, 1, 0], &verifier).await;
        assert!(result.is_err());
        assert_eq!(written, vec![5, 0xFF]);
    }

    #[tokio::test]
    async fn test_bind_command_gets_single_reply() {
        let bytes = vec![5, 1, 0, 5, 2, 0, 1, 127, 0, 0, 1, 0, 80];
        let (result, written) = run_handshake(bytes, &AllowAll).await;
        assert!(result.is_err());
        assert_eq!(written, vec![5, 0, 5, COMMAND_NOT_SUPPORTED, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_no_exit_node_yields_one_failure_reply() {
        use relaymesh_common::SelectionStrategy;
        use relaymesh_core::{Registry, RelaySettings, Selector, TracingConnectionLogger};

        let registry = Arc::new(Registry::new());
        let selector = Arc::new(Selector::new(registry, SelectionStrategy::Weighted, 1.0));
        let engine = Arc::new(RelayEngine::new(
            selector,
            Arc::new(TracingConnectionLogger),
            RelaySettings::default(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Socks5Server::new(addr, engine, Arc::new(AllowAll));
        tokio::spawn(async move { server.serve(listener).await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&[5, 1, 0, 5, 1, 0, 1, 10, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        assert_eq!(written, vec![5, 0, 5, GENERAL_FAILURE, 0, 1, 0, 0, 0, 0, 0, 0]);
    }
}
