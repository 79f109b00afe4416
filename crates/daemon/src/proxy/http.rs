/// HTTP CONNECT front end
///
/// Only CONNECT tunnels are relayed. Plain-HTTP requests are refused with a
/// 400. Routing params travel in the `Proxy-Authorization: Basic` username.

use super::auth::CredentialVerifier;
use super::params::{parse_params, ProxyParams};
use anyhow::{anyhow, Result};
use data_encoding::BASE64;
use relaymesh_common::RelayMeshError;
use relaymesh_core::{ConnectRequest, IngressProtocol, RelayEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const MAX_HEADER_LINES: usize = 100;
const MAX_LINE_LEN: usize = 8 * 1024;

/// HTTP proxy server
pub struct HttpProxy {
    listen_addr: SocketAddr,
    engine: Arc<RelayEngine>,
    verifier: Arc<dyn CredentialVerifier>,
}

impl HttpProxy {
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
        info!("HTTP proxy listening on {}", listener.local_addr()?);

        loop {
            let (socket, addr) = listener.accept().await?;
            debug!("HTTP proxy: New connection from {}", addr);

            let engine = self.engine.clone();
            let verifier = self.verifier.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(socket, engine, verifier).await {
                    debug!("HTTP proxy client {} ended: {}", addr, e);
                }
            });
        }
    }
}

/// Parsed request head
#[derive(Debug, Default)]
struct RequestHead {
    method: String,
    target: String,
    proxy_authorization: Option<String>,
}

async fn handle_client<S>(
    stream: S,
    engine: Arc<RelayEngine>,
    verifier: Arc<dyn CredentialVerifier>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut reader = BufReader::new(stream);
    let head = read_head(&mut reader).await?;
    // Anything the client pipelined after the head goes out with the connect
    let initial_data = reader.buffer().to_vec();
    let mut stream = reader.into_inner();

    debug!("HTTP proxy: {} {}", head.method, head.target);

    if !head.method.eq_ignore_ascii_case("CONNECT") {
        send_response(&mut stream, 400, "Bad Request", "Non-HTTPS websites are not supported yet").await?;
        return Err(anyhow!("Refused {} request", head.method));
    }

    let params = match check_credentials(head.proxy_authorization.as_deref(), verifier.as_ref()) {
        Ok(params) => params,
        Err(e) => {
            send_auth_required(&mut stream).await?;
            return Err(e);
        }
    };

    let Some((host, port)) = parse_authority(&head.target) else {
        send_response(&mut stream, 400, "Bad Request", "Invalid CONNECT target").await?;
        return Err(anyhow!("Invalid CONNECT target {:?}", head.target));
    };

    let connect = ConnectRequest::new(host, port, IngressProtocol::Http)
        .with_region(params.region())
        .with_initial_data(initial_data);

    let established = match engine.connect(&connect).await {
        Ok(established) => established,
        Err(e) => {
            warn!("HTTP proxy: No stream to {}: {}", connect.target(), e);
            let (code, reason) = match &e {
                RelayMeshError::NoExitNode => (503, "Service Unavailable"),
                _ => (502, "Bad Gateway"),
            };
            send_response(&mut stream, code, reason, &e.to_string()).await?;
            return Err(e.into());
        }
    };

    if let Err(e) = stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
    {
        engine.release(established).await;
        return Err(e.into());
    }

    info!(
        "HTTP stream {} to {} via {}",
        established.id(),
        established.target(),
        established.node().id()
    );
    engine.relay(established, stream).await;
    Ok(())
}

async fn read_head<R>(reader: &mut BufReader<R>) -> Result<RequestHead>
where
    R: AsyncRead + Unpin,
{
    let request_line = read_line(reader).await?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(anyhow!("Invalid HTTP request line {:?}", request_line));
    };
    let mut head = RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        ..Default::default()
    };

    for _ in 0..MAX_HEADER_LINES {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Ok(head);
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("proxy-authorization") {
                head.proxy_authorization = Some(value.trim().to_string());
            }
        }
    }
    Err(anyhow!("Too many header lines"))
}

/// One CRLF-terminated line without its terminator
async fn read_line<R>(reader: &mut BufReader<R>) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    // Never buffer more than one byte past the limit
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_line(&mut line)
        .await?;
    if n == 0 {
        return Err(anyhow!("Connection closed during request head"));
    }
    if n > MAX_LINE_LEN {
        return Err(anyhow!("Header line too long"));
    }
    Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string())
}

/// Validate the Basic credentials. The username's first comma-separated
/// segment is the account; the whole username is scanned for params.
fn check_credentials(
    header: Option<&str>,
    verifier: &dyn CredentialVerifier,
) -> Result<ProxyParams> {
    let Some(header) = header else {
        if verifier.requires_auth() {
            return Err(anyhow!("Missing Proxy-Authorization"));
        }
        return Ok(ProxyParams::default());
    };

    let (username, password) = decode_basic(header)?;
    let account = username.split(',').next().unwrap_or_default();
    if !verifier.verify(account, &password) {
        return Err(anyhow!("Authentication failed for {:?}", account));
    }
    Ok(parse_params(&username))
}

fn decode_basic(header: &str) -> Result<(String, String)> {
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(|| anyhow!("Unsupported authentication scheme"))?;
    let decoded = BASE64
        .decode(encoded.trim().as_bytes())
        .map_err(|e| anyhow!("Invalid Basic credentials: {}", e))?;
    let credentials = String::from_utf8(decoded)?;
    let (username, password) = credentials
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid credentials format"))?;
    Ok((username.to_string(), password.to_string()))
}

/// Split `host:port` or `[v6]:port`
fn parse_authority(target: &str) -> Option<(String, u16)> {
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        target.rsplit_once(':')?
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

async fn send_response<S>(stream: &mut S, code: u16, reason: &str, body: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn send_auth_required<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(
            b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"relaymesh\"\r\nContent-Length: 0\r\n\r\n",
        )
        .await?;
    Ok(())
}
