/// End-user proxy front ends
///
/// SOCKS5 and HTTP CONNECT listeners that turn client requests into relay
/// engine connects.

pub mod auth;
mod http;
pub mod params;
mod socks5;

pub use auth::{verifier_from_config, AllowAll, CredentialVerifier, StaticCredentials};
pub use http::HttpProxy;
pub use params::{parse_params, ProxyParams};
pub use socks5::{handshake, Socks5Request, Socks5Server};

use anyhow::Result;
use relaymesh_core::RelayEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Runs both proxy listeners
pub struct ProxyManager {
    socks5_addr: SocketAddr,
    http_addr: SocketAddr,
    engine: Arc<RelayEngine>,
    verifier: Arc<dyn CredentialVerifier>,
}

impl ProxyManager {
    pub fn new(
        socks5_addr: SocketAddr,
        http_addr: SocketAddr,
        engine: Arc<RelayEngine>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            socks5_addr,
            http_addr,
            engine,
            verifier,
        }
    }

    /// Serve until either listener fails
    pub async fn start(self) -> Result<()> {
        info!("Starting proxy services...");

        let socks5 = Socks5Server::new(self.socks5_addr, self.engine.clone(), self.verifier.clone());
        let http = HttpProxy::new(self.http_addr, self.engine, self.verifier);

        tokio::select! {
            result = socks5.start() => {
                result?;
            }
            result = http.start() => {
                result?;
            }
        }

        Ok(())
    }
}
