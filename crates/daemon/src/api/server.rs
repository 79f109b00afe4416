/// API server implementation

use super::handlers::*;
use super::ws::ws_tunnel;
use anyhow::Result;
use axum::{routing::get, Router};
use relaymesh_core::RelayServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Read-only fleet API plus the WebSocket tunnel endpoint
pub struct ApiServer {
    listen_addr: SocketAddr,
    server: Arc<RelayServer>,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, server: Arc<RelayServer>) -> Self {
        Self {
            listen_addr,
            server,
        }
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn start(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;
        serve(listener, self.server).await
    }
}

pub fn router(server: Arc<RelayServer>) -> Router {
    let state = AppState { server };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(get_stats))
        .route("/api/nodes/:id", get(get_node))
        .route("/ws", get(ws_tunnel))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

/// Serve the API on an already bound listener
pub async fn serve(listener: tokio::net::TcpListener, server: Arc<RelayServer>) -> Result<()> {
    info!("API server listening on {}", listener.local_addr()?);

    // The tunnel endpoint keys nodes by peer address
    let app = router(server).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

    Ok(())
}
