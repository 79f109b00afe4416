/// API request handlers

use super::responses::*;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relaymesh_common::NodeId;
use relaymesh_core::{collect_stats, NodeSummary, RelayServer};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<RelayServer>,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    debug!("API: GET /health");

    Json(HealthResponse {
        status: "ok".to_string(),
        node_count: state.server.registry().len().await,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Handler for GET /api/stats
pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Json<StatsResponse> {
    debug!("API: GET /api/stats address={:?}", query.address);

    let address = query.address.filter(|a| !a.is_empty());
    let stats = collect_stats(state.server.registry(), address.as_deref()).await;
    Json(StatsResponse { address, stats })
}

/// Handler for GET /api/nodes/:id
pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NodeResponse>, AppError> {
    debug!("API: GET /api/nodes/{}", id);

    let id = NodeId::new(id).map_err(|e| AppError::bad_request(e.to_string()))?;
    let node = state
        .server
        .registry()
        .get(&id)
        .await
        .ok_or_else(|| AppError::not_found(format!("No exit node {}", id)))?;

    Ok(Json(NodeResponse {
        node: NodeSummary::of(&node, true),
    }))
}

/// Application error type
#[derive(Debug)]
pub struct AppError {
    message: String,
    status_code: StatusCode,
}

impl AppError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::NOT_FOUND,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::BAD_REQUEST,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::CONFLICT,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        warn!("API Error: {}", self.message);

        let body = Json(ErrorResponse::new(self.message, self.status_code.as_u16()));

        (self.status_code, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
