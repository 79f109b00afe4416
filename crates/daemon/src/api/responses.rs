/// API response types

use relaymesh_core::{FleetStats, NodeSummary};
use serde::{Deserialize, Serialize};

/// Health check body
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_count: usize,
    pub version: String,
}

/// Fleet statistics, optionally narrowed to one reward address
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Filter that produced this view, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(flatten)]
    pub stats: FleetStats,
}

/// One exit node with its live streams
#[derive(Debug, Serialize)]
pub struct NodeResponse {
    #[serde(flatten)]
    pub node: NodeSummary,
}

/// Query string of `/api/stats`
#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub address: Option<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}
