/// Per-connection metrics sink
///
/// Every relayed connection produces exactly one `ConnectionMetrics` record
/// when it ends. The sink is pluggable: the default writes a structured
/// tracing event, and a JSON-lines file logger is available for offline
/// accounting.

use relaymesh_common::{Bandwidth, RelayMeshError, Result, StreamId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

/// How a relayed connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The user side reached EOF or failed
    Client,
    /// The exit node closed the stream or its tunnel went away
    Remote,
}

/// One finished connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub stream_id: StreamId,
    pub node_id: String,
    pub protocol: String,
    pub target: String,
    pub started_at: u64,
    pub duration_ms: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub throughput_mbps: f64,
    pub close_reason: CloseReason,
}

impl ConnectionMetrics {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_id: StreamId,
        node_id: impl Into<String>,
        protocol: impl Into<String>,
        target: impl Into<String>,
        started_at: Timestamp,
        elapsed: Duration,
        bytes_sent: u64,
        bytes_received: u64,
        close_reason: CloseReason,
    ) -> Self {
        let total = Bandwidth::from_bytes(bytes_sent + bytes_received);
        Self {
            stream_id,
            node_id: node_id.into(),
            protocol: protocol.into(),
            target: target.into(),
            started_at: started_at.as_millis(),
            duration_ms: elapsed.as_millis() as u64,
            bytes_sent,
            bytes_received,
            throughput_mbps: total.throughput_mbps(elapsed),
            close_reason,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

pub trait ConnectionLogger: Send + Sync {
    fn log_connection(&self, metrics: &ConnectionMetrics);
}

/// Emits one `info` event per connection
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConnectionLogger;

impl ConnectionLogger for TracingConnectionLogger {
    fn log_connection(&self, m: &ConnectionMetrics) {
        info!(
            stream = %m.stream_id,
            node = %m.node_id,
            protocol = %m.protocol,
            target = %m.target,
            duration_ms = m.duration_ms,
            bytes_sent = m.bytes_sent,
            bytes_received = m.bytes_received,
            throughput_mbps = m.throughput_mbps,
            close_reason = ?m.close_reason,
            "Connection closed"
        );
    }
}

/// Appends one JSON object per line to a file
pub struct JsonLinesConnectionLogger {
    file: Mutex<File>,
}

impl JsonLinesConnectionLogger {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                RelayMeshError::Config(format!(
                    "cannot open connection log {}: {}",
                    path.display(),
                    e
                ))
            })?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl ConnectionLogger for JsonLinesConnectionLogger {
    fn log_connection(&self, metrics: &ConnectionMetrics) {
        let mut line = match serde_json::to_string(metrics) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode connection metrics: {}", e);
                return;
            }
        };
        line.push('\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!("Failed to append connection metrics: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::{ConnectionLogger, ConnectionMetrics};
    use std::sync::{Arc, Mutex};

    /// Keeps every record in memory
    #[derive(Default, Clone)]
    pub struct RecordingLogger {
        pub records: Arc<Mutex<Vec<ConnectionMetrics>>>,
    }

    impl RecordingLogger {
        pub fn records(&self) -> Vec<ConnectionMetrics> {
            self.records.lock().unwrap().clone()
        }
    }

    impl ConnectionLogger for RecordingLogger {
        fn log_connection(&self, metrics: &ConnectionMetrics) {
            self.records.lock().unwrap().push(metrics.clone());
        }
    }
}
