use relaymesh_common::config::relay::INBOUND_QUEUE_CAPACITY;
use relaymesh_common::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Byte counters and timing for one logical stream
#[derive(Debug)]
pub struct StreamMetrics {
    started: Instant,
    started_at: Timestamp,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Timestamp::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// User to tunnel
    pub fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Tunnel to user
    pub fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry-side half of a logical stream.
///
/// Dropping the entry drops the inbound sender, which closes the queue and
/// lets the tunnel-to-user pump finish.
#[derive(Debug)]
pub struct LogicalStream {
    pub target: String,
    pub inbound: mpsc::Sender<Vec<u8>>,
    pub metrics: Arc<StreamMetrics>,
}

impl LogicalStream {
    /// Create the entry plus the receiving end of its bounded inbound queue
    pub fn new(target: impl Into<String>) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let stream = Self {
            target: target.into(),
            inbound: tx,
            metrics: Arc::new(StreamMetrics::new()),
        };
        (stream, rx)
    }
}
