/// Live handle for one exit-node tunnel
///
/// Owns the tunnel's write half, the logical stream table, pending connect
/// responses and the node's health state. Each of these sits behind its own
/// lock and no method holds two of them at once.

use super::health::{HealthMetrics, HealthSnapshot};
use crate::protocol::TunnelMessage;
use crate::relay::stream::LogicalStream;
use crate::transport::{BoxedTunnelWriter, TransportKind, TunnelSink};
use relaymesh_common::{NodeId, RelayMeshError, Result, StreamId, Timestamp};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Outcome delivered to a pending connect: `Err` carries the node's reason
pub type ConnectOutcome = std::result::Result<(), String>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One exit node as seen by the relay server
pub struct ExitNode {
    id: NodeId,
    region: String,
    transport: TransportKind,
    connected_at: Timestamp,

    /// Writer task owning the tunnel's write half
    writer: TunnelSink,

    streams: Mutex<HashMap<StreamId, LogicalStream>>,
    pending: Mutex<HashMap<StreamId, oneshot::Sender<ConnectOutcome>>>,
    health: Mutex<HealthMetrics>,

    /// Send time of the one outstanding ping
    ping_sent: Mutex<Option<Instant>>,

    reward_address: Mutex<Option<String>>,

    active_conns: AtomicUsize,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    kicked: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ExitNode {
    /// Spawns the node's writer task, so this must run inside a Tokio runtime
    pub fn new(
        id: NodeId,
        region: impl Into<String>,
        transport: TransportKind,
        writer: BoxedTunnelWriter,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            region: region.into(),
            transport,
            connected_at: Timestamp::now(),
            writer: TunnelSink::spawn(writer),
            streams: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            health: Mutex::new(HealthMetrics::new()),
            ping_sent: Mutex::new(None),
            reward_address: Mutex::new(None),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            kicked: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn connected_at(&self) -> Timestamp {
        self.connected_at
    }

    /// Write one envelope through the node's writer task.
    ///
    /// Dropping the returned future never truncates a frame. A write failure
    /// is transport-fatal: the tunnel is flagged for shutdown so its reader
    /// loop exits and tears the node down.
    pub async fn send(&self, message: &TunnelMessage) -> Result<()> {
        if self.is_kicked() {
            return Err(RelayMeshError::NodeClosed(self.id.to_string()));
        }

        if let Err(e) = self.writer.send(message).await {
            warn!("Write to exit node {} failed: {}", self.id, e);
            self.close_transport();
            return Err(RelayMeshError::transport(format!(
                "write to {} failed: {}",
                self.id, e
            )));
        }
        Ok(())
    }

    pub(crate) async fn shutdown_writer(&self) {
        self.writer.shutdown().await;
    }

    /// Selectable iff the tunnel is open and the node has not been kicked
    pub fn is_selectable(&self) -> bool {
        !self.is_kicked() && !self.is_closing()
    }

    pub fn is_kicked(&self) -> bool {
        self.kicked.load(Ordering::Acquire)
    }

    /// Claim the single teardown pass. Only the first caller gets `true`.
    pub(crate) fn begin_teardown(&self) -> bool {
        self.kicked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Ask the reader loop to stop
    pub fn close_transport(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closing(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`ExitNode::close_transport`] has been called
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }

    // Logical streams

    /// Register a stream; `ActiveConns` moves with the map under the same lock
    pub fn insert_stream(&self, id: StreamId, stream: LogicalStream) {
        let mut streams = lock(&self.streams);
        if streams.insert(id, stream).is_none() {
            self.active_conns.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Remove a stream, returning it only to the caller that actually removed it
    pub fn release_stream(&self, id: StreamId) -> Option<LogicalStream> {
        let mut streams = lock(&self.streams);
        let removed = streams.remove(&id);
        if removed.is_some() {
            self.active_conns.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn stream_sender(&self, id: StreamId) -> Option<mpsc::Sender<Vec<u8>>> {
        lock(&self.streams).get(&id).map(|s| s.inbound.clone())
    }

    pub fn has_stream(&self, id: StreamId) -> bool {
        lock(&self.streams).contains_key(&id)
    }

    pub fn stream_count(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Remove every stream; dropping them closes their inbound queues
    pub(crate) fn drain_streams(&self) -> usize {
        let drained: Vec<LogicalStream> = {
            let mut streams = lock(&self.streams);
            let drained: Vec<_> = streams.drain().map(|(_, s)| s).collect();
            self.active_conns.fetch_sub(drained.len(), Ordering::AcqRel);
            drained
        };
        drained.len()
    }

    pub fn stream_snapshots(&self) -> Vec<StreamSnapshot> {
        let streams = lock(&self.streams);
        let mut snapshots: Vec<_> = streams
            .iter()
            .map(|(id, s)| StreamSnapshot {
                id: id.to_string(),
                target: s.target.clone(),
                bytes_sent: s.metrics.bytes_sent(),
                bytes_received: s.metrics.bytes_received(),
                age_secs: s.metrics.elapsed().as_secs(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    // Pending connect responses

    pub fn register_pending(&self, id: StreamId) -> oneshot::Receiver<ConnectOutcome> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        rx
    }

    /// Deliver a connect_response. Returns false for unknown or expired ids.
    pub fn resolve_pending(&self, id: StreamId, outcome: ConnectOutcome) -> bool {
        match self.take_pending(id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Remove the waiter for `id`; at most one caller gets it
    pub fn take_pending(&self, id: StreamId) -> Option<oneshot::Sender<ConnectOutcome>> {
        lock(&self.pending).remove(&id)
    }

    pub fn cancel_pending(&self, id: StreamId) {
        self.take_pending(id);
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Drop every pending sender so waiters observe the node going away
    pub(crate) fn drain_pending(&self) -> usize {
        let mut pending = lock(&self.pending);
        let count = pending.len();
        pending.clear();
        count
    }

    // Health

    pub fn health(&self) -> HealthSnapshot {
        lock(&self.health).snapshot()
    }

    pub fn score(&self) -> f64 {
        lock(&self.health).score()
    }

    pub fn reliability(&self) -> f64 {
        lock(&self.health).reliability()
    }

    pub fn is_measured(&self) -> bool {
        lock(&self.health).is_measured()
    }

    pub fn needs_warmup(&self) -> bool {
        lock(&self.health).needs_warmup()
    }

    pub fn reward(&self) -> f64 {
        let reliability = lock(&self.health).reward();
        debug!("Exit node {} rewarded, reliability {:.3}", self.id, reliability);
        reliability
    }

    pub fn penalize(&self) -> f64 {
        let reliability = lock(&self.health).penalize();
        debug!("Exit node {} penalized, reliability {:.3}", self.id, reliability);
        reliability
    }

    // Ping

    /// Send a ping unless one is already outstanding. Returns whether one was sent.
    pub async fn send_ping(&self) -> Result<bool> {
        {
            let mut sent = lock(&self.ping_sent);
            if sent.is_some() {
                return Ok(false);
            }
            *sent = Some(Instant::now());
        }
        self.send(&TunnelMessage::ping()).await?;
        Ok(true)
    }

    pub fn ping_outstanding(&self) -> bool {
        lock(&self.ping_sent).is_some()
    }

    /// True if a ping has been outstanding for at least `after`
    pub fn ping_overdue(&self, after: Duration) -> bool {
        lock(&self.ping_sent).is_some_and(|sent| sent.elapsed() >= after)
    }

    /// Match a pong against the outstanding ping and record the round-trip.
    /// Unsolicited pongs return `None`.
    pub fn record_pong(&self) -> Option<Duration> {
        let sent = lock(&self.ping_sent).take()?;
        let rtt = sent.elapsed();
        lock(&self.health).record_latency(rtt.as_secs_f64() * 1000.0);
        Some(rtt)
    }

    // Accounting

    pub fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn active_conns(&self) -> usize {
        self.active_conns.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn set_reward_address(&self, address: impl Into<String>) {
        *lock(&self.reward_address) = Some(address.into());
    }

    pub fn reward_address(&self) -> Option<String> {
        lock(&self.reward_address).clone()
    }
}

impl std::fmt::Debug for ExitNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitNode")
            .field("id", &self.id)
            .field("region", &self.region)
            .field("transport", &self.transport)
            .field("active_conns", &self.active_conns())
            .field("kicked", &self.is_kicked())
            .finish()
    }
}

/// One live logical stream, for stats
#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub id: String,
    pub target: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub age_secs: u64,
}
