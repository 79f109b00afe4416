/// Exit-node registry
///
/// Tracks every live tunnel by node id. Registration rejects a second live
/// tunnel with the same id, and teardown (kick or natural disconnect) runs at
/// most once per node thanks to the node's `kicked` flag.

use super::exit_node::ExitNode;
use relaymesh_common::{NodeId, RelayMeshError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

pub struct Registry {
    /// Live exit nodes
    nodes: RwLock<HashMap<NodeId, Arc<ExitNode>>>,

    /// Bumped on every membership change
    generation: watch::Sender<u64>,

    /// Completed teardown passes
    teardowns: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            nodes: RwLock::new(HashMap::new()),
            generation,
            teardowns: AtomicU64::new(0),
        }
    }

    /// Insert a freshly accepted node
    pub async fn register(&self, node: Arc<ExitNode>) -> Result<()> {
        let count = {
            let mut nodes = self.nodes.write().await;
            if nodes.contains_key(node.id()) {
                return Err(RelayMeshError::DuplicateNode(node.id().to_string()));
            }
            nodes.insert(node.id().clone(), node.clone());
            nodes.len()
        };
        self.bump_generation();

        info!(
            "Exit node {} registered (region {}, {}), {} online",
            node.id(),
            node.region(),
            node.transport(),
            count
        );
        Ok(())
    }

    /// Remove `node` if it is still the registered entry for its id
    pub async fn unregister(&self, node: &Arc<ExitNode>) -> bool {
        let removed = {
            let mut nodes = self.nodes.write().await;
            match nodes.get(node.id()) {
                Some(current) if Arc::ptr_eq(current, node) => {
                    nodes.remove(node.id());
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.bump_generation();
        }
        removed
    }

    /// Force a node off the mesh for misbehaviour
    pub async fn kick(&self, node: &Arc<ExitNode>, reason: &str) -> bool {
        if node.is_kicked() {
            return false;
        }
        warn!("Kicking exit node {}: {}", node.id(), reason);
        self.teardown(node, reason).await
    }

    /// Release a node and everything it owns. Idempotent: only the first
    /// caller performs the pass and gets `true`.
    pub async fn teardown(&self, node: &Arc<ExitNode>, reason: &str) -> bool {
        if !node.begin_teardown() {
            debug!("Exit node {} already torn down", node.id());
            return false;
        }

        node.close_transport();
        self.unregister(node).await;

        let pending = node.drain_pending();
        let streams = node.drain_streams();

        // Queued writes may be stuck on a dead transport
        let writer_node = node.clone();
        tokio::spawn(async move {
            writer_node.shutdown_writer().await;
        });

        self.teardowns.fetch_add(1, Ordering::AcqRel);

        info!(
            "Exit node {} disconnected ({}): closed {} streams, {} pending, {} online",
            node.id(),
            reason,
            streams,
            pending,
            self.len().await
        );
        true
    }

    pub async fn get(&self, id: &NodeId) -> Option<Arc<ExitNode>> {
        self.nodes.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &NodeId) -> bool {
        self.nodes.read().await.contains_key(id)
    }

    /// Copy of the current membership; the lock is released before returning
    pub async fn snapshot(&self) -> Vec<Arc<ExitNode>> {
        self.nodes.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Current membership generation
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Watch membership changes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn teardown_count(&self) -> u64 {
        self.teardowns.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}
