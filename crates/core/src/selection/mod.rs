/// Exit-node selection
///
/// Two interchangeable policies pick a node per connect attempt:
/// - `Weighted`: linear weighted-random walk over the live registry
/// - `Pooled`: binary search over cumulative per-region pools, rebuilt on a
///   timer and on membership changes
///
/// Both honor an optional region and an exclusion set of already-tried nodes.

pub mod pool;
pub mod weighted;

pub use pool::{PoolSet, WeightedPool};
pub use weighted::{floor_weight, node_weight, pick_index};

use crate::network::{ExitNode, Registry};
use relaymesh_common::{
    NodeId, RelayMeshError, SelectionStrategy, ServerConfig, GLOBAL_REGION,
};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Errors from node selection
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("No exit nodes connected")]
    NoExitNodes,

    #[error("No healthy exit node among {total} connected")]
    NoHealthyNode { total: usize },
}

impl From<SelectionError> for RelayMeshError {
    fn from(_: SelectionError) -> Self {
        RelayMeshError::NoExitNode
    }
}

/// What a caller wants from the next pick
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Preferred region; `None` or `global` means any
    pub region: Option<String>,

    /// Nodes already tried for this request
    pub excluded: HashSet<NodeId>,
}

impl SelectionCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_optional_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn exclude(mut self, node: NodeId) -> Self {
        self.excluded.insert(node);
        self
    }

    pub fn excludes(&self, node: &NodeId) -> bool {
        self.excluded.contains(node)
    }

    /// The same request without the exclusion set
    pub fn relaxed(&self) -> Self {
        Self {
            region: self.region.clone(),
            excluded: HashSet::new(),
        }
    }

    fn wants_region(&self) -> Option<&str> {
        self.region.as_deref().filter(|r| *r != GLOBAL_REGION)
    }
}

pub struct Selector {
    registry: Arc<Registry>,
    strategy: SelectionStrategy,
    exponent: f64,
    pools: RwLock<Arc<PoolSet>>,
}

impl Selector {
    pub fn new(registry: Arc<Registry>, strategy: SelectionStrategy, exponent: f64) -> Self {
        Self {
            registry,
            strategy,
            exponent,
            pools: RwLock::new(Arc::new(PoolSet::empty())),
        }
    }

    pub fn from_config(registry: Arc<Registry>, config: &ServerConfig) -> Self {
        Self::new(registry, config.selection, config.weight_exponent)
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Pick one exit node. When every candidate is excluded the exclusion set
    /// is dropped rather than failing the request.
    pub async fn select(&self, criteria: &SelectionCriteria) -> Result<Arc<ExitNode>, SelectionError> {
        let picked = match self.strategy {
            SelectionStrategy::Weighted => self.select_weighted(criteria).await?,
            SelectionStrategy::Pooled => self.select_pooled(criteria).await?,
        };

        match picked {
            Some(node) => Ok(node),
            None if !criteria.excluded.is_empty() => {
                debug!("Every candidate already tried, retrying without exclusions");
                let relaxed = criteria.relaxed();
                let picked = match self.strategy {
                    SelectionStrategy::Weighted => self.select_weighted(&relaxed).await?,
                    SelectionStrategy::Pooled => self.select_pooled(&relaxed).await?,
                };
                picked.ok_or(self.no_node().await)
            }
            None => Err(self.no_node().await),
        }
    }

    async fn select_weighted(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Option<Arc<ExitNode>>, SelectionError> {
        let nodes = self.registry.snapshot().await;
        if nodes.is_empty() {
            return Err(SelectionError::NoExitNodes);
        }

        let healthy: Vec<_> = nodes.into_iter().filter(|n| n.is_selectable()).collect();
        ping_unmeasured(&healthy);

        let eligible: Vec<_> = healthy.into_iter().filter(|n| !criteria.excludes(n.id())).collect();
        let in_region: Vec<_> = match criteria.wants_region() {
            Some(region) => eligible.iter().filter(|n| n.region() == region).cloned().collect(),
            None => Vec::new(),
        };
        let candidates = if in_region.is_empty() { eligible } else { in_region };

        let weights: Vec<f64> = candidates.iter().map(|n| node_weight(n, self.exponent)).collect();

        let index = pick_index(&weights, &mut rand::thread_rng());
        Ok(index.map(|i| candidates[i].clone()))
    }

    async fn select_pooled(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Option<Arc<ExitNode>>, SelectionError> {
        let mut pools = self.pools();
        // Cold start: nothing built yet for a registry that has members
        if pools.pool(GLOBAL_REGION).is_none() && self.is_stale(&pools) {
            self.refresh().await;
            pools = self.pools();
        }

        if pools.pool(GLOBAL_REGION).map_or(true, WeightedPool::is_empty) && self.registry.is_empty().await {
            return Err(SelectionError::NoExitNodes);
        }

        // A stale set keeps serving until `run_refresh` replaces it
        let picked = pools.select(&mut rand::thread_rng(), criteria);
        if picked.is_some() || !self.is_stale(&pools) {
            return Ok(picked);
        }

        // Every member of the stale set is gone or excluded
        self.refresh().await;
        let picked = self.pools().select(&mut rand::thread_rng(), criteria);
        Ok(picked)
    }

    fn is_stale(&self, pools: &PoolSet) -> bool {
        pools.generation() != self.registry.generation()
    }

    /// Rebuild the pools from the live registry
    pub async fn refresh(&self) -> usize {
        let generation = self.registry.generation();
        let nodes = self.registry.snapshot().await;
        ping_unmeasured(&nodes);

        let pools = PoolSet::rebuild(&nodes, self.exponent, generation);
        let regions = pools.regions().count();
        *self.pools.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(pools);

        trace!("Selection pools rebuilt: {} nodes, {} pools", nodes.len(), regions);
        regions
    }

    /// Current pool set, lock released before returning
    pub fn pools(&self) -> Arc<PoolSet> {
        self.pools.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Up to `width` distinct candidates for a competitive connect, most
    /// reliable first. Region matches are preferred when any exist.
    pub async fn select_racers(&self, criteria: &SelectionCriteria, width: usize) -> Vec<Arc<ExitNode>> {
        let healthy: Vec<_> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|n| n.is_selectable() && !criteria.excludes(n.id()))
            .collect();

        let in_region: Vec<_> = match criteria.wants_region() {
            Some(region) => healthy.iter().filter(|n| n.region() == region).cloned().collect(),
            None => Vec::new(),
        };
        let mut racers = if in_region.is_empty() { healthy } else { in_region };

        racers.sort_by(|a, b| {
            b.reliability()
                .partial_cmp(&a.reliability())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        racers.truncate(width);
        racers
    }

    /// Keep the pools fresh: rebuild every `interval` and on every
    /// membership change until shutdown.
    pub async fn run_refresh(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Pool refresh started, interval {:?}", interval);
        let mut membership = self.registry.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = membership.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
            self.refresh().await;
        }
        info!("Pool refresh stopped");
    }

    async fn no_node(&self) -> SelectionError {
        match self.registry.len().await {
            0 => SelectionError::NoExitNodes,
            total => SelectionError::NoHealthyNode { total },
        }
    }
}

/// Nodes without a latency sample only get the floor weight. Kick off a ping
/// so they start competing on the next pick.
fn ping_unmeasured(nodes: &[Arc<ExitNode>]) {
    for node in nodes {
        if node.is_measured() || node.ping_outstanding() || !node.is_selectable() {
            continue;
        }
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = node.send_ping().await {
                debug!("Proactive ping to {} failed: {}", node.id(), e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::memory_node;

    async fn registry_with(nodes: &[(&str, &str)]) -> (Arc<Registry>, Vec<Arc<ExitNode>>, Vec<crate::network::testing::RemoteEnd>) {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();
        let mut remotes = Vec::new();
        for (id, region) in nodes {
            let (node, _tunnel, remote) = memory_node(id, region);
            registry.register(node.clone()).await.unwrap();
            handles.push(node);
            remotes.push(remote);
        }
        (registry, handles, remotes)
    }

    #[tokio::test]
    async fn empty_registry_reports_no_exit_nodes() {
        for strategy in [SelectionStrategy::Weighted, SelectionStrategy::Pooled] {
            let selector = Selector::new(Arc::new(Registry::new()), strategy, 1.0);
            let err = selector.select(&SelectionCriteria::new()).await.unwrap_err();
            assert!(matches!(err, SelectionError::NoExitNodes));
        }
    }

    #[tokio::test]
    async fn kicked_nodes_are_never_selected() {
        for strategy in [SelectionStrategy::Weighted, SelectionStrategy::Pooled] {
            let (registry, nodes, _remotes) =
                registry_with(&[("10.6.0.1:1", "global"), ("10.6.0.2:1", "global")]).await;
            nodes[0].close_transport();

            let selector = Selector::new(registry, strategy, 1.0);
            for _ in 0..50 {
                let picked = selector.select(&SelectionCriteria::new()).await.unwrap();
                assert!(Arc::ptr_eq(&picked, &nodes[1]));
            }
        }
    }

    #[tokio::test]
    async fn region_is_preferred_with_global_fallback() {
        for strategy in [SelectionStrategy::Weighted, SelectionStrategy::Pooled] {
            let (registry, nodes, _remotes) =
                registry_with(&[("10.6.1.1:1", "DE"), ("10.6.1.2:1", "US"), ("10.6.1.3:1", "global")]).await;
            let selector = Selector::new(registry, strategy, 1.0);

            for _ in 0..30 {
                let picked = selector.select(&SelectionCriteria::new().with_region("DE")).await.unwrap();
                assert!(Arc::ptr_eq(&picked, &nodes[0]));
            }
            assert!(selector.select(&SelectionCriteria::new().with_region("JP")).await.is_ok());
        }
    }

    #[tokio::test]
    async fn exclusion_skips_tried_nodes_until_exhausted() {
        for strategy in [SelectionStrategy::Weighted, SelectionStrategy::Pooled] {
            let (registry, nodes, _remotes) =
                registry_with(&[("10.6.2.1:1", "global"), ("10.6.2.2:1", "global")]).await;
            let selector = Selector::new(registry, strategy, 1.0);

            let tried = SelectionCriteria::new().exclude(nodes[0].id().clone());
            for _ in 0..30 {
                let picked = selector.select(&tried).await.unwrap();
                assert!(Arc::ptr_eq(&picked, &nodes[1]));
            }

            // Everything tried: the exclusion is relaxed instead of failing
            let all = tried.clone().exclude(nodes[1].id().clone());
            assert!(selector.select(&all).await.is_ok());
        }
    }

    async fn wait_for_generation(selector: &Selector, registry: &Registry) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while selector.pools().generation() != registry.generation() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool refresh never caught up");
    }

    #[tokio::test]
    async fn pools_follow_membership_changes() {
        let (registry, nodes, _remotes) = registry_with(&[("10.6.3.1:1", "global")]).await;
        let selector = Arc::new(Selector::new(registry.clone(), SelectionStrategy::Pooled, 1.0));
        selector.select(&SelectionCriteria::new()).await.unwrap();
        assert_eq!(selector.pools().generation(), registry.generation());

        let (stop, stopped) = watch::channel(false);
        let refresher = tokio::spawn(selector.clone().run_refresh(Duration::from_secs(3600), stopped));

        let (late, _tunnel, _remote) = memory_node("10.6.3.2:1", "FR");
        registry.register(late.clone()).await.unwrap();
        wait_for_generation(&selector, &registry).await;
        let picked = selector.select(&SelectionCriteria::new().with_region("FR")).await.unwrap();
        assert!(Arc::ptr_eq(&picked, &late));

        registry.teardown(&nodes[0], "eof").await;
        wait_for_generation(&selector, &registry).await;
        assert_eq!(selector.pools().pool(GLOBAL_REGION).unwrap().len(), 1);

        stop.send(true).unwrap();
        refresher.await.unwrap();
    }

    #[tokio::test]
    async fn stale_pools_serve_until_refreshed() {
        let (registry, nodes, _remotes) = registry_with(&[("10.6.5.1:1", "global")]).await;
        let selector = Selector::new(registry.clone(), SelectionStrategy::Pooled, 1.0);
        selector.select(&SelectionCriteria::new()).await.unwrap();
        let built = selector.pools().generation();

        let (late, _tunnel, _remote) = memory_node("10.6.5.2:1", "FR");
        registry.register(late.clone()).await.unwrap();
        for _ in 0..20 {
            let picked = selector.select(&SelectionCriteria::new().with_region("FR")).await.unwrap();
            assert!(Arc::ptr_eq(&picked, &nodes[0]));
        }
        assert_eq!(selector.pools().generation(), built);

        selector.refresh().await;
        let picked = selector.select(&SelectionCriteria::new().with_region("FR")).await.unwrap();
        assert!(Arc::ptr_eq(&picked, &late));
    }

    #[tokio::test]
    async fn stale_pools_with_no_live_member_rebuild_on_pick() {
        let (registry, nodes, _remotes) = registry_with(&[("10.6.6.1:1", "global")]).await;
        let selector = Selector::new(registry.clone(), SelectionStrategy::Pooled, 1.0);
        selector.select(&SelectionCriteria::new()).await.unwrap();

        registry.teardown(&nodes[0], "eof").await;
        let (late, _tunnel, _remote) = memory_node("10.6.6.2:1", "global");
        registry.register(late.clone()).await.unwrap();

        let picked = selector.select(&SelectionCriteria::new()).await.unwrap();
        assert!(Arc::ptr_eq(&picked, &late));
        assert_eq!(selector.pools().generation(), registry.generation());
    }

    #[tokio::test]
    async fn unmeasured_nodes_get_a_proactive_ping() {
        let (registry, nodes, mut remotes) = registry_with(&[("10.6.4.1:1", "global")]).await;
        let selector = Selector::new(registry, SelectionStrategy::Weighted, 1.0);
        selector.select(&SelectionCriteria::new()).await.unwrap();

        let ping = remotes[0].reader.next_message().await.unwrap().unwrap();
        assert_eq!(ping.kind, crate::protocol::MessageType::Ping);
        assert!(nodes[0].ping_outstanding());
    }

    #[tokio::test]
    async fn racers_are_ordered_by_reliability() {
        let (registry, nodes, _remotes) = registry_with(&[
            ("10.6.5.1:1", "global"),
            ("10.6.5.2:1", "global"),
            ("10.6.5.3:1", "global"),
        ])
        .await;
        nodes[0].penalize();
        nodes[2].reward();

        let selector = Selector::new(registry, SelectionStrategy::Weighted, 1.0);
        let racers = selector.select_racers(&SelectionCriteria::new(), 2).await;
        assert_eq!(racers.len(), 2);
        assert!(Arc::ptr_eq(&racers[0], &nodes[2]));
        assert!(Arc::ptr_eq(&racers[1], &nodes[1]));
    }
}
