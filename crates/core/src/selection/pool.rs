/// Precomputed cumulative-weight pools
///
/// A pool keeps its members next to a running sum of their weights, so a
/// pick is a uniform draw plus a binary search. Pools are rebuilt from the
/// registry periodically and whenever membership changes; picks that land on
/// a node that went unhealthy since the build are retried a few times.

use super::weighted::{node_weight, pick_index};
use super::SelectionCriteria;
use crate::network::ExitNode;
use rand::Rng;
use relaymesh_common::config::selection::POOL_PICK_RETRIES;
use relaymesh_common::GLOBAL_REGION;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct WeightedPool {
    members: Vec<Arc<ExitNode>>,
    /// `cumulative[i]` is the sum of weights of members `0..=i`
    cumulative: Vec<f64>,
}

impl WeightedPool {
    pub fn build(entries: Vec<(Arc<ExitNode>, f64)>) -> Self {
        let mut members = Vec::with_capacity(entries.len());
        let mut cumulative = Vec::with_capacity(entries.len());
        let mut total = 0.0;

        for (node, weight) in entries {
            if !(weight > 0.0) || !weight.is_finite() {
                continue;
            }
            total += weight;
            members.push(node);
            cumulative.push(total);
        }

        Self { members, cumulative }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    pub fn members(&self) -> &[Arc<ExitNode>] {
        &self.members
    }

    /// Index of the first member whose cumulative weight exceeds `point`
    pub fn locate(&self, point: f64) -> Option<usize> {
        let index = self.cumulative.partition_point(|covered| *covered <= point);
        (index < self.cumulative.len()).then_some(index)
    }

    /// Draw a healthy, non-excluded member.
    ///
    /// Binary-search draws are retried up to `POOL_PICK_RETRIES` times. If an
    /// exclusion set is in play and every draw missed, the remaining eligible
    /// members are walked linearly so exclusion never hides a usable node.
    pub fn pick<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        criteria: &SelectionCriteria,
    ) -> Option<Arc<ExitNode>> {
        let total = self.total_weight();
        if self.is_empty() || !(total > 0.0) {
            return None;
        }

        let eligible = |node: &Arc<ExitNode>| node.is_selectable() && !criteria.excludes(node.id());

        for _ in 0..POOL_PICK_RETRIES {
            let point = rng.gen_range(0.0..total);
            if let Some(node) = self.locate(point).map(|i| &self.members[i]) {
                if eligible(node) {
                    return Some(node.clone());
                }
            }
        }

        if criteria.excluded.is_empty() {
            return None;
        }

        let mut candidates = Vec::new();
        let mut weights = Vec::new();
        let mut previous = 0.0;
        for (node, covered) in self.members.iter().zip(&self.cumulative) {
            if eligible(node) {
                candidates.push(node);
                weights.push(covered - previous);
            }
            previous = *covered;
        }
        pick_index(&weights, rng).map(|i| candidates[i].clone())
    }
}

/// Per-region pools plus one global pool over every healthy node
#[derive(Debug, Default)]
pub struct PoolSet {
    pools: HashMap<String, WeightedPool>,
    generation: u64,
}

impl PoolSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from a registry snapshot. Unhealthy nodes are left out.
    pub fn rebuild(nodes: &[Arc<ExitNode>], exponent: f64, generation: u64) -> Self {
        let mut by_region: HashMap<String, Vec<(Arc<ExitNode>, f64)>> = HashMap::new();

        for node in nodes.iter().filter(|n| n.is_selectable()) {
            let weight = node_weight(node, exponent);
            if node.region() != GLOBAL_REGION {
                by_region
                    .entry(node.region().to_string())
                    .or_default()
                    .push((node.clone(), weight));
            }
            by_region
                .entry(GLOBAL_REGION.to_string())
                .or_default()
                .push((node.clone(), weight));
        }

        let pools = by_region
            .into_iter()
            .map(|(region, entries)| (region, WeightedPool::build(entries)))
            .collect();

        Self { pools, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pool(&self, region: &str) -> Option<&WeightedPool> {
        self.pools.get(region)
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    /// Try the requested region's pool first, then the global pool
    pub fn select<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        criteria: &SelectionCriteria,
    ) -> Option<Arc<ExitNode>> {
        if let Some(region) = criteria.region.as_deref() {
            if region != GLOBAL_REGION {
                if let Some(node) = self.pool(region).and_then(|p| p.pick(rng, criteria)) {
                    return Some(node);
                }
            }
        }
        self.pool(GLOBAL_REGION)?.pick(rng, criteria)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::memory_node;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[tokio::test]
    async fn binary_search_boundaries() {
        let (a, _ta, _ra) = memory_node("10.5.0.1:1", "global");
        let (b, _tb, _rb) = memory_node("10.5.0.2:1", "global");
        let (c, _tc, _rc) = memory_node("10.5.0.3:1", "global");
        let pool = WeightedPool::build(vec![(a, 10.0), (b, 50.0), (c, 90.0)]);

        assert_eq!(pool.total_weight(), 150.0);
        assert_eq!(pool.locate(0.0), Some(0));
        assert_eq!(pool.locate(9.99), Some(0));
        assert_eq!(pool.locate(10.0), Some(1));
        assert_eq!(pool.locate(59.9), Some(1));
        assert_eq!(pool.locate(60.0), Some(2));
        assert_eq!(pool.locate(149.9), Some(2));
        assert_eq!(pool.locate(150.0), None);
    }

    #[tokio::test]
    async fn pool_frequency_tracks_weights() {
        let (a, _ta, _ra) = memory_node("10.5.1.1:1", "global");
        let (b, _tb, _rb) = memory_node("10.5.1.2:1", "global");
        let (c, _tc, _rc) = memory_node("10.5.1.3:1", "global");
        let pool = WeightedPool::build(vec![(a, 10.0), (b, 50.0), (c.clone(), 90.0)]);

        let mut rng = StdRng::seed_from_u64(11);
        let criteria = SelectionCriteria::new();
        let draws = 10_000;
        let hits = (0..draws)
            .filter(|_| Arc::ptr_eq(&pool.pick(&mut rng, &criteria).unwrap(), &c))
            .count();

        let share = hits as f64 / draws as f64;
        assert!((share - 0.6).abs() < 0.05, "heaviest node share {}", share);
    }

    #[tokio::test]
    async fn exclusion_falls_back_to_linear_walk() {
        let (heavy, _th, _rh) = memory_node("10.5.2.1:1", "global");
        let (light, _tl, _rl) = memory_node("10.5.2.2:1", "global");
        let pool = WeightedPool::build(vec![(heavy.clone(), 1_000_000.0), (light.clone(), 1.0)]);

        let criteria = SelectionCriteria::new().exclude(heavy.id().clone());
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            let picked = pool.pick(&mut rng, &criteria).unwrap();
            assert!(Arc::ptr_eq(&picked, &light));
        }
    }

    #[tokio::test]
    async fn kicked_member_is_never_returned() {
        let (dead, _td, _rd) = memory_node("10.5.3.1:1", "global");
        let pool = WeightedPool::build(vec![(dead.clone(), 5.0)]);
        dead.close_transport();

        let mut rng = StdRng::seed_from_u64(5);
        assert!(pool.pick(&mut rng, &SelectionCriteria::new()).is_none());
    }

    #[tokio::test]
    async fn region_pool_is_preferred_then_global() {
        let (de, _t1, _r1) = memory_node("10.5.4.1:1", "DE");
        let (us, _t2, _r2) = memory_node("10.5.4.2:1", "US");
        let set = PoolSet::rebuild(&[de.clone(), us.clone()], 1.0, 7);

        assert_eq!(set.generation(), 7);
        assert_eq!(set.pool("DE").unwrap().len(), 1);
        assert_eq!(set.pool(GLOBAL_REGION).unwrap().len(), 2);

        let mut rng = StdRng::seed_from_u64(9);
        let wants_de = SelectionCriteria::new().with_region("DE");
        for _ in 0..50 {
            assert!(Arc::ptr_eq(&set.select(&mut rng, &wants_de).unwrap(), &de));
        }

        // No FR pool: fall back to global
        let wants_fr = SelectionCriteria::new().with_region("FR");
        assert!(set.select(&mut rng, &wants_fr).is_some());

        // Regional pool exhausted by exclusion: fall back to global
        let de_excluded = SelectionCriteria::new().with_region("DE").exclude(de.id().clone());
        assert!(Arc::ptr_eq(&set.select(&mut rng, &de_excluded).unwrap(), &us));
    }
}
