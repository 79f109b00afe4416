/// Read-only fleet statistics for the operational API

use crate::network::{ExitNode, Registry, StreamSnapshot};
use crate::transport::TransportKind;
use relaymesh_common::Bandwidth;
use serde::Serialize;

/// One exit node's row
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub id: String,
    pub region: String,
    pub transport: TransportKind,
    pub connected_at: u64,
    pub uptime_secs: u64,
    pub active_conns: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub total_traffic: String,
    pub score: f64,
    pub latency_ms: Option<f64>,
    pub reliability: f64,
    pub reward_address: Option<String>,
    pub estimated_reward_usd: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamSnapshot>,
}

impl NodeSummary {
    /// Summarize `node`; live streams are listed only when `with_streams`
    pub fn of(node: &ExitNode, with_streams: bool) -> Self {
        let health = node.health();
        let total = Bandwidth::from_bytes(node.bytes_sent() + node.bytes_received());

        Self {
            id: node.id().to_string(),
            region: node.region().to_string(),
            transport: node.transport(),
            connected_at: node.connected_at().as_millis(),
            uptime_secs: node.connected_at().elapsed().as_secs(),
            active_conns: node.active_conns(),
            bytes_sent: node.bytes_sent(),
            bytes_received: node.bytes_received(),
            total_traffic: total.to_string(),
            score: health.score,
            latency_ms: health.latency_ms,
            reliability: health.reliability,
            reward_address: node.reward_address(),
            estimated_reward_usd: total.estimated_reward_usd(),
            streams: if with_streams {
                node.stream_snapshots()
            } else {
                Vec::new()
            },
        }
    }
}

/// Fleet totals plus per-node rows
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetStats {
    pub node_count: usize,
    pub active_conns: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub total_traffic: String,
    pub estimated_reward_usd: f64,
    pub nodes: Vec<NodeSummary>,
}

/// Snapshot the fleet. With `reward_address` set, only nodes announcing that
/// address are included.
pub async fn collect_stats(registry: &Registry, reward_address: Option<&str>) -> FleetStats {
    let mut nodes: Vec<NodeSummary> = registry
        .snapshot()
        .await
        .iter()
        .filter(|node| match reward_address {
            Some(filter) => node.reward_address().as_deref() == Some(filter),
            None => true,
        })
        .map(|node| NodeSummary::of(node, false))
        .collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    let bytes_sent: u64 = nodes.iter().map(|n| n.bytes_sent).sum();
    let bytes_received: u64 = nodes.iter().map(|n| n.bytes_received).sum();
    let total = Bandwidth::from_bytes(bytes_sent + bytes_received);

    FleetStats {
        node_count: nodes.len(),
        active_conns: nodes.iter().map(|n| n.active_conns).sum(),
        bytes_sent,
        bytes_received,
        total_traffic: total.to_string(),
        estimated_reward_usd: total.estimated_reward_usd(),
        nodes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::memory_node;
    use crate::relay::LogicalStream;
    use relaymesh_common::StreamId;

    #[tokio::test]
    async fn address_filter_selects_matching_nodes() {
        let registry = Registry::new();
        let (mine, _t1, _r1) = memory_node("10.9.0.1:1", "global");
        let (theirs, _t2, _r2) = memory_node("10.9.0.2:1", "DE");
        let (anonymous, _t3, _r3) = memory_node("10.9.0.3:1", "global");
        mine.set_reward_address("wallet-a");
        theirs.set_reward_address("wallet-b");
        for node in [&mine, &theirs, &anonymous] {
            registry.register(node.clone()).await.unwrap();
        }

        mine.add_bytes_sent(2_000_000_000);
        mine.add_bytes_received(1_000_000_000);

        let stats = collect_stats(&registry, Some("wallet-a")).await;
        assert_eq!(stats.node_count, 1);
        assert_eq!(stats.nodes[0].id, "10.9.0.1:1");
        assert!((stats.estimated_reward_usd - 0.03).abs() < 1e-9);

        let all = collect_stats(&registry, None).await;
        assert_eq!(all.node_count, 3);
        assert!(collect_stats(&registry, Some("nobody")).await.nodes.is_empty());
    }

    #[tokio::test]
    async fn node_detail_lists_live_streams() {
        let (node, _tunnel, _remote) = memory_node("10.9.1.1:1", "global");
        let (stream, _rx) = LogicalStream::new("example.com:443");
        stream.metrics.add_sent(10);
        node.insert_stream(StreamId::next(), stream);

        let summary = NodeSummary::of(&node, true);
        assert_eq!(summary.active_conns, 1);
        assert_eq!(summary.streams.len(), 1);
        assert_eq!(summary.streams[0].target, "example.com:443");
        assert_eq!(summary.streams[0].bytes_sent, 10);
        assert!(NodeSummary::of(&node, false).streams.is_empty());
    }
}
