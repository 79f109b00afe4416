use super::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Result of one ping sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PingRound {
    pub sent: usize,
    pub waiting: usize,
    pub kicked: usize,
}

/// Fleet-wide liveness ticker.
///
/// Every tick each node gets a ping unless one is still outstanding. A ping
/// that has been outstanding for a whole interval gets the node kicked.
pub struct PingMonitor {
    registry: Arc<Registry>,
    interval: Duration,
}

impl PingMonitor {
    pub fn new(registry: Arc<Registry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Ping monitor started, interval {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let round = self.tick().await;
                    debug!("Ping round: {:?}", round);
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Ping monitor stopped");
    }

    pub async fn tick(&self) -> PingRound {
        let mut round = PingRound::default();

        for node in self.registry.snapshot().await {
            if node.ping_overdue(self.interval) {
                if self.registry.kick(&node, "ping timeout").await {
                    round.kicked += 1;
                }
                continue;
            }

            match node.send_ping().await {
                Ok(true) => round.sent += 1,
                // A warm-up ping is still in flight
                Ok(false) => round.waiting += 1,
                Err(e) => {
                    debug!("Ping to {} failed: {}", node.id(), e);
                    if self.registry.kick(&node, "ping send error").await {
                        round.kicked += 1;
                    }
                }
            }
        }

        round
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::memory_node;
    use crate::protocol::MessageType;

    #[tokio::test]
    async fn silent_node_is_kicked_on_the_following_tick() {
        let registry = Arc::new(Registry::new());
        let (node, _tunnel, mut remote) = memory_node("10.3.0.1:1", "global");
        registry.register(node.clone()).await.unwrap();

        let monitor = PingMonitor::new(registry.clone(), Duration::from_millis(20));
        assert_eq!(monitor.tick().await.sent, 1);
        let ping = remote.reader.next_message().await.unwrap().unwrap();
        assert_eq!(ping.kind, MessageType::Ping);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let round = monitor.tick().await;
        assert_eq!(round.kicked, 1);
        assert!(registry.is_empty().await);
        assert!(node.is_kicked());
    }

    #[tokio::test]
    async fn recent_ping_is_not_a_timeout() {
        let registry = Arc::new(Registry::new());
        let (node, _tunnel, _remote) = memory_node("10.3.0.2:1", "global");
        registry.register(node.clone()).await.unwrap();

        let monitor = PingMonitor::new(registry.clone(), Duration::from_secs(5));
        assert_eq!(monitor.tick().await.sent, 1);

        let round = monitor.tick().await;
        assert_eq!(round, PingRound { sent: 0, waiting: 1, kicked: 0 });
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn answered_ping_allows_next_round() {
        let registry = Arc::new(Registry::new());
        let (node, _tunnel, _remote) = memory_node("10.3.0.3:1", "global");
        registry.register(node.clone()).await.unwrap();

        let monitor = PingMonitor::new(registry.clone(), Duration::from_secs(5));
        monitor.tick().await;
        assert!(node.record_pong().is_some());

        assert_eq!(monitor.tick().await.sent, 1);
    }
}
