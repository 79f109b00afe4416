/// Exit-node fleet management
///
/// This module tracks live exit-node tunnels and their health: the registry,
/// the per-node handle, the per-tunnel reader loop, scoring, the ping
/// monitor and region resolution.

pub mod exit_node;
pub mod health;
pub mod message_dispatcher;
pub mod ping;
pub mod region;
pub mod registry;

pub use exit_node::{ConnectOutcome, ExitNode, StreamSnapshot};
pub use health::{compute_score, latency_score, HealthMetrics, HealthSnapshot};
pub use message_dispatcher::MessageDispatcher;
pub use ping::{PingMonitor, PingRound};
pub use region::{GlobalRegion, RegionResolver, StaticRegionResolver};
pub use registry::Registry;
