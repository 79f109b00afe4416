pub mod exit;
pub mod network;
pub mod protocol;
pub mod relay;
pub mod selection;
pub mod server;
pub mod stats;
pub mod telemetry;
pub mod transport;

pub use protocol::*;

// Re-export fleet types
pub use network::{
    ExitNode, GlobalRegion, HealthSnapshot, MessageDispatcher, PingMonitor, RegionResolver,
    Registry, StaticRegionResolver, StreamSnapshot,
};

// Re-export selection and relay types
pub use relay::{
    CompetitiveConnector, ConnectRequest, EstablishedStream, IngressProtocol, RelayEngine,
    RelaySettings, RelaySummary,
};
pub use selection::{SelectionCriteria, SelectionError, Selector};

pub use exit::ExitAgent;
pub use server::RelayServer;
pub use stats::{collect_stats, FleetStats, NodeSummary};
pub use telemetry::{
    CloseReason, ConnectionLogger, ConnectionMetrics, JsonLinesConnectionLogger,
    TracingConnectionLogger,
};
pub use transport::{
    BoxedTunnelReader, BoxedTunnelWriter, TransportKind, TunnelReader, TunnelWriter,
};
