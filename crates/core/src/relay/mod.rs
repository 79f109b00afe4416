/// Relay engine: logical streams, connect strategies and byte pumping

pub mod competition;
pub mod engine;
pub mod stream;

pub use competition::CompetitiveConnector;
pub use engine::{
    ConnectRequest, EstablishedStream, IngressProtocol, RelayEngine, RelaySettings, RelaySummary,
};
pub use stream::{LogicalStream, StreamMetrics};
