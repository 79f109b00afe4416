/// Transport layer for exit-node tunnels
///
/// QUIC endpoints (ALPN `relaymesh/1`) and the framed reader/writer
/// abstraction that the registry and relay engine work against, so a tunnel
/// can equally be a QUIC stream, a WebSocket or an in-memory pipe.

mod connection;
mod endpoint;
mod sink;
mod tunnel;

pub use connection::{Connection, ConnectionError};
pub use endpoint::{Endpoint, EndpointConfig, EndpointError};
pub use sink::TunnelSink;
pub use tunnel::{
    quic_tunnel, split_tunnel, BoxedTunnelReader, BoxedTunnelWriter, LineWriter, TransportKind,
    TunnelReader, TunnelWriter,
};
