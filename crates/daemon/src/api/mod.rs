/// Operational HTTP surface of the relay server
///
/// Read-only fleet statistics for dashboards and the `/ws` endpoint that
/// lets exit nodes attach over WebSocket instead of QUIC.

pub mod handlers;
pub mod responses;
pub mod server;
pub mod ws;

pub use responses::*;
pub use server::{router, ApiServer};
