/// relaymesh daemon library
///
/// Everything the `relaymesh` binary runs around the core: the end-user
/// proxy listeners, the stats API and the WebSocket tunnel endpoint.

pub mod api;
pub mod proxy;

pub use api::ApiServer;
pub use proxy::{HttpProxy, ProxyManager, Socks5Server};
