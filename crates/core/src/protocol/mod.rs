/// Tunnel protocol between the relay server and exit nodes
///
/// One JSON envelope per line, streamed in order over the tunnel.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, LineReader, MessageCodec};
pub use messages::{ConnectStatus, MessageType, TunnelMessage};
