use data_encoding::BASE64;
use relaymesh_common::StreamId;
use serde::{Deserialize, Serialize};

use super::codec::CodecError;

/// Envelope kinds exchanged over an exit-node tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Connect,
    ConnectResponse,
    Data,
    Close,
    Ping,
    Pong,
    Address,
    Crash,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Connect => "connect",
            MessageType::ConnectResponse => "connect_response",
            MessageType::Data => "data",
            MessageType::Close => "close",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Address => "address",
            MessageType::Crash => "crash",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectStatus {
    Success,
    Failure,
}

/// One line of the tunnel protocol.
///
/// Every field except `type` is optional on the wire and omitted when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Logical stream id, or the reward identity on `address` messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Combined `host:port`, accepted in place of `host` and `port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,

    /// Base64 payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConnectStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl TunnelMessage {
    fn bare(kind: MessageType) -> Self {
        Self {
            kind,
            id: None,
            host: None,
            port: None,
            addr: None,
            data: None,
            status: None,
            error: None,
            address: None,
            stacktrace: None,
        }
    }

    fn for_stream(kind: MessageType, id: StreamId) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::bare(kind)
        }
    }

    /// Ask the exit node to open `id` towards `host:port`, optionally carrying
    /// bytes already read from the end user.
    pub fn connect(id: StreamId, host: &str, port: u16, initial: Option<&[u8]>) -> Self {
        Self {
            host: Some(host.to_string()),
            port: Some(port),
            data: initial.filter(|b| !b.is_empty()).map(|b| BASE64.encode(b)),
            ..Self::for_stream(MessageType::Connect, id)
        }
    }

    pub fn connect_success(id: StreamId) -> Self {
        Self {
            status: Some(ConnectStatus::Success),
            ..Self::for_stream(MessageType::ConnectResponse, id)
        }
    }

    pub fn connect_failure(id: StreamId, error: impl Into<String>) -> Self {
        Self {
            status: Some(ConnectStatus::Failure),
            error: Some(error.into()),
            ..Self::for_stream(MessageType::ConnectResponse, id)
        }
    }

    pub fn data(id: StreamId, payload: &[u8]) -> Self {
        Self {
            data: Some(BASE64.encode(payload)),
            ..Self::for_stream(MessageType::Data, id)
        }
    }

    pub fn close(id: StreamId) -> Self {
        Self::for_stream(MessageType::Close, id)
    }

    pub fn ping() -> Self {
        Self::bare(MessageType::Ping)
    }

    pub fn pong() -> Self {
        Self::bare(MessageType::Pong)
    }

    pub fn address(identity: impl Into<String>) -> Self {
        Self {
            id: Some(identity.into()),
            ..Self::bare(MessageType::Address)
        }
    }

    pub fn crash(stacktrace: impl Into<String>) -> Self {
        Self {
            stacktrace: Some(stacktrace.into()),
            ..Self::bare(MessageType::Crash)
        }
    }

    /// Parsed logical stream id, if the envelope carries a numeric one
    pub fn stream_id(&self) -> Option<StreamId> {
        self.id.as_deref().and_then(|id| id.parse().ok())
    }

    /// Decoded payload; an absent `data` field is an empty payload
    pub fn payload(&self) -> Result<Vec<u8>, CodecError> {
        match &self.data {
            Some(encoded) => BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| CodecError::InvalidPayload(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// Dial target, from `host`/`port` or the combined `addr` field
    pub fn target(&self) -> Option<(String, u16)> {
        if let (Some(host), Some(port)) = (&self.host, self.port) {
            return Some((host.clone(), port));
        }

        let addr = self.addr.as_deref()?;
        let (host, port) = addr.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = port.parse().ok()?;
        Some((host.to_string(), port))
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(ConnectStatus::Success)
    }

    /// Reward identity announced by an `address` message
    pub fn reward_identity(&self) -> Option<&str> {
        self.address
            .as_deref()
            .or(self.id.as_deref())
            .filter(|s| !s.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_omits_empty_initial_data() {
        let msg = TunnelMessage::connect(StreamId::from_raw(42), "example.com", 443, Some(&[]));
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"connect","id":"42","host":"example.com","port":443}"#
        );
    }

    #[test]
    fn data_payload_roundtrips_through_base64() {
        let msg = TunnelMessage::data(StreamId::from_raw(7), b"hello");
        assert_eq!(msg.data.as_deref(), Some("aGVsbG8="));
        assert_eq!(msg.payload().unwrap(), b"hello");
    }

    #[test]
    fn invalid_base64_is_reported() {
        let mut msg = TunnelMessage::data(StreamId::from_raw(7), b"x");
        msg.data = Some("!!not base64!!".to_string());
        assert!(matches!(msg.payload(), Err(CodecError::InvalidPayload(_))));
    }

    #[test]
    fn target_from_combined_addr() {
        let mut msg = TunnelMessage::bare(MessageType::Connect);
        msg.addr = Some("[2001:db8::1]:8443".to_string());
        assert_eq!(msg.target(), Some(("2001:db8::1".to_string(), 8443)));

        msg.addr = Some("example.com:80".to_string());
        assert_eq!(msg.target(), Some(("example.com".to_string(), 80)));
    }

    #[test]
    fn reward_identity_prefers_address_field() {
        let mut msg = TunnelMessage::address("uid-1");
        assert_eq!(msg.reward_identity(), Some("uid-1"));

        msg.address = Some("bc1qwallet".to_string());
        assert_eq!(msg.reward_identity(), Some("bc1qwallet"));
    }

    #[test]
    fn non_numeric_id_has_no_stream_id() {
        let msg = TunnelMessage::address("wallet");
        assert_eq!(msg.stream_id(), None);
    }
}
