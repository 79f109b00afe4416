//! Newline-delimited JSON framing for tunnel envelopes.

use super::messages::TunnelMessage;
use relaymesh_common::config::protocol::MAX_LINE_SIZE;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stateless encoder/decoder for single envelopes
pub struct MessageCodec;

impl MessageCodec {
    /// Serialize one envelope followed by exactly one `\n`
    pub fn encode(message: &TunnelMessage) -> Result<Vec<u8>, CodecError> {
        let mut buf = serde_json::to_vec(message)?;
        buf.push(b'\n');
        Ok(buf)
    }

    /// Parse one envelope; surrounding whitespace (including `\r\n`) is ignored
    pub fn decode(line: &[u8]) -> Result<TunnelMessage, CodecError> {
        Ok(serde_json::from_slice(trim_line(line))?)
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |pos| pos + 1);
    &line[start..end]
}

/// Streaming decoder over any byte source.
///
/// Each call to [`LineReader::next_message`] yields the next complete
/// envelope, `None` on a clean end of stream, or an error on corruption.
pub struct LineReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    max_line: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_line(inner, MAX_LINE_SIZE)
    }

    pub fn with_max_line(inner: R, max_line: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: Vec::new(),
            max_line,
        }
    }

    pub async fn next_message(&mut self) -> Result<Option<TunnelMessage>, CodecError> {
        loop {
            self.line.clear();
            let eof = self.fill_line().await?;

            if trim_line(&self.line).is_empty() {
                if eof {
                    return Ok(None);
                }
                continue;
            }

            trace!("decoding {} byte envelope", self.line.len());
            return MessageCodec::decode(&self.line).map(Some);
        }
    }

    /// Read up to the next newline into `self.line`. Returns true at end of stream.
    async fn fill_line(&mut self) -> Result<bool, CodecError> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(true);
            }

            let (consumed, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.line.extend_from_slice(&available[..pos]);
                    (pos + 1, true)
                }
                None => {
                    self.line.extend_from_slice(available);
                    (available.len(), false)
                }
            };
            self.reader.consume(consumed);

            if self.line.len() > self.max_line {
                return Err(CodecError::LineTooLong(self.max_line));
            }
            if complete {
                return Ok(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ConnectStatus, MessageType};
    use relaymesh_common::StreamId;

    #[test]
    fn encode_appends_single_newline() {
        let bytes = MessageCodec::encode(&TunnelMessage::ping()).unwrap();
        assert_eq!(bytes, b"{\"type\":\"ping\"}\n");
    }

    #[test]
    fn decodes_wire_examples() {
        let connect = MessageCodec::decode(
            br#"{"type":"connect","id":"42","host":"example.com","port":443,"data":"aGk="}"#,
        )
        .unwrap();
        assert_eq!(connect.kind, MessageType::Connect);
        assert_eq!(connect.stream_id(), Some(StreamId::from_raw(42)));
        assert_eq!(connect.target(), Some(("example.com".to_string(), 443)));
        assert_eq!(connect.payload().unwrap(), b"hi");

        let ok = MessageCodec::decode(br#"{"type":"connect_response","id":"42","status":"success"}"#)
            .unwrap();
        assert!(ok.is_success());

        let failed = MessageCodec::decode(
            br#"{"type":"connect_response","id":"42","status":"failure","error":"dial tcp: timeout"}"#,
        )
        .unwrap();
        assert_eq!(failed.status, Some(ConnectStatus::Failure));
        assert_eq!(failed.error.as_deref(), Some("dial tcp: timeout"));

        let close = MessageCodec::decode(br#"{"type":"close","id":"42"}"#).unwrap();
        assert_eq!(close.kind, MessageType::Close);

        let pong = MessageCodec::decode(b"{\"type\":\"pong\"}\r\n").unwrap();
        assert_eq!(pong, TunnelMessage::pong());

        let address = MessageCodec::decode(br#"{"type":"address","id":"bc1qxyz"}"#).unwrap();
        assert_eq!(address.reward_identity(), Some("bc1qxyz"));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let err = MessageCodec::decode(br#"{"type":"teleport","id":"1"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[tokio::test]
    async fn line_reader_streams_messages_in_order() {
        let input = b"{\"type\":\"ping\"}\n\n{\"type\":\"close\",\"id\":\"3\"}\n{\"type\":\"pong\"}";
        let mut reader = LineReader::new(&input[..]);

        assert_eq!(reader.next_message().await.unwrap(), Some(TunnelMessage::ping()));
        assert_eq!(
            reader.next_message().await.unwrap(),
            Some(TunnelMessage::close(StreamId::from_raw(3)))
        );
        assert_eq!(reader.next_message().await.unwrap(), Some(TunnelMessage::pong()));
        assert_eq!(reader.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn line_reader_rejects_corruption() {
        let mut reader = LineReader::new(&b"{\"type\":\"ping\"}\nnot json\n"[..]);
        assert!(reader.next_message().await.unwrap().is_some());
        assert!(reader.next_message().await.is_err());
    }

    #[tokio::test]
    async fn line_reader_enforces_max_line() {
        let long = format!("{{\"type\":\"data\",\"id\":\"1\",\"data\":\"{}\"}}\n", "A".repeat(256));
        let mut reader = LineReader::with_max_line(long.as_bytes(), 64);
        assert!(matches!(
            reader.next_message().await,
            Err(CodecError::LineTooLong(64))
        ));
    }
}
