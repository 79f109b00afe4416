/// Per-tunnel reader loop
///
/// Exactly one dispatcher runs per exit node. It decodes envelopes in arrival
/// order and routes them:
/// - `connect_response` to the pending connect waiter
/// - `data` to the logical stream's inbound queue (blocking when full)
/// - `close` releases the logical stream
/// - `ping` / `pong` for liveness and latency
/// - `address` / `crash` for reward identity and diagnostics
///
/// When the loop ends for any reason the node is torn down through the
/// registry.

use super::exit_node::ExitNode;
use super::registry::Registry;
use crate::protocol::{MessageType, TunnelMessage};
use crate::transport::BoxedTunnelReader;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// What the loop should do after one envelope
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop(&'static str),
}

pub struct MessageDispatcher {
    registry: Arc<Registry>,
    node: Arc<ExitNode>,
}

impl MessageDispatcher {
    pub fn new(registry: Arc<Registry>, node: Arc<ExitNode>) -> Self {
        Self { registry, node }
    }

    /// Drive the tunnel until EOF, a decode error or a shutdown request,
    /// then tear the node down.
    pub async fn run(self, mut reader: BoxedTunnelReader) {
        let reason = loop {
            let next = tokio::select! {
                _ = self.node.closed() => break "closed",
                next = reader.next_message() => next,
            };

            match next {
                Ok(Some(message)) => {
                    if let Flow::Stop(reason) = self.dispatch(message).await {
                        break reason;
                    }
                }
                Ok(None) => break "tunnel closed by peer",
                Err(e) => {
                    warn!("Exit node {} sent an undecodable envelope: {}", self.node.id(), e);
                    break "decode error";
                }
            }
        };

        self.registry.teardown(&self.node, reason).await;
    }

    async fn dispatch(&self, message: TunnelMessage) -> Flow {
        trace!("{} <- {}", self.node.id(), message.kind);

        match message.kind {
            MessageType::ConnectResponse => self.handle_connect_response(message),
            MessageType::Data => self.handle_data(message).await,
            MessageType::Close => self.handle_close(message),
            MessageType::Ping => match self.node.send(&TunnelMessage::pong()).await {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Stop("write error"),
            },
            MessageType::Pong => self.handle_pong().await,
            MessageType::Address => {
                match message.reward_identity() {
                    Some(identity) => {
                        info!("Exit node {} reward address set to {}", self.node.id(), identity);
                        self.node.set_reward_address(identity);
                    }
                    None => debug!("Exit node {} sent an empty address", self.node.id()),
                }
                Flow::Continue
            }
            MessageType::Crash => {
                error!(
                    "Exit node {} reported a crash:\n{}",
                    self.node.id(),
                    message.stacktrace.as_deref().unwrap_or("<no stacktrace>")
                );
                Flow::Continue
            }
            MessageType::Connect => {
                warn!("Exit node {} sent a connect request, ignoring", self.node.id());
                Flow::Continue
            }
        }
    }

    fn handle_connect_response(&self, message: TunnelMessage) -> Flow {
        let Some(id) = message.stream_id() else {
            debug!("connect_response without a stream id from {}", self.node.id());
            return Flow::Continue;
        };

        let outcome = if message.is_success() {
            Ok(())
        } else {
            Err(message.error.unwrap_or_else(|| "connect failed".to_string()))
        };

        if !self.node.resolve_pending(id, outcome) {
            debug!("Late connect_response for stream {} on {}", id, self.node.id());
        }
        Flow::Continue
    }

    async fn handle_data(&self, message: TunnelMessage) -> Flow {
        let Some(id) = message.stream_id() else {
            return Flow::Continue;
        };

        // Clone the sender so the stream lock is not held across the push
        let Some(inbound) = self.node.stream_sender(id) else {
            trace!("data for unknown stream {} on {}", id, self.node.id());
            return Flow::Continue;
        };

        let payload = match message.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Suspicious payload for stream {} from {}: {}", id, self.node.id(), e);
                return Flow::Continue;
            }
        };
        if payload.is_empty() {
            return Flow::Continue;
        }

        // Blocks the whole tunnel while this stream's queue is full
        tokio::select! {
            result = inbound.send(payload) => {
                if result.is_err() {
                    trace!("stream {} on {} finished before data arrived", id, self.node.id());
                }
                Flow::Continue
            }
            _ = self.node.closed() => Flow::Stop("closed"),
        }
    }

    fn handle_close(&self, message: TunnelMessage) -> Flow {
        if let Some(id) = message.stream_id() {
            if self.node.release_stream(id).is_some() {
                debug!("Exit node {} closed stream {}", self.node.id(), id);
            }
        }
        Flow::Continue
    }

    async fn handle_pong(&self) -> Flow {
        let Some(rtt) = self.node.record_pong() else {
            trace!("Unsolicited pong from {}", self.node.id());
            return Flow::Continue;
        };
        debug!("Exit node {} rtt {:?}", self.node.id(), rtt);

        // Fill the latency window quickly after connecting
        if self.node.needs_warmup() && self.node.send_ping().await.is_err() {
            return Flow::Stop("write error");
        }
        Flow::Continue
    }
}
