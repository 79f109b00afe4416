/// WebSocket tunnel endpoint
///
/// Exit nodes that cannot speak QUIC attach here. Every text frame carries
/// exactly one envelope, so the framing is the message boundary and no
/// newline is sent.

use super::handlers::{AppError, AppState};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relaymesh_common::NodeId;
use relaymesh_core::{
    CodecError, MessageCodec, RelayServer, TransportKind, TunnelMessage, TunnelReader,
    TunnelWriter,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct WsTunnelReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl TunnelReader for WsTunnelReader {
    async fn next_message(&mut self) -> Result<Option<TunnelMessage>, CodecError> {
        while let Some(frame) = self.stream.next().await {
            let frame = frame.map_err(|e| CodecError::Transport(e.to_string()))?;
            let bytes = match &frame {
                Message::Text(text) => text.as_bytes(),
                Message::Binary(bytes) => bytes.as_slice(),
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if bytes.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return MessageCodec::decode(bytes).map(Some);
        }
        Ok(None)
    }
}

pub struct WsTunnelWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl TunnelWriter for WsTunnelWriter {
    async fn send_message(&mut self, message: &TunnelMessage) -> Result<(), CodecError> {
        let mut frame = MessageCodec::encode(message)?;
        frame.pop();
        let text = String::from_utf8(frame).map_err(|e| CodecError::InvalidPayload(e.to_string()))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| CodecError::Transport(e.to_string()))
    }

    async fn shutdown(&mut self) {
        let _ = self.sink.close().await;
    }
}

/// Refuse a second tunnel from an address that is already attached
pub async fn admit(server: &RelayServer, remote: SocketAddr) -> Result<NodeId, AppError> {
    let id = NodeId::from_addr(remote);
    if server.is_shutting_down() {
        return Err(AppError::internal("Server is shutting down"));
    }
    if server.registry().contains(&id).await {
        return Err(AppError::conflict(
            "A client with your address is already connected to the network",
        ));
    }
    Ok(id)
}

/// Handler for GET /ws
pub async fn ws_tunnel(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let id = admit(&state.server, remote).await?;
    let server = state.server.clone();
    Ok(ws.on_upgrade(move |socket| run_tunnel(server, id, remote, socket)))
}

async fn run_tunnel(server: Arc<RelayServer>, id: NodeId, remote: SocketAddr, socket: WebSocket) {
    info!("WebSocket tunnel from {}", remote);
    let (sink, stream) = socket.split();
    let reader = Box::new(WsTunnelReader { stream });
    let writer = Box::new(WsTunnelWriter { sink });

    match server
        .attach_tunnel(id.clone(), remote.ip(), TransportKind::WebSocket, reader, writer)
        .await
    {
        Ok(handle) => {
            if let Err(e) = handle.await {
                warn!("Tunnel task for {} failed: {}", id, e);
            }
            debug!("WebSocket tunnel {} finished", id);
        }
        Err(e) => warn!("Failed to attach WebSocket tunnel from {}: {}", remote, e),
    }
}
