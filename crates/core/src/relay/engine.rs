/// Logical stream lifecycle
///
/// A user connection moves through connect, relay and close:
/// - `open` allocates a stream id, registers the inbound queue and the
///   pending response, then writes the `connect` envelope
/// - `await_response` waits for the node's verdict with a timeout
/// - `relay` pumps bytes both ways until either side ends
///
/// Whoever removes the stream from the node's table owns the `close`, so a
/// stream is released exactly once whatever order the two sides finish in.

use super::competition::CompetitiveConnector;
use super::stream::{LogicalStream, StreamMetrics};
use crate::network::{ConnectOutcome, ExitNode};
use crate::protocol::TunnelMessage;
use crate::selection::{SelectionCriteria, Selector};
use crate::telemetry::{CloseReason, ConnectionLogger, ConnectionMetrics};
use relaymesh_common::config::relay;
use relaymesh_common::{RelayMeshError, Result, ServerConfig, StreamId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Front end a user connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressProtocol {
    Socks5,
    Http,
}

impl IngressProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngressProtocol::Socks5 => "socks5",
            IngressProtocol::Http => "http",
        }
    }
}

impl fmt::Display for IngressProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's request to reach `host:port` through the mesh
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    /// Bytes the client already sent, delivered with the connect
    pub initial_data: Vec<u8>,
    pub region: Option<String>,
    pub protocol: IngressProtocol,
}

impl ConnectRequest {
    pub fn new(host: impl Into<String>, port: u16, protocol: IngressProtocol) -> Self {
        Self {
            host: host.into(),
            port,
            initial_data: Vec::new(),
            region: None,
            protocol,
        }
    }

    pub fn with_initial_data(mut self, data: Vec<u8>) -> Self {
        self.initial_data = data;
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn criteria(&self) -> SelectionCriteria {
        SelectionCriteria::new().with_optional_region(self.region.clone())
    }
}

/// Tunables for the connect and relay phases
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub connect_timeout: Duration,
    /// Sequential connect attempts, each on a fresh node
    pub attempts: usize,
    pub buffer_size: usize,
    pub competitive: bool,
    pub race_width: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(relay::CONNECT_TIMEOUT_MS),
            attempts: relay::CONNECT_ATTEMPTS,
            buffer_size: relay::BUFFER_SIZE,
            competitive: false,
            race_width: relaymesh_common::config::selection::RACE_WIDTH,
        }
    }
}

impl RelaySettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            attempts: config.connect_attempts.max(1),
            buffer_size: config.relay_buffer_size.max(1),
            competitive: config.competitive,
            race_width: config.race_width.max(1),
        }
    }
}

/// Stream registered on a node, waiting for its `connect_response`
pub(crate) struct PendingStream {
    pub node: Arc<ExitNode>,
    pub id: StreamId,
    pub target: String,
    pub protocol: IngressProtocol,
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub metrics: Arc<StreamMetrics>,
    pub response: oneshot::Receiver<ConnectOutcome>,
}

/// A logical stream the exit node accepted, ready to relay
pub struct EstablishedStream {
    node: Arc<ExitNode>,
    id: StreamId,
    target: String,
    protocol: IngressProtocol,
    inbound: mpsc::Receiver<Vec<u8>>,
    metrics: Arc<StreamMetrics>,
}

impl EstablishedStream {
    pub fn node(&self) -> &Arc<ExitNode> {
        &self.node
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl fmt::Debug for EstablishedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedStream")
            .field("node", self.node.id())
            .field("id", &self.id)
            .field("target", &self.target)
            .finish()
    }
}

/// Totals for one relayed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub close_reason: CloseReason,
}

pub struct RelayEngine {
    selector: Arc<Selector>,
    logger: Arc<dyn ConnectionLogger>,
    settings: RelaySettings,
}

impl RelayEngine {
    pub fn new(selector: Arc<Selector>, logger: Arc<dyn ConnectionLogger>, settings: RelaySettings) -> Self {
        Self {
            selector,
            logger,
            settings,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    /// Establish a logical stream for `request`, either by sequential retry
    /// on fresh nodes or by racing several nodes at once.
    pub async fn connect(&self, request: &ConnectRequest) -> Result<EstablishedStream> {
        if self.settings.competitive && self.settings.race_width > 1 {
            return CompetitiveConnector::new(self).race(request).await;
        }

        let mut criteria = request.criteria();
        let mut last_error = None;

        for attempt in 1..=self.settings.attempts {
            let node = match self.selector.select(&criteria).await {
                Ok(node) => node,
                Err(e) => return Err(last_error.unwrap_or_else(|| e.into())),
            };
            criteria = criteria.exclude(node.id().clone());

            let result = match self.open(&node, request).await {
                Ok(pending) => self.await_response(pending, self.settings.connect_timeout).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(established) => {
                    debug!(
                        "Stream {} to {} established on {} (attempt {})",
                        established.id,
                        established.target,
                        node.id(),
                        attempt
                    );
                    return Ok(established);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Connect to {} via {} failed (attempt {}/{}): {}",
                        request.target(),
                        node.id(),
                        attempt,
                        self.settings.attempts,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(RelayMeshError::NoExitNode))
    }

    /// Register the stream on `node` and send the `connect` envelope.
    ///
    /// The inbound queue and pending waiter exist before the envelope leaves,
    /// so a fast node cannot answer into nothing.
    pub(crate) async fn open(&self, node: &Arc<ExitNode>, request: &ConnectRequest) -> Result<PendingStream> {
        let id = StreamId::next();
        let target = request.target();
        let (stream, inbound) = LogicalStream::new(target.clone());
        let metrics = stream.metrics.clone();

        node.insert_stream(id, stream);
        let response = node.register_pending(id);

        let initial = (!request.initial_data.is_empty()).then_some(request.initial_data.as_slice());
        let message = TunnelMessage::connect(id, &request.host, request.port, initial);
        if let Err(e) = node.send(&message).await {
            node.cancel_pending(id);
            node.release_stream(id);
            return Err(e);
        }

        if let Some(initial) = initial {
            metrics.add_sent(initial.len());
            node.add_bytes_sent(initial.len());
        }

        Ok(PendingStream {
            node: node.clone(),
            id,
            target,
            protocol: request.protocol,
            inbound,
            metrics,
            response,
        })
    }

    /// Wait for the node's `connect_response`.
    ///
    /// Success rewards the node; an explicit failure or a timeout penalizes
    /// it and releases the stream.
    pub(crate) async fn await_response(&self, pending: PendingStream, timeout: Duration) -> Result<EstablishedStream> {
        let PendingStream {
            node,
            id,
            target,
            protocol,
            inbound,
            metrics,
            response,
        } = pending;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(Ok(()))) => {
                node.reward();
                Ok(EstablishedStream {
                    node,
                    id,
                    target,
                    protocol,
                    inbound,
                    metrics,
                })
            }
            Ok(Ok(Err(reason))) => {
                node.release_stream(id);
                node.penalize();
                Err(RelayMeshError::ConnectRejected {
                    node: node.id().to_string(),
                    reason,
                })
            }
            // The node was torn down while we waited
            Ok(Err(_)) => {
                node.release_stream(id);
                Err(RelayMeshError::NodeClosed(node.id().to_string()))
            }
            Err(_) => {
                self.abandon(&node, id).await;
                node.penalize();
                Err(RelayMeshError::ConnectTimeout {
                    node: node.id().to_string(),
                })
            }
        }
    }

    /// Give up on a stream that never became established
    pub(crate) async fn abandon(&self, node: &Arc<ExitNode>, id: StreamId) {
        node.cancel_pending(id);
        if node.release_stream(id).is_some() && node.is_selectable() {
            if let Err(e) = node.send(&TunnelMessage::close(id)).await {
                debug!("Close for abandoned stream {} on {} failed: {}", id, node.id(), e);
            }
        }
    }

    /// Drop an established stream that will never be relayed, e.g. because
    /// the user went away before the success reply reached them.
    pub async fn release(&self, established: EstablishedStream) {
        self.abandon(&established.node, established.id).await;
    }

    /// Pump bytes between the user connection and the logical stream until
    /// either side finishes, then close both ends and log the connection.
    pub async fn relay<S>(&self, established: EstablishedStream, user: S) -> RelaySummary
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let EstablishedStream {
            node,
            id,
            target,
            protocol,
            mut inbound,
            metrics,
        } = established;
        let (mut user_rd, mut user_wr) = tokio::io::split(user);

        let upstream = async {
            let mut buf = vec![0u8; self.settings.buffer_size];
            loop {
                let n = match user_rd.read(&mut buf).await {
                    Ok(0) => return CloseReason::Client,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Read from client on stream {} failed: {}", id, e);
                        return CloseReason::Client;
                    }
                };
                if node.send(&TunnelMessage::data(id, &buf[..n])).await.is_err() {
                    return CloseReason::Remote;
                }
                metrics.add_sent(n);
                node.add_bytes_sent(n);
            }
        };

        let downstream = async {
            while let Some(chunk) = inbound.recv().await {
                if let Err(e) = user_wr.write_all(&chunk).await {
                    debug!("Write to client on stream {} failed: {}", id, e);
                    return CloseReason::Client;
                }
                metrics.add_received(chunk.len());
                node.add_bytes_received(chunk.len());
            }
            CloseReason::Remote
        };

        let close_reason = tokio::select! {
            reason = upstream => reason,
            reason = downstream => reason,
        };

        let _ = user_wr.shutdown().await;
        if node.release_stream(id).is_some() && node.is_selectable() {
            if let Err(e) = node.send(&TunnelMessage::close(id)).await {
                debug!("Close for stream {} on {} failed: {}", id, node.id(), e);
            }
        }

        let summary = RelaySummary {
            bytes_sent: metrics.bytes_sent(),
            bytes_received: metrics.bytes_received(),
            close_reason,
        };
        self.logger.log_connection(&ConnectionMetrics::new(
            id,
            node.id().to_string(),
            protocol.as_str(),
            target,
            metrics.started_at(),
            metrics.elapsed(),
            summary.bytes_sent,
            summary.bytes_received,
            close_reason,
        ));
        summary
    }

    /// Connect and relay in one go. Returns the error if no stream could be
    /// established; the caller still owns replying to the user in that case.
    pub async fn serve<S>(&self, request: &ConnectRequest, user: S) -> Result<RelaySummary>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let established = self.connect(request).await?;
        info!(
            "{} stream {} to {} via {}",
            request.protocol,
            established.id,
            established.target,
            established.node.id()
        );
        Ok(self.relay(established, user).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::{memory_node, RemoteEnd};
    use crate::network::{MessageDispatcher, Registry};
    use crate::protocol::MessageType;
    use crate::telemetry::recording::RecordingLogger;
    use relaymesh_common::SelectionStrategy;

    /// How a scripted exit node answers connects
    #[derive(Clone, Copy)]
    enum Script {
        /// Accept and echo every data frame
        Echo,
        /// Accept, push three 1000-byte frames, then close
        Push,
        /// Never answer
        Silent,
        /// Reject every connect
        Refuse,
        /// Accept, then close straight away
        Hangup,
    }

    fn spawn_exit(mut remote: RemoteEnd, script: Script) -> tokio::task::JoinHandle<Vec<TunnelMessage>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Ok(Some(message)) = remote.reader.next_message().await {
                seen.push(message.clone());
                let Some(id) = message.stream_id() else {
                    if message.kind == MessageType::Ping {
                        let _ = remote.writer.send_message(&TunnelMessage::pong()).await;
                    }
                    continue;
                };
                let replies = match (message.kind, script) {
                    (MessageType::Connect, Script::Echo) => vec![TunnelMessage::connect_success(id)],
                    (MessageType::Connect, Script::Push) => {
                        let frame = vec![7u8; 1000];
                        vec![
                            TunnelMessage::connect_success(id),
                            TunnelMessage::data(id, &frame),
                            TunnelMessage::data(id, &frame),
                            TunnelMessage::data(id, &frame),
                            TunnelMessage::close(id),
                        ]
                    }
                    (MessageType::Connect, Script::Hangup) => {
                        vec![TunnelMessage::connect_success(id), TunnelMessage::close(id)]
                    }
                    (MessageType::Connect, Script::Refuse) => {
                        vec![TunnelMessage::connect_failure(id, "connection refused")]
                    }
                    (MessageType::Data, Script::Echo) => {
                        vec![TunnelMessage::data(id, &message.payload().unwrap())]
                    }
                    _ => Vec::new(),
                };
                for reply in replies {
                    if remote.writer.send_message(&reply).await.is_err() {
                        return seen;
                    }
                }
            }
            seen
        })
    }

    struct Mesh {
        registry: Arc<Registry>,
        engine: RelayEngine,
        logger: RecordingLogger,
        nodes: Vec<Arc<ExitNode>>,
        exits: Vec<tokio::task::JoinHandle<Vec<TunnelMessage>>>,
    }

    async fn mesh(nodes: &[(&str, &str, Script)], settings: RelaySettings) -> Mesh {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();
        let mut exits = Vec::new();
        for (id, region, script) in nodes {
            let (node, tunnel, remote) = memory_node(id, region);
            registry.register(node.clone()).await.unwrap();
            tokio::spawn(MessageDispatcher::new(registry.clone(), node.clone()).run(tunnel));
            exits.push(spawn_exit(remote, *script));
            handles.push(node);
        }

        let logger = RecordingLogger::default();
        let selector = Arc::new(Selector::new(registry.clone(), SelectionStrategy::Weighted, 1.0));
        let engine = RelayEngine::new(selector, Arc::new(logger.clone()), settings);
        Mesh {
            registry,
            engine,
            logger,
            nodes: handles,
            exits,
        }
    }

    fn quick() -> RelaySettings {
        RelaySettings {
            connect_timeout: Duration::from_millis(200),
            attempts: 2,
            ..RelaySettings::default()
        }
    }

    #[tokio::test]
    async fn pushed_frames_reach_client_then_eof() {
        let mesh = mesh(&[("10.7.0.1:1", "global", Script::Push)], quick()).await;
        let request = ConnectRequest::new("example.com", 80, IngressProtocol::Http);
        let established = mesh.engine.connect(&request).await.unwrap();

        let (mut client, server_side) = tokio::io::duplex(64 * 1024);
        let relay = mesh.engine.relay(established, server_side);
        let read = async {
            let mut received = Vec::new();
            client.read_to_end(&mut received).await.unwrap();
            received
        };
        let (summary, received) = tokio::join!(relay, read);

        assert_eq!(received, vec![7u8; 3000]);
        assert_eq!(summary.bytes_received, 3000);
        assert_eq!(summary.close_reason, CloseReason::Remote);
        assert_eq!(mesh.nodes[0].active_conns(), 0);

        let records = mesh.logger.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes_received, 3000);
        assert_eq!(records[0].target, "example.com:80");
        assert_eq!(records[0].protocol, "http");
    }

    #[tokio::test]
    async fn multi_chunk_echo_is_byte_exact() {
        let mesh = mesh(&[("10.7.1.1:1", "global", Script::Echo)], quick()).await;
        let request = ConnectRequest::new("echo.test", 7, IngressProtocol::Socks5)
            .with_initial_data(b"hello ".to_vec());
        let established = mesh.engine.connect(&request).await.unwrap();
        let stream_id = established.id();

        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn({
            let engine = mesh.engine;
            async move { engine.relay(established, server_side).await }
        });

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let (mut rd, mut wr) = tokio::io::split(client);
        for chunk in payload.chunks(3000) {
            wr.write_all(chunk).await.unwrap();
        }
        let mut echoed = vec![0u8; payload.len()];
        rd.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        wr.shutdown().await.unwrap();
        let summary = relay.await.unwrap();
        assert_eq!(summary.close_reason, CloseReason::Client);
        assert_eq!(summary.bytes_sent, payload.len() as u64 + 6);
        assert_eq!(summary.bytes_received, payload.len() as u64);
        assert_eq!(mesh.nodes[0].active_conns(), 0);

        // The exit saw the initial bytes on the connect and our close
        mesh.nodes[0].close_transport();
        let seen = mesh.exits.into_iter().next().unwrap().await.unwrap();
        let connect = seen.iter().find(|m| m.kind == MessageType::Connect).unwrap();
        assert_eq!(connect.payload().unwrap(), b"hello ");
        let closes = seen
            .iter()
            .filter(|m| m.kind == MessageType::Close && m.stream_id() == Some(stream_id))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn remote_close_racing_client_eof_closes_once() {
        let mesh = mesh(&[("10.7.6.1:1", "global", Script::Hangup)], quick()).await;
        let engine = Arc::new(mesh.engine);
        let mut ids = Vec::new();

        for _ in 0..20 {
            let established = engine
                .connect(&ConnectRequest::new("example.com", 443, IngressProtocol::Socks5))
                .await
                .unwrap();
            ids.push(established.id());

            let (client, server_side) = tokio::io::duplex(1024);
            let relay = tokio::spawn({
                let engine = engine.clone();
                async move { engine.relay(established, server_side).await }
            });
            let (_rd, mut wr) = tokio::io::split(client);
            wr.shutdown().await.unwrap();

            relay.await.unwrap();
            assert_eq!(mesh.nodes[0].active_conns(), 0);
        }
        assert_eq!(mesh.logger.records().len(), ids.len());

        mesh.nodes[0].close_transport();
        let seen = mesh.exits.into_iter().next().unwrap().await.unwrap();
        for id in ids {
            let closes = seen
                .iter()
                .filter(|m| m.kind == MessageType::Close && m.stream_id() == Some(id))
                .count();
            assert!(closes <= 1, "stream {} closed {} times", id, closes);
        }
    }

    #[tokio::test]
    async fn remote_close_mid_write_leaves_tunnel_decodable() {
        // A tiny pipe nobody drains, so the data frame blocks halfway out
        let (server_io, exit_io) = tokio::io::duplex(256);
        let (_server_reader, tunnel_writer) = crate::transport::split_tunnel(server_io);
        let (mut exit_reader, _exit_writer) = crate::transport::split_tunnel(exit_io);
        let node = Arc::new(ExitNode::new(
            relaymesh_common::NodeId::new("10.7.7.1:1").unwrap(),
            "global",
            crate::transport::TransportKind::Memory,
            tunnel_writer,
        ));

        let id = StreamId::next();
        let (stream, inbound) = LogicalStream::new("example.com:443");
        let metrics = stream.metrics.clone();
        node.insert_stream(id, stream);
        let established = EstablishedStream {
            node: node.clone(),
            id,
            target: "example.com:443".to_string(),
            protocol: IngressProtocol::Socks5,
            inbound,
            metrics,
        };

        let engine = mesh(&[], quick()).await.engine;
        let (mut client, server_side) = tokio::io::duplex(64 * 1024);
        client.write_all(&[5u8; 4096]).await.unwrap();
        let relay = tokio::spawn(async move { engine.relay(established, server_side).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        // The exit closes the stream while its data frame is still going out
        assert!(node.release_stream(id).is_some());
        let summary = relay.await.unwrap();
        assert_eq!(summary.close_reason, CloseReason::Remote);

        let sibling = tokio::spawn({
            let node = node.clone();
            async move { node.send(&TunnelMessage::ping()).await }
        });

        let data = exit_reader.next_message().await.unwrap().unwrap();
        assert_eq!(data.kind, MessageType::Data);
        assert_eq!(data.stream_id(), Some(id));
        assert_eq!(data.payload().unwrap(), vec![5u8; 4096]);
        let ping = exit_reader.next_message().await.unwrap().unwrap();
        assert_eq!(ping.kind, MessageType::Ping);
        sibling.await.unwrap().unwrap();
        assert!(node.is_selectable());
    }

    #[tokio::test]
    async fn timeout_moves_on_to_another_node() {
        let mesh = mesh(
            &[("10.7.2.1:1", "DE", Script::Silent), ("10.7.2.2:1", "global", Script::Echo)],
            quick(),
        )
        .await;
        let request = ConnectRequest::new("example.com", 443, IngressProtocol::Socks5)
            .with_region(Some("DE".to_string()));

        let established = mesh.engine.connect(&request).await.unwrap();
        assert!(Arc::ptr_eq(established.node(), &mesh.nodes[1]));

        let silent = &mesh.nodes[0];
        assert!(silent.reliability() < relaymesh_common::config::scoring::INITIAL_RELIABILITY);
        assert_eq!(silent.active_conns(), 0);
        assert_eq!(silent.pending_count(), 0);
        assert!(
            mesh.nodes[1].reliability() > relaymesh_common::config::scoring::INITIAL_RELIABILITY
        );
    }

    #[tokio::test]
    async fn rejection_penalizes_and_reports_after_all_attempts() {
        let mesh = mesh(
            &[("10.7.3.1:1", "global", Script::Refuse), ("10.7.3.2:1", "global", Script::Refuse)],
            quick(),
        )
        .await;
        let request = ConnectRequest::new("example.com", 443, IngressProtocol::Socks5);

        let err = mesh.engine.connect(&request).await.unwrap_err();
        assert!(matches!(err, RelayMeshError::ConnectRejected { .. }));
        for node in &mesh.nodes {
            assert!(node.reliability() < relaymesh_common::config::scoring::INITIAL_RELIABILITY);
            assert_eq!(node.active_conns(), 0);
        }
    }

    #[tokio::test]
    async fn no_nodes_means_no_exit_node() {
        let mesh = mesh(&[], quick()).await;
        let err = mesh
            .engine
            .connect(&ConnectRequest::new("example.com", 443, IngressProtocol::Http))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayMeshError::NoExitNode));
        assert!(mesh.registry.is_empty().await);
    }

    #[tokio::test]
    async fn node_teardown_ends_relay() {
        let mesh = mesh(&[("10.7.4.1:1", "global", Script::Echo)], quick()).await;
        let established = mesh
            .engine
            .connect(&ConnectRequest::new("example.com", 443, IngressProtocol::Socks5))
            .await
            .unwrap();

        let (mut client, server_side) = tokio::io::duplex(1024);
        let node = mesh.nodes[0].clone();
        let registry = mesh.registry.clone();
        let relay = tokio::spawn(async move { mesh.engine.relay(established, server_side).await });

        registry.kick(&node, "test").await;
        let summary = relay.await.unwrap();
        assert_eq!(summary.close_reason, CloseReason::Remote);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn released_stream_sends_close() {
        let mesh = mesh(&[("10.7.5.1:1", "global", Script::Echo)], quick()).await;
        let established = mesh
            .engine
            .connect(&ConnectRequest::new("example.com", 443, IngressProtocol::Socks5))
            .await
            .unwrap();
        let id = established.id();
        assert_eq!(mesh.nodes[0].active_conns(), 1);

        mesh.engine.release(established).await;
        assert_eq!(mesh.nodes[0].active_conns(), 0);

        mesh.nodes[0].close_transport();
        let seen = mesh.exits.into_iter().next().unwrap().await.unwrap();
        assert!(seen
            .iter()
            .any(|m| m.kind == MessageType::Close && m.stream_id() == Some(id)));
        assert!(mesh.logger.records().is_empty());
    }

    #[test]
    fn ipv6_targets_are_bracketed() {
        let request = ConnectRequest::new("2001:db8::1", 443, IngressProtocol::Socks5);
        assert_eq!(request.target(), "[2001:db8::1]:443");
        assert_eq!(
            ConnectRequest::new("example.com", 80, IngressProtocol::Http).target(),
            "example.com:80"
        );
    }
}
