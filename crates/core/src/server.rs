/// Relay server runtime
///
/// Wires the registry, selection engine, relay engine and background tasks
/// together and accepts exit-node tunnels:
/// - QUIC tunnels on `quic_listen`, one bidirectional stream per node
/// - any other framed tunnel (the daemon's WebSocket endpoint) through
///   [`RelayServer::attach_tunnel`]

use crate::network::{
    ExitNode, MessageDispatcher, PingMonitor, RegionResolver, Registry, StaticRegionResolver,
};
use crate::relay::{RelayEngine, RelaySettings};
use crate::selection::Selector;
use crate::telemetry::{ConnectionLogger, JsonLinesConnectionLogger, TracingConnectionLogger};
use crate::transport::{
    quic_tunnel, BoxedTunnelReader, BoxedTunnelWriter, Connection, Endpoint, EndpointConfig,
    TransportKind,
};
use relaymesh_common::config::protocol;
use relaymesh_common::{NodeId, RelayMeshError, Result, SelectionStrategy, ServerConfig};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// QUIC close codes
const CLOSE_NORMAL: u32 = 0;
const CLOSE_DUPLICATE: u32 = 1;
const CLOSE_PROTOCOL: u32 = 2;

/// Time an accepted connection gets to open its tunnel stream
const TUNNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    selector: Arc<Selector>,
    engine: Arc<RelayEngine>,
    resolver: Arc<dyn RegionResolver>,
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| RelayMeshError::Config(e.to_string()))?;

        let logger: Arc<dyn ConnectionLogger> = match &config.connection_log {
            Some(path) => {
                info!("Logging connections to {}", path.display());
                Arc::new(JsonLinesConnectionLogger::open(path)?)
            }
            None => Arc::new(TracingConnectionLogger),
        };

        let registry = Arc::new(Registry::new());
        let selector = Arc::new(Selector::from_config(registry.clone(), &config));
        let engine = Arc::new(RelayEngine::new(
            selector.clone(),
            logger,
            RelaySettings::from_config(&config),
        ));
        let resolver = Arc::new(StaticRegionResolver::from_config(&config.regions));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            selector,
            engine,
            resolver,
            endpoint: Mutex::new(None),
            shutdown,
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn RegionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    /// Start background tasks and the QUIC listener. Returns the bound
    /// tunnel address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        info!("Starting relay server...");
        self.spawn_background_tasks();

        let endpoint = Endpoint::new(EndpointConfig::with_bind_addr(self.config.quic_listen))
            .await
            .map_err(|e| RelayMeshError::transport(e.to_string()))?;
        let endpoint = Arc::new(endpoint);
        let local_addr = endpoint.local_addr();
        *self.endpoint.lock().unwrap_or_else(PoisonError::into_inner) = Some(endpoint.clone());

        tokio::spawn(self.clone().accept_quic(endpoint));

        info!("Accepting exit-node tunnels on {}", local_addr);
        Ok(local_addr)
    }

    /// Ping monitor, plus the pool refresh task for pooled selection
    pub fn spawn_background_tasks(&self) {
        let monitor = PingMonitor::new(self.registry.clone(), self.config.ping_interval());
        tokio::spawn(monitor.run(self.shutdown.subscribe()));

        if self.selector.strategy() == SelectionStrategy::Pooled {
            tokio::spawn(
                self.selector
                    .clone()
                    .run_refresh(self.config.pool_refresh_interval(), self.shutdown.subscribe()),
            );
        }
    }

    /// Accept QUIC connections until shutdown
    pub async fn accept_quic(self: Arc<Self>, endpoint: Arc<Endpoint>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let connection = tokio::select! {
                accepted = endpoint.accept() => accepted,
                _ = shutdown.changed() => break,
            };

            match connection {
                Ok(connection) => {
                    tokio::spawn(self.clone().handle_quic(connection));
                }
                Err(crate::transport::EndpointError::Closed) => break,
                Err(e) => {
                    debug!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        info!("QUIC accept loop stopped");
    }

    async fn handle_quic(self: Arc<Self>, connection: Connection) {
        let remote = connection.remote_addr();
        if connection.alpn().as_deref() != Some(protocol::ALPN) {
            warn!("Rejecting {}: unexpected ALPN", remote);
            connection.close(CLOSE_PROTOCOL, "alpn");
            return;
        }

        let id = NodeId::from_addr(remote);
        if self.registry.contains(&id).await {
            warn!("Rejecting duplicate tunnel from {}", id);
            connection.close(CLOSE_DUPLICATE, "duplicate");
            return;
        }

        let (send, recv) = match tokio::time::timeout(TUNNEL_OPEN_TIMEOUT, connection.accept_bi()).await {
            Ok(Ok(streams)) => streams,
            Ok(Err(e)) => {
                debug!("{} closed before opening a tunnel: {}", remote, e);
                return;
            }
            Err(_) => {
                warn!("{} never opened a tunnel stream", remote);
                connection.close(CLOSE_PROTOCOL, "no tunnel");
                return;
            }
        };

        let (reader, writer) = quic_tunnel(send, recv);
        match self
            .attach_tunnel(id, remote.ip(), TransportKind::Quic, reader, writer)
            .await
        {
            Ok(dispatcher) => {
                let _ = dispatcher.await;
                connection.close(CLOSE_NORMAL, "closed");
            }
            Err(RelayMeshError::DuplicateNode(id)) => {
                warn!("Rejecting duplicate tunnel from {}", id);
                connection.close(CLOSE_DUPLICATE, "duplicate");
            }
            Err(e) => {
                warn!("Failed to attach tunnel from {}: {}", remote, e);
                connection.close(CLOSE_PROTOCOL, "error");
            }
        }
    }

    /// Register a framed tunnel as an exit node and start its reader loop.
    ///
    /// The returned handle completes once the node has been torn down.
    pub async fn attach_tunnel(
        &self,
        id: NodeId,
        ip: IpAddr,
        transport: TransportKind,
        reader: BoxedTunnelReader,
        writer: BoxedTunnelWriter,
    ) -> Result<JoinHandle<()>> {
        // Region lookup happens once, here
        let region = self.resolver.resolve(ip);
        let node = Arc::new(ExitNode::new(id, region, transport, writer));
        self.registry.register(node.clone()).await?;

        let dispatcher = MessageDispatcher::new(self.registry.clone(), node.clone());
        let handle = tokio::spawn(dispatcher.run(reader));

        // First latency sample as soon as possible
        if let Err(e) = node.send_ping().await {
            debug!("Initial ping to {} failed: {}", node.id(), e);
        }
        Ok(handle)
    }

    /// Stop accepting tunnels, stop background tasks and drop every node
    pub async fn shutdown(&self) {
        info!("Stopping relay server...");
        self.shutdown.send_replace(true);

        let endpoint = self.endpoint.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(endpoint) = endpoint {
            endpoint.close();
        }

        for node in self.registry.snapshot().await {
            self.registry.teardown(&node, "server shutdown").await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::ExitAgent;
    use crate::network::GlobalRegion;
    use crate::protocol::{MessageType, TunnelMessage};
    use crate::relay::{ConnectRequest, IngressProtocol};
    use crate::transport::split_tunnel;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config() -> ServerConfig {
        ServerConfig {
            quic_listen: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        }
    }

    async fn wait_for_nodes(server: &RelayServer, count: usize) {
        for _ in 0..200 {
            if server.registry().len().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached {} nodes", count);
    }

    #[tokio::test]
    async fn attached_tunnel_is_pinged_and_torn_down_on_eof() {
        let server = RelayServer::new(test_config()).unwrap().with_resolver(Arc::new(GlobalRegion));
        let (server_io, exit_io) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = split_tunnel(server_io);
        let (mut exit_reader, exit_writer) = split_tunnel(exit_io);

        let id = NodeId::new("203.0.113.9:7000").unwrap();
        let handle = server
            .attach_tunnel(id.clone(), "203.0.113.9".parse().unwrap(), TransportKind::Memory, reader, writer)
            .await
            .unwrap();
        assert!(server.registry().contains(&id).await);

        let ping = exit_reader.next_message().await.unwrap().unwrap();
        assert_eq!(ping.kind, MessageType::Ping);

        drop(exit_writer);
        drop(exit_reader);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_attach_is_rejected() {
        let server = RelayServer::new(test_config()).unwrap();
        let id = NodeId::new("203.0.113.10:7000").unwrap();
        let ip: IpAddr = "203.0.113.10".parse().unwrap();

        let (first, _first_peer) = tokio::io::duplex(1024);
        let (reader, writer) = split_tunnel(first);
        server
            .attach_tunnel(id.clone(), ip, TransportKind::Memory, reader, writer)
            .await
            .unwrap();

        let (second, _second_peer) = tokio::io::duplex(1024);
        let (reader, writer) = split_tunnel(second);
        let err = server
            .attach_tunnel(id, ip, TransportKind::Memory, reader, writer)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayMeshError::DuplicateNode(_)));
        assert_eq!(server.registry().len().await, 1);
    }

    #[tokio::test]
    async fn region_is_resolved_at_attach() {
        let mut config = test_config();
        config.regions.insert("198.51.100.4".to_string(), "fr".to_string());
        let server = RelayServer::new(config).unwrap();

        let (io, _peer) = tokio::io::duplex(1024);
        let (reader, writer) = split_tunnel(io);
        let id = NodeId::new("198.51.100.4:9000").unwrap();
        server
            .attach_tunnel(id.clone(), "198.51.100.4".parse().unwrap(), TransportKind::Memory, reader, writer)
            .await
            .unwrap();

        assert_eq!(server.registry().get(&id).await.unwrap().region(), "FR");
    }

    #[tokio::test]
    async fn end_to_end_over_quic() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = socket.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });

        let server = Arc::new(RelayServer::new(test_config()).unwrap());
        let tunnel_addr = server.start().await.unwrap();

        let agent = ExitAgent::new().with_reward_address(Some("wallet-e2e".to_string()));
        tokio::spawn(async move { agent.connect_quic(tunnel_addr).await });
        wait_for_nodes(&server, 1).await;

        let request = ConnectRequest::new("127.0.0.1", echo_addr.port(), IngressProtocol::Socks5);
        let (mut client, user_side) = tokio::io::duplex(64 * 1024);
        let engine = server.engine().clone();
        let relay = tokio::spawn(async move { engine.serve(&request, user_side).await });

        client.write_all(b"ping over the mesh").await.unwrap();
        let mut echoed = vec![0u8; b"ping over the mesh".len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping over the mesh");

        client.shutdown().await.unwrap();
        let summary = relay.await.unwrap().unwrap();
        assert_eq!(summary.bytes_received, echoed.len() as u64);

        let node = server.registry().snapshot().await.pop().unwrap();
        assert_eq!(node.transport(), TransportKind::Quic);
        assert_eq!(node.reward_address().as_deref(), Some("wallet-e2e"));

        server.shutdown().await;
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn quic_tunnel_is_keyed_by_remote_address() {
        let server = Arc::new(RelayServer::new(test_config()).unwrap());
        let tunnel_addr = server.start().await.unwrap();

        let endpoint = Endpoint::client("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let connection = endpoint.connect(tunnel_addr).await.unwrap();
        let (send, recv) = connection.open_bi().await.unwrap();
        let (_reader, mut writer) = quic_tunnel(send, recv);
        writer.send_message(&TunnelMessage::ping()).await.unwrap();
        wait_for_nodes(&server, 1).await;

        let id = NodeId::from_addr(endpoint.local_addr());
        assert!(server.registry().contains(&id).await);
        server.shutdown().await;
    }
}
