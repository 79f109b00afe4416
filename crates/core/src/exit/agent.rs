/// Exit-node agent
///
/// The far end of a tunnel: dials the relay server, answers pings, and for
/// every `connect` opens a TCP connection to the requested target and relays
/// it over the tunnel using the same envelope codec as the server.

use crate::protocol::{MessageType, TunnelMessage};
use crate::transport::{quic_tunnel, BoxedTunnelReader, BoxedTunnelWriter, Endpoint, TunnelSink};
use relaymesh_common::config::relay;
use relaymesh_common::{RelayMeshError, Result, StreamId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type StreamTable = Arc<Mutex<HashMap<StreamId, mpsc::Sender<Vec<u8>>>>>;

#[derive(Debug, Clone)]
pub struct ExitAgent {
    reward_address: Option<String>,
    dial_timeout: Duration,
    buffer_size: usize,
}

impl Default for ExitAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitAgent {
    pub fn new() -> Self {
        Self {
            reward_address: None,
            dial_timeout: Duration::from_secs(relay::DIAL_TIMEOUT_SECS),
            buffer_size: relay::BUFFER_SIZE,
        }
    }

    pub fn with_reward_address(mut self, address: Option<String>) -> Self {
        self.reward_address = address;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Dial the relay server over QUIC and serve the tunnel until it closes
    pub async fn connect_quic(&self, server: SocketAddr) -> Result<()> {
        let bind: SocketAddr = if server.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0, 0, 0, 0], 0))
        };
        let endpoint = Endpoint::client(bind)
            .await
            .map_err(|e| RelayMeshError::transport(e.to_string()))?;

        info!("Connecting to relay server {}", server);
        let connection = endpoint
            .connect(server)
            .await
            .map_err(|e| RelayMeshError::transport(e.to_string()))?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| RelayMeshError::transport(e.to_string()))?;

        let (reader, writer) = quic_tunnel(send, recv);
        let result = self.run(reader, writer).await;

        connection.close(0, "bye");
        endpoint.close();
        result
    }

    /// Serve one tunnel. Returns once the server closes it.
    pub async fn run(&self, mut reader: BoxedTunnelReader, writer: BoxedTunnelWriter) -> Result<()> {
        let writer = TunnelSink::spawn(writer);
        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));

        // The server only sees the tunnel once something has been written
        send(&writer, &TunnelMessage::ping()).await?;
        if let Some(address) = &self.reward_address {
            send(&writer, &TunnelMessage::address(address.clone())).await?;
        }
        info!("Tunnel to relay server established");

        loop {
            let message = match reader.next_message().await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    warn!("Relay server sent an undecodable envelope: {}", e);
                    break;
                }
            };

            match message.kind {
                MessageType::Connect => self.handle_connect(message, &writer, &streams),
                MessageType::Data => {
                    let Some(id) = message.stream_id() else { continue };
                    let sender = table(&streams).get(&id).cloned();
                    match (sender, message.payload()) {
                        (Some(sender), Ok(payload)) if !payload.is_empty() => {
                            let _ = sender.send(payload).await;
                        }
                        (_, Err(e)) => warn!("Dropping bad payload for stream {}: {}", id, e),
                        _ => {}
                    }
                }
                MessageType::Close => {
                    if let Some(id) = message.stream_id() {
                        table(&streams).remove(&id);
                    }
                }
                MessageType::Ping => send(&writer, &TunnelMessage::pong()).await?,
                _ => {}
            }
        }

        let open = {
            let mut streams = table(&streams);
            let open = streams.len();
            streams.clear();
            open
        };
        info!("Tunnel closed, dropped {} open streams", open);
        writer.shutdown().await;
        Ok(())
    }

    fn handle_connect(&self, message: TunnelMessage, writer: &TunnelSink, streams: &StreamTable) {
        let Some(id) = message.stream_id() else {
            debug!("connect without a stream id");
            return;
        };
        let initial = message.payload().unwrap_or_default();
        let target = message.target();

        let writer = writer.clone();
        let streams = streams.clone();
        let dial_timeout = self.dial_timeout;
        let buffer_size = self.buffer_size;

        tokio::spawn(async move {
            let Some((host, port)) = target else {
                let _ = send(&writer, &TunnelMessage::connect_failure(id, "missing target")).await;
                return;
            };

            let tcp = match dial(&host, port, dial_timeout, &initial).await {
                Ok(tcp) => tcp,
                Err(e) => {
                    debug!("Dial {}:{} for stream {} failed: {}", host, port, id, e);
                    let _ = send(&writer, &TunnelMessage::connect_failure(id, e.to_string())).await;
                    return;
                }
            };

            // The queue must exist before the server can send data for it
            let (tx, rx) = mpsc::channel(relay::INBOUND_QUEUE_CAPACITY);
            table(&streams).insert(id, tx);
            if send(&writer, &TunnelMessage::connect_success(id)).await.is_err() {
                table(&streams).remove(&id);
                return;
            }

            relay_stream(id, tcp, rx, &writer, buffer_size).await;

            if table(&streams).remove(&id).is_some() {
                let _ = send(&writer, &TunnelMessage::close(id)).await;
            }
        });
    }
}

async fn dial(host: &str, port: u16, timeout: Duration, initial: &[u8]) -> std::io::Result<TcpStream> {
    let mut tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"))??;
    if !initial.is_empty() {
        tcp.write_all(initial).await?;
    }
    Ok(tcp)
}

async fn relay_stream(
    id: StreamId,
    tcp: TcpStream,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    writer: &TunnelSink,
    buffer_size: usize,
) {
    let (mut rd, mut wr) = tcp.into_split();

    let upstream = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            match rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if send(writer, &TunnelMessage::data(id, &buf[..n])).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    let downstream = async {
        while let Some(chunk) = inbound.recv().await {
            if wr.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    };

    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }
}

async fn send(writer: &TunnelSink, message: &TunnelMessage) -> Result<()> {
    writer
        .send(message)
        .await
        .map_err(|e| RelayMeshError::transport(e.to_string()))
}

fn table(
    streams: &StreamTable,
) -> std::sync::MutexGuard<'_, HashMap<StreamId, mpsc::Sender<Vec<u8>>>> {
    streams.lock().unwrap_or_else(PoisonError::into_inner)
}
