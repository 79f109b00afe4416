/// Writer task for a tunnel's write half
///
/// Every envelope is handed to a dedicated task that owns the writer, so a
/// frame that has been queued is always written in full. A caller that stops
/// waiting (a relay pump dropped by `select!`, a lost race) can no longer
/// leave half a line on a tunnel shared with other streams.

use super::tunnel::BoxedTunnelWriter;
use crate::protocol::{CodecError, TunnelMessage};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Envelopes waiting for the writer task
const SINK_QUEUE: usize = 64;

enum SinkCommand {
    Send {
        message: TunnelMessage,
        reply: oneshot::Sender<Result<(), CodecError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a tunnel writer task
#[derive(Clone)]
pub struct TunnelSink {
    commands: mpsc::Sender<SinkCommand>,
}

impl TunnelSink {
    /// Move `writer` into its own task. Must be called inside a runtime.
    pub fn spawn(writer: BoxedTunnelWriter) -> Self {
        let (commands, rx) = mpsc::channel(SINK_QUEUE);
        tokio::spawn(run_writer(writer, rx));
        Self { commands }
    }

    /// Queue one envelope and wait until it has been written.
    ///
    /// If this future is dropped before the envelope is queued nothing is
    /// written; once queued, the whole frame is written regardless.
    pub async fn send(&self, message: &TunnelMessage) -> Result<(), CodecError> {
        let (reply, written) = oneshot::channel();
        self.commands
            .send(SinkCommand::Send {
                message: message.clone(),
                reply,
            })
            .await
            .map_err(|_| writer_gone())?;
        written.await.map_err(|_| writer_gone())?
    }

    /// Flush queued envelopes, close the write direction and stop the task
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(SinkCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

fn writer_gone() -> CodecError {
    CodecError::Transport("tunnel writer closed".to_string())
}

async fn run_writer(mut writer: BoxedTunnelWriter, mut commands: mpsc::Receiver<SinkCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            SinkCommand::Send { message, reply } => {
                let result = writer.send_message(&message).await;
                let failed = result.is_err();
                if reply.send(result).is_err() {
                    trace!("{} envelope written after its sender went away", message.kind);
                }
                if failed {
                    debug!("Tunnel write failed, writer task stopping");
                    break;
                }
            }
            SinkCommand::Shutdown { reply } => {
                writer.shutdown().await;
                let _ = reply.send(());
                return;
            }
        }
    }
    writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use crate::transport::split_tunnel;
    use relaymesh_common::StreamId;
    use std::time::Duration;

    #[tokio::test]
    async fn abandoned_send_still_writes_whole_frame() {
        // Far smaller than one frame, and nobody reads until later
        let (near, far) = tokio::io::duplex(256);
        let (_near_reader, near_writer) = split_tunnel(near);
        let (mut far_reader, _far_writer) = split_tunnel(far);
        let sink = TunnelSink::spawn(near_writer);

        let id = StreamId::from_raw(9);
        let payload = vec![3u8; 4096];
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            sink.send(&TunnelMessage::data(id, &payload)),
        )
        .await;
        assert!(abandoned.is_err(), "send should still be blocked on the full pipe");

        let ping = tokio::spawn({
            let sink = sink.clone();
            async move { sink.send(&TunnelMessage::ping()).await }
        });

        let first = far_reader.next_message().await.unwrap().unwrap();
        assert_eq!(first.kind, MessageType::Data);
        assert_eq!(first.payload().unwrap(), payload);
        let second = far_reader.next_message().await.unwrap().unwrap();
        assert_eq!(second.kind, MessageType::Ping);
        ping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes_then_closes() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (_near_reader, near_writer) = split_tunnel(near);
        let (mut far_reader, _far_writer) = split_tunnel(far);
        let sink = TunnelSink::spawn(near_writer);

        sink.send(&TunnelMessage::pong()).await.unwrap();
        sink.shutdown().await;

        assert_eq!(far_reader.next_message().await.unwrap(), Some(TunnelMessage::pong()));
        assert_eq!(far_reader.next_message().await.unwrap(), None);
        assert!(sink.send(&TunnelMessage::ping()).await.is_err());
    }
}
