//! WebSocket rendezvous client.
//!
//! Control frames: `{"type":"join","room":..}`, `{"type":"leave","room":..}`
//! and `{"type":"heartbeat","timestamp":..}`. Every other text frame from
//! the server is expected to be a signal envelope; frames that do not parse
//! are dropped.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use pd_core::ids::DeviceId;
use pd_core::network::SignalEnvelope;
use pd_core::ports::SignalingPort;

const INBOX_CAPACITY: usize = 100;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlFrame<'a> {
    Join { room: &'a DeviceId },
    Leave { room: &'a DeviceId },
    Heartbeat { timestamp: i64 },
}

struct Connection {
    room: DeviceId,
    writer: mpsc::UnboundedSender<Message>,
    writer_task: AbortHandle,
    reader_task: AbortHandle,
}

pub struct WebSocketSignaling {
    url: Url,
    connection: Mutex<Option<Connection>>,
}

impl WebSocketSignaling {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            connection: Mutex::new(None),
        }
    }

    pub fn parse(url: &str) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid signaling url: {url}"))?;
        Ok(Self::new(url))
    }

    async fn write(&self, message: Message) -> Result<()> {
        let connection = self.connection.lock().await;
        let connection = connection
            .as_ref()
            .ok_or_else(|| anyhow!("signaling channel is not joined"))?;
        connection
            .writer
            .send(message)
            .map_err(|_| anyhow!("signaling connection closed"))
    }
}

fn text_frame<T: Serialize>(value: &T) -> Result<Message> {
    let text = serde_json::to_string(value)?;
    Ok(Message::Text(text.into()))
}

#[async_trait]
impl SignalingPort for WebSocketSignaling {
    async fn join(&self, room: &DeviceId) -> Result<mpsc::Receiver<SignalEnvelope>> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect to {}", self.url))?;
        let (mut sink, mut stream) = ws.split();

        let (writer, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        let writer_task = tokio::spawn(async move {
            while let Some(message) = writer_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "signaling write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        })
        .abort_handle();

        let pong_writer = writer.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "signaling read failed");
                        break;
                    }
                };
                match message {
                    Message::Text(text) => match SignalEnvelope::from_json(&text) {
                        Ok(envelope) => {
                            if inbox_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(error = %e, "ignoring non-envelope frame"),
                    },
                    Message::Ping(bytes) => {
                        let _ = pong_writer.send(Message::Pong(bytes));
                    }
                    Message::Close(_) => {
                        info!("signaling server closed the connection");
                        break;
                    }
                    _ => {}
                }
            }
        })
        .abort_handle();

        writer
            .send(text_frame(&ControlFrame::Join { room })?)
            .map_err(|_| anyhow!("signaling connection closed"))?;

        let previous = self.connection.lock().await.replace(Connection {
            room: room.clone(),
            writer,
            writer_task,
            reader_task,
        });
        if let Some(previous) = previous {
            previous.writer_task.abort();
            previous.reader_task.abort();
        }

        info!(url = %self.url, room = %room, "joined signaling room");
        Ok(inbox_rx)
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        self.write(text_frame(&envelope)?).await
    }

    async fn heartbeat(&self) -> Result<()> {
        let frame = ControlFrame::Heartbeat {
            timestamp: Utc::now().timestamp_millis(),
        };
        self.write(text_frame(&frame)?).await
    }

    async fn leave(&self) -> Result<()> {
        let Some(connection) = self.connection.lock().await.take() else {
            return Ok(());
        };
        let _ = connection
            .writer
            .send(text_frame(&ControlFrame::Leave { room: &connection.room })?);
        let _ = connection.writer.send(Message::Close(None));
        // The writer task exits after flushing the close frame.
        connection.reader_task.abort();
        Ok(())
    }
}
