//! Furhat-style agent client
//!
//! Holds one WebSocket connection to the robot's realtime event endpoint.
//! Commands are written through a shared sink; a reader task turns incoming
//! messages into `AgentEvent`s on a channel.

use super::protocol::{AgentMessage, AgentRequest};
use super::{AgentCommand, AgentError, AgentEvent, SpeechAgent};
use crate::config::AgentConfig;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the agent event channel (microphone frames arrive at a high rate)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handle to a connected agent
pub struct FurhatClient {
    /// Write half of the socket
    sink: Mutex<Option<SplitSink<AgentSocket, Message>>>,
    /// Task forwarding incoming messages as events
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Endpoint, kept for logging
    url: String,
}

impl FurhatClient {
    /// Connect to the agent and start receiving events
    ///
    /// # Arguments
    /// * `config` - Agent host, port and optional authentication key
    ///
    /// # Returns
    /// * `Ok((FurhatClient, Receiver<AgentEvent>))` - Command handle and event stream
    /// * `Err(AgentError::Connect)` - If the socket cannot be opened
    pub async fn connect(
        config: &AgentConfig,
    ) -> Result<(Self, mpsc::Receiver<AgentEvent>), AgentError> {
        let url = config.events_url();
        debug!(url = %url, "Connecting to agent");

        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| AgentError::Connect(format!("{}: {}", url, e)))?;
        let (mut sink, stream) = socket.split();

        if let Some(key) = &config.auth_key {
            let auth = serde_json::to_string(&AgentRequest::Auth { key: key.clone() })
                .map_err(|e| AgentError::Send(e.to_string()))?;
            sink.send(Message::Text(auth))
                .await
                .map_err(|e| AgentError::Connect(format!("authentication failed: {}", e)))?;
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader = tokio::spawn(forward_events(stream, tx));

        info!(url = %url, "Connected to agent");

        Ok((
            Self {
                sink: Mutex::new(Some(sink)),
                reader: Mutex::new(Some(reader)),
                url,
            },
            rx,
        ))
    }

    /// Close the connection
    ///
    /// The event channel closes once the reader task exits.
    pub async fn disconnect(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(url = %self.url, error = %e, "Error while closing agent socket");
            }
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        info!(url = %self.url, "Disconnected from agent");
    }
}

#[async_trait]
impl SpeechAgent for FurhatClient {
    async fn execute(&self, command: &AgentCommand) -> Result<(), AgentError> {
        let request = AgentRequest::from(command);
        let payload =
            serde_json::to_string(&request).map_err(|e| AgentError::Send(e.to_string()))?;

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(AgentError::Closed)?;
        sink.send(Message::Text(payload))
            .await
            .map_err(|e| AgentError::Send(format!("{}: {}", command.name(), e)))
    }
}

impl Drop for FurhatClient {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.try_lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }
}

async fn forward_events(mut stream: SplitStream<AgentSocket>, tx: mpsc::Sender<AgentEvent>) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                info!("Agent closed the connection");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!(error = %e, "Agent socket error");
                break;
            }
        };

        let event = match serde_json::from_str::<AgentMessage>(&text) {
            Ok(message) => message.into_event(),
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable agent message");
                None
            }
        };

        if let Some(event) = event {
            if tx.send(event).await.is_err() {
                // Receiver dropped, the session is over
                break;
            }
        }
    }
}
