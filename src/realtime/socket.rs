//! Realtime transport
//!
//! `RealtimeTransport` is the seam between the voice session and the
//! backend socket. `WebSocketTransport` implements it over
//! `tokio-tungstenite` with the bearer and beta headers the realtime API
//! expects.

use super::events::{decode_server_event, ClientEvent, ServerEvent};
use crate::error::BridgeError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// Duplex event channel to a realtime backend
#[async_trait]
pub trait RealtimeTransport: Send {
    /// Send one event
    async fn send(&mut self, event: &ClientEvent) -> Result<(), BridgeError>;

    /// Next decoded event; `None` once the socket is closed
    ///
    /// An undecodable frame yields `Err(BridgeError::Protocol)`.
    async fn next_event(&mut self) -> Option<Result<ServerEvent, BridgeError>>;

    /// Close the socket (best effort)
    async fn close(&mut self);
}

/// WebSocket connection to the realtime API
pub struct WebSocketTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketTransport {
    /// Open the socket
    ///
    /// # Arguments
    /// * `url` - Realtime endpoint including the model query
    /// * `api_key` - Bearer token
    ///
    /// # Errors
    /// * `BridgeError::Config` - If the URL or key cannot form a request
    /// * `BridgeError::Connection` - If the handshake fails
    pub async fn connect(url: &str, api_key: &str) -> Result<Self, BridgeError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| BridgeError::Config(format!("invalid realtime URL {}: {}", url, e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| BridgeError::Config(format!("invalid API key header: {}", e)))?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        debug!(url = %url, "Connecting to realtime backend");
        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| BridgeError::Connection(format!("{}: {}", url, e)))?;
        info!(url = %url, "Connected to realtime backend");

        Ok(Self { socket })
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), BridgeError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| BridgeError::Protocol(format!("failed to encode {}: {}", event.name(), e)))?;
        self.socket
            .send(Message::Text(payload))
            .await
            .map_err(|e| BridgeError::Connection(format!("failed to send {}: {}", event.name(), e)))
    }

    async fn next_event(&mut self) -> Option<Result<ServerEvent, BridgeError>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(decode_server_event(&text)),
                Ok(Message::Close(frame)) => {
                    info!(frame = ?frame, "Realtime backend closed the connection");
                    return None;
                }
                // Pings are answered by tungstenite; binary frames carry nothing we use
                Ok(_) => continue,
                Err(e) => return Some(Err(BridgeError::Connection(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.close(None).await {
            debug!(error = %e, "Error while closing realtime socket");
        }
    }
}
