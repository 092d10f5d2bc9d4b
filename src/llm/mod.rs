//! Language-model backends
//!
//! A backend answers a chat request either in one piece or as a lazy,
//! finite stream of text fragments that ends at the backend's completion
//! marker. `openai` and `ollama` implement the trait over HTTP.

pub mod constants;
pub mod error;
pub mod ollama;
pub mod openai;
pub mod wire_types;

pub use error::BackendError;
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;

use crate::config::{LlmConfig, Provider};
use crate::dialogue::history::{Role, Utterance};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Stream of text fragments; ends after the completion marker
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Role of a message in a chat request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    /// Instructions for the model
    System,
    /// User input
    User,
    /// Earlier model output
    Assistant,
}

/// One message of a chat request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Sender role
    pub role: ChatRole,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Create a message
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Utterance> for ChatMessage {
    fn from(utterance: &Utterance) -> Self {
        let role = match utterance.role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        };
        ChatMessage::new(role, utterance.text.clone())
    }
}

/// A complete chat request: model, ordered context and generation options
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// Model name
    pub model: String,
    /// System prompt, history and the new user text, in order
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens
    pub max_tokens: Option<u32>,
}

/// A chat-capable model backend
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Send the request and wait for the whole reply
    async fn chat(&self, request: &ChatRequest) -> Result<String, BackendError>;

    /// Send the request and stream the reply as it is generated
    async fn chat_stream(&self, request: &ChatRequest) -> Result<FragmentStream, BackendError>;
}

/// Build the backend selected by the configuration
///
/// # Errors
/// * `BackendError::Config` - If the HTTP client cannot be built or a required key is missing
pub fn build_backend(config: &LlmConfig) -> Result<Arc<dyn ChatBackend>, BackendError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .build()
        .map_err(|e| BackendError::Config(format!("Failed to build HTTP client: {}", e)))?;
    let read_timeout = Duration::from_secs(config.read_timeout_secs);

    match config.provider {
        Provider::OpenAi => {
            let api_key = config
                .api_key
                .clone()
                .ok_or_else(|| BackendError::Config("OPENAI_API_KEY is not set".to_string()))?;
            Ok(Arc::new(OpenAiBackend::new(
                client,
                config.base_url.clone(),
                api_key,
                read_timeout,
            )))
        }
        Provider::Ollama => Ok(Arc::new(OllamaBackend::new(
            client,
            &config.base_url,
            read_timeout,
        ))),
    }
}

/// Split a streamed HTTP body into trimmed, non-empty lines
///
/// Each read from the body must complete within `read_timeout`.
pub(crate) fn body_lines(
    response: reqwest::Response,
    read_timeout: Duration,
) -> impl Stream<Item = Result<String, BackendError>> + Send {
    try_stream! {
        let body = response.bytes_stream();
        futures_util::pin_mut!(body);
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let next = tokio::time::timeout(read_timeout, body.next())
                .await
                .map_err(|_| BackendError::Timeout(read_timeout.as_secs()))?;
            let chunk = match next {
                Some(chunk) => chunk,
                None => break,
            };
            let chunk = chunk.map_err(|e| BackendError::Unreachable(e.to_string()))?;
            pending.extend_from_slice(&chunk);

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                if !line.is_empty() {
                    yield line;
                }
            }
        }

        let rest = String::from_utf8_lossy(&pending).trim().to_string();
        if !rest.is_empty() {
            yield rest;
        }
    }
}

/// Read a non-success response into a `BackendError::Status`
pub(crate) async fn status_error(response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error body".to_string());
    tracing::error!(status_code = status, error_body = %body, "Backend returned error status");
    BackendError::Status { status, body }
}
