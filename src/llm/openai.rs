//! OpenAI chat-completions client
//!
//! Sends the conversation to `{base_url}/chat/completions`. Single-shot calls
//! read one JSON body; streamed calls read server-sent events until the
//! `[DONE]` marker.

use super::constants::{SSE_DATA_PREFIX, SSE_DONE_SIGNAL};
use super::wire_types::{CompletionChunk, CompletionRequest, CompletionResponse, WireMessage};
use super::{body_lines, status_error, BackendError, ChatBackend, ChatRequest, ChatRole};
use super::FragmentStream;
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;

/// Client for an OpenAI-compatible chat-completions endpoint
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    read_timeout: Duration,
}

/// Meaning of one line of an SSE body
#[derive(Debug, PartialEq)]
pub enum SseLine {
    /// A piece of generated text
    Fragment(String),
    /// The completion marker
    Done,
    /// Anything that carries no text (comments, `event:` lines, empty deltas)
    Skip,
}

impl OpenAiBackend {
    /// Create a client
    ///
    /// # Arguments
    /// * `client` - Shared HTTP client (connection pooling, connect timeout)
    /// * `base_url` - API root, e.g. `https://api.openai.com/v1`
    /// * `api_key` - Bearer token
    /// * `read_timeout` - Bound on waiting for a response or the next stream chunk
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            read_timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let body = CompletionRequest {
            model: &request.model,
            messages: wire_messages(request),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        };

        tracing::debug!(
            url = %self.endpoint(),
            model = %request.model,
            message_count = request.messages.len(),
            stream = stream,
            "Calling OpenAI chat completions"
        );

        let mut builder = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body);
        if !stream {
            // Streamed bodies are bounded per chunk instead
            builder = builder.timeout(self.read_timeout);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(self.read_timeout.as_secs())
            } else {
                BackendError::from(e)
            }
        })?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, BackendError> {
        let response = self.post(request, false).await?;
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(self.read_timeout.as_secs())
            } else {
                BackendError::from(e)
            }
        })?;

        let parsed: CompletionResponse = serde_json::from_str(&body).map_err(|e| {
            BackendError::Malformed(format!("{} - Response body: {}", e, body))
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(BackendError::Malformed(
                "response contains no message content".to_string(),
            ));
        }

        tracing::debug!(response_len = text.len(), "Received OpenAI completion");
        Ok(text)
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<FragmentStream, BackendError> {
        let response = self.post(request, true).await?;
        let lines = body_lines(response, self.read_timeout);

        let stream = try_stream! {
            futures_util::pin_mut!(lines);
            let mut finished = false;
            while let Some(line) = lines.next().await {
                let line = line?;
                match parse_sse_line(&line)? {
                    SseLine::Fragment(text) => {
                        yield text;
                    }
                    SseLine::Done => {
                        finished = true;
                        break;
                    }
                    SseLine::Skip => {}
                }
            }
            if !finished {
                Err::<(), BackendError>(BackendError::Malformed(format!(
                    "stream ended without {}",
                    SSE_DONE_SIGNAL
                )))?;
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Interpret one trimmed line of a chat-completions SSE body
///
/// # Errors
/// * `BackendError::Malformed` - If a data line is neither the completion
///   marker nor a decodable chunk
pub fn parse_sse_line(line: &str) -> Result<SseLine, BackendError> {
    let Some(data) = line.strip_prefix(SSE_DATA_PREFIX) else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == SSE_DONE_SIGNAL {
        return Ok(SseLine::Done);
    }

    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|e| BackendError::Malformed(format!("undecodable stream chunk: {}", e)))?;
    match chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
    {
        Some(text) if !text.is_empty() => Ok(SseLine::Fragment(text)),
        _ => Ok(SseLine::Skip),
    }
}

fn wire_messages(request: &ChatRequest) -> Vec<WireMessage<'_>> {
    request
        .messages
        .iter()
        .map(|message| WireMessage {
            role: match message.role {
                ChatRole::System => "developer",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            },
            content: &message.content,
        })
        .collect()
}
