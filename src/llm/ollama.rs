//! Ollama chat client
//!
//! Talks to a local or LAN Ollama server through `/api/chat`. Streaming
//! responses are newline-delimited JSON objects; the last one has
//! `"done": true`.

use super::constants::OLLAMA_DEFAULT_PORT;
use super::wire_types::{OllamaChatRequest, OllamaChatResponse, OllamaOptions, WireMessage};
use super::{body_lines, status_error, BackendError, ChatBackend, ChatRequest, ChatRole};
use super::FragmentStream;
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;

/// Client for an Ollama server
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    read_timeout: Duration,
}

impl OllamaBackend {
    /// Create a client
    ///
    /// # Arguments
    /// * `client` - Shared HTTP client
    /// * `address` - Bare host, `host:port` or URL of the server
    /// * `read_timeout` - Bound on waiting for a response or the next stream line
    pub fn new(client: reqwest::Client, address: &str, read_timeout: Duration) -> Self {
        Self {
            client,
            base_url: normalize_base_url(address),
            read_timeout,
        }
    }

    /// Normalised server root, e.g. `http://192.168.1.20:11434`
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, BackendError> {
        let options = if request.temperature.is_some() || request.max_tokens.is_some() {
            Some(OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            })
        } else {
            None
        };
        let body = OllamaChatRequest {
            model: &request.model,
            messages: wire_messages(request),
            stream,
            options,
        };
        let url = format!("{}/api/chat", self.base_url);

        tracing::debug!(
            url = %url,
            model = %request.model,
            message_count = request.messages.len(),
            stream = stream,
            "Calling Ollama chat"
        );

        let mut builder = self.client.post(&url).json(&body);
        if !stream {
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
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, BackendError> {
        let response = self.post(request, false).await?;
        let body = response.text().await.map_err(BackendError::from)?;

        let parsed: OllamaChatResponse = serde_json::from_str(&body).map_err(|e| {
            BackendError::Malformed(format!("{} - Response body: {}", e, body))
        })?;
        if let Some(error) = parsed.error {
            return Err(BackendError::Malformed(format!("Ollama error: {}", error)));
        }

        let text = parsed
            .message
            .map(|message| message.content.trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(BackendError::Malformed(
                "response contains no message content".to_string(),
            ));
        }

        tracing::debug!(response_len = text.len(), "Received Ollama reply");
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
                let parsed: OllamaChatResponse = serde_json::from_str(&line).map_err(|e| {
                    BackendError::Malformed(format!("undecodable stream line: {}", e))
                })?;
                if let Some(error) = parsed.error {
                    Err::<(), BackendError>(BackendError::Malformed(format!(
                        "Ollama error: {}",
                        error
                    )))?;
                }
                if let Some(message) = parsed.message {
                    if !message.content.is_empty() {
                        yield message.content;
                    }
                }
                if parsed.done {
                    finished = true;
                    break;
                }
            }
            if !finished {
                Err::<(), BackendError>(BackendError::Malformed(
                    "stream ended before done".to_string(),
                ))?;
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Turn a bare host, `host:port` or URL into `scheme://host:port`
///
/// The scheme defaults to `http` and the port to 11434. Paths are dropped.
pub fn normalize_base_url(address: &str) -> String {
    let address = address.trim();
    let (scheme, rest) = match address.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", address),
    };
    let authority = rest.split('/').next().unwrap_or_default();

    let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal
        match stripped.split_once(']') {
            Some((host, tail)) => (
                format!("[{}]", host),
                tail.strip_prefix(':').and_then(|p| p.parse::<u16>().ok()),
            ),
            None => (authority.to_string(), None),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse::<u16>().ok()),
            None => (authority.to_string(), None),
        }
    };

    format!(
        "{}://{}:{}",
        scheme,
        host,
        port.unwrap_or(OLLAMA_DEFAULT_PORT)
    )
}

fn wire_messages(request: &ChatRequest) -> Vec<WireMessage<'_>> {
    request
        .messages
        .iter()
        .map(|message| WireMessage {
            role: match message.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            },
            content: &message.content,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use serial_test::serial;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "llama3.1:8b".to_string(),
            messages: vec![
                ChatMessage::new(ChatRole::System, "Be brief."),
                ChatMessage::new(ChatRole::User, "Hello"),
            ],
            temperature: Some(0.7),
            max_tokens: Some(120),
        }
    }

    fn backend(address: &str) -> OllamaBackend {
        OllamaBackend::new(reqwest::Client::new(), address, Duration::from_secs(5))
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("192.168.1.20"), "http://192.168.1.20:11434");
        assert_eq!(normalize_base_url("localhost:8080"), "http://localhost:8080");
        assert_eq!(
            normalize_base_url("http://ollama.lan/api/"),
            "http://ollama.lan:11434"
        );
        assert_eq!(
            normalize_base_url("https://ollama.lan:443"),
            "https://ollama.lan:443"
        );
        assert_eq!(normalize_base_url("[::1]"), "http://[::1]:11434");
        assert_eq!(normalize_base_url("[::1]:7000"), "http://[::1]:7000");
    }

    #[tokio::test]
    #[serial]
    async fn test_chat_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat")
            .match_body(Matcher::PartialJson(json!({
                "model": "llama3.1:8b",
                "stream": false,
                "messages": [
                    {"role": "system", "content": "Be brief."},
                    {"role": "user", "content": "Hello"}
                ],
                "options": {"num_predict": 120}
            })))
            .with_status(200)
            .with_body(r#"{"message":{"role":"assistant","content":"Hi!"},"done":true}"#)
            .create_async()
            .await;

        let result = backend(&server.url()).chat(&request()).await;

        mock.assert_async().await;
        assert_eq!(result.unwrap(), "Hi!");
    }

    #[tokio::test]
    #[serial]
    async fn test_chat_in_band_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body(r#"{"error":"model not found"}"#)
            .create_async()
            .await;

        let result = backend(&server.url()).chat(&request()).await;

        mock.assert_async().await;
        match result {
            Err(BackendError::Malformed(message)) => assert!(message.contains("model not found")),
            other => panic!("expected malformed error, got {:?}", other),
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_chat_error_status() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let result = backend(&server.url()).chat(&request()).await;

        mock.assert_async().await;
        assert!(matches!(
            result,
            Err(BackendError::Status { status: 500, .. })
        ));
    }

    #[tokio::test]
    #[serial]
    async fn test_chat_stream_until_done() {
        let mut server = Server::new_async().await;
        let body = concat!(
            "{\"message\":{\"content\":\"Hello\"},\"done\":false}\n",
            "{\"message\":{\"content\":\" world.\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n",
        );
        let mock = server
            .mock("POST", "/api/chat")
            .match_body(Matcher::PartialJson(json!({"stream": true})))
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let mut stream = backend(&server.url()).chat_stream(&request()).await.unwrap();
        let mut fragments = Vec::new();
        while let Some(item) = stream.next().await {
            fragments.push(item.unwrap());
        }

        mock.assert_async().await;
        assert_eq!(fragments, vec!["Hello", " world."]);
    }

    #[tokio::test]
    #[serial]
    async fn test_chat_stream_undecodable_line_fails() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_body("{\"message\":{\"content\":\"Hi\"},\"done\":false}\nnot json\n")
            .create_async()
            .await;

        let mut stream = backend(&server.url()).chat_stream(&request()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "Hi");
        assert!(matches!(
            stream.next().await,
            Some(Err(BackendError::Malformed(_)))
        ));
        assert!(stream.next().await.is_none());

        mock.assert_async().await;
    }
}
