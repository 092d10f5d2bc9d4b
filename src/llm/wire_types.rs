//! Backend wire types
//!
//! Structs that mirror the OpenAI chat-completions and Ollama chat JSON
//! formats. Used to serialize requests and deserialize responses.

use serde::{Deserialize, Serialize};

/// A message as both APIs expect it
#[derive(Serialize, Debug)]
pub struct WireMessage<'a> {
    /// Role name ("developer", "system", "user" or "assistant")
    pub role: &'static str,
    /// Message text
    pub content: &'a str,
}

/// OpenAI chat-completions request body
#[derive(Serialize, Debug)]
pub struct CompletionRequest<'a> {
    /// Model name
    pub model: &'a str,
    /// Conversation so far
    pub messages: Vec<WireMessage<'a>>,
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Request an SSE stream instead of a single JSON body
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

/// OpenAI chat-completions response
#[derive(Deserialize, Debug)]
pub struct CompletionResponse {
    /// Candidate completions
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

/// A single completion
#[derive(Deserialize, Debug)]
pub struct CompletionChoice {
    /// Generated message
    pub message: CompletionMessage,
}

/// Message inside a completion
#[derive(Deserialize, Debug)]
pub struct CompletionMessage {
    /// Generated text (absent for tool calls)
    #[serde(default)]
    pub content: Option<String>,
}

/// One SSE chunk of a streamed completion
#[derive(Deserialize, Debug)]
pub struct CompletionChunk {
    /// Deltas, normally one
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

/// Delta-carrying choice of a streamed chunk
#[derive(Deserialize, Debug)]
pub struct ChunkChoice {
    /// Incremental content
    #[serde(default)]
    pub delta: ChunkDelta,
}

/// Incremental content of a streamed chunk
#[derive(Deserialize, Debug, Default)]
pub struct ChunkDelta {
    /// New text, if any
    #[serde(default)]
    pub content: Option<String>,
}

/// Ollama `/api/chat` request body
#[derive(Serialize, Debug)]
pub struct OllamaChatRequest<'a> {
    /// Model name
    pub model: &'a str,
    /// Conversation so far
    pub messages: Vec<WireMessage<'a>>,
    /// Stream NDJSON lines instead of a single body
    pub stream: bool,
    /// Generation options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<OllamaOptions>,
}

/// Ollama generation options
#[derive(Serialize, Debug, Default)]
pub struct OllamaOptions {
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
}

/// Ollama `/api/chat` response, or one streamed line of it
#[derive(Deserialize, Debug)]
pub struct OllamaChatResponse {
    /// Generated message (partial when streaming)
    #[serde(default)]
    pub message: Option<OllamaMessage>,
    /// Set on the final line of a stream
    #[serde(default)]
    pub done: bool,
    /// Error reported in-band
    #[serde(default)]
    pub error: Option<String>,
}

/// Message inside an Ollama response
#[derive(Deserialize, Debug)]
pub struct OllamaMessage {
    /// Generated text
    #[serde(default)]
    pub content: String,
}
