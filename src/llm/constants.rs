//! Backend constants
//!
//! Wire markers and defaults shared by the backend clients.

/// SSE stream termination signal
pub const SSE_DONE_SIGNAL: &str = "[DONE]";

/// SSE data line prefix
pub const SSE_DATA_PREFIX: &str = "data:";

/// Default OpenAI API base URL
pub const OPENAI_API_BASE_URL: &str = "https://api.openai.com/v1";

/// Default Ollama port
pub const OLLAMA_DEFAULT_PORT: u16 = 11434;
