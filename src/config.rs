//! Application configuration
//!
//! Centralized configuration management with environment variable support
//! and sensible defaults. Command-line flags override individual values
//! after loading (see `cli`).

use crate::agent::ListenConfig;
use crate::error::BridgeError;
use crate::llm::constants::{OLLAMA_DEFAULT_PORT, OPENAI_API_BASE_URL};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default OpenAI realtime endpoint
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime?model=gpt-realtime";

/// Default system prompt for text dialogue
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly robot looking for a nice little chat.";

/// Default instructions for the realtime voice session
pub const DEFAULT_REALTIME_INSTRUCTIONS: &str =
    "You are a friendly robot speaking English, looking for a nice little chat.";

/// Default line spoken when the session opens
pub const DEFAULT_OPENING_LINE: &str = "Hello, I am Furhat. How are you today?";

/// Default line spoken when a backend request fails
pub const DEFAULT_FALLBACK_UTTERANCE: &str = "Sorry, I had trouble thinking.";

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Speech agent connection
    pub agent: AgentConfig,
    /// Language-model backend
    pub llm: LlmConfig,
    /// Turn-taking behavior
    pub dialogue: DialogueConfig,
    /// Realtime voice session
    pub realtime: RealtimeConfig,
    /// JSONL conversation log (None = disabled)
    pub transcript_path: Option<PathBuf>,
}

/// Speech agent connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Agent host name or address
    pub host: String,
    /// Agent realtime API port
    pub port: u16,
    /// Optional authentication key sent after connecting
    pub auth_key: Option<String>,
}

impl AgentConfig {
    /// WebSocket URL of the agent's event endpoint
    pub fn events_url(&self) -> String {
        format!("ws://{}:{}/v1/events", self.host, self.port)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            auth_key: None,
        }
    }
}

/// Supported language-model providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provider {
    /// OpenAI chat completions
    #[default]
    OpenAi,
    /// Ollama `/api/chat`
    Ollama,
}

impl Provider {
    /// Model used when none is configured
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::Ollama => "llama3.1:8b",
        }
    }

    /// Base URL used when none is configured
    pub fn default_base_url(&self) -> String {
        match self {
            Provider::OpenAi => OPENAI_API_BASE_URL.to_string(),
            Provider::Ollama => format!("http://127.0.0.1:{}", OLLAMA_DEFAULT_PORT),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::OpenAi => write!(f, "openai"),
            Provider::Ollama => write!(f, "ollama"),
        }
    }
}

impl FromStr for Provider {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "ollama" => Ok(Provider::Ollama),
            other => Err(BridgeError::Config(format!(
                "unknown LLM provider '{}' (expected openai or ollama)",
                other
            ))),
        }
    }
}

/// Language-model backend settings
#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    /// Which backend to call
    pub provider: Provider,
    /// Model name
    pub model: String,
    /// API root (OpenAI) or server address (Ollama)
    pub base_url: String,
    /// OpenAI API key
    pub api_key: Option<String>,
    /// TCP connect timeout
    pub connect_timeout_secs: u64,
    /// Response / per-chunk read timeout
    pub read_timeout_secs: u64,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens
    pub max_tokens: Option<u32>,
    /// Speak streamed output as it arrives instead of waiting for the full reply
    pub streaming: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let provider = Provider::default();
        Self {
            provider,
            model: provider.default_model().to_string(),
            base_url: provider.default_base_url(),
            api_key: None,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            temperature: None,
            max_tokens: None,
            streaming: false,
        }
    }
}

/// Turn-taking settings for the text dialogue
#[derive(Debug, Clone, PartialEq)]
pub struct DialogueConfig {
    /// Instructions placed first in every model context
    pub system_prompt: String,
    /// Spoken when the session opens (None = silent start)
    pub opening_line: Option<String>,
    /// Spoken when a backend request fails
    pub fallback_utterance: String,
    /// Sliding-window cap on committed history (None = unbounded)
    pub history_max_messages: Option<usize>,
    /// Time floor for flushing streamed text
    pub flush_min_interval: Duration,
    /// Listening behavior requested from the agent
    pub listen: ListenConfig,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            opening_line: Some(DEFAULT_OPENING_LINE.to_string()),
            fallback_utterance: DEFAULT_FALLBACK_UTTERANCE.to_string(),
            history_max_messages: None,
            flush_min_interval: Duration::from_millis(400),
            listen: ListenConfig::default(),
        }
    }
}

/// Realtime voice session settings
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    /// Realtime socket URL
    pub url: String,
    /// Session instructions
    pub instructions: String,
    /// Sample rate of both audio directions
    pub sample_rate: u32,
    /// Drive the agent's lip movement from output audio
    pub lip_sync: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            instructions: DEFAULT_REALTIME_INSTRUCTIONS.to_string(),
            sample_rate: 24000,
            lip_sync: true,
        }
    }
}

/// Which session the process runs; validation depends on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Text round-trip through a chat backend
    Chat,
    /// Realtime audio relay
    Realtime,
}

impl Config {
    /// Load configuration from environment variables with defaults
    ///
    /// # Errors
    /// * `BridgeError::Config` - If a variable is set but cannot be parsed
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BridgeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let agent_defaults = AgentConfig::default();
        let agent = AgentConfig {
            host: get("AGENT_HOST").unwrap_or(agent_defaults.host),
            port: parse_var(&get, "AGENT_PORT")?.unwrap_or(agent_defaults.port),
            auth_key: get("AGENT_AUTH_KEY"),
        };

        let provider = match get("LLM_PROVIDER") {
            Some(value) => value.parse()?,
            None => Provider::default(),
        };
        let llm_defaults = LlmConfig::default();
        let llm = LlmConfig {
            provider,
            model: get("LLM_MODEL").unwrap_or_else(|| provider.default_model().to_string()),
            base_url: get("LLM_BASE_URL").unwrap_or_else(|| provider.default_base_url()),
            api_key: get("OPENAI_API_KEY"),
            connect_timeout_secs: parse_var(&get, "LLM_CONNECT_TIMEOUT_SECS")?
                .unwrap_or(llm_defaults.connect_timeout_secs),
            read_timeout_secs: parse_var(&get, "LLM_READ_TIMEOUT_SECS")?
                .unwrap_or(llm_defaults.read_timeout_secs),
            temperature: parse_var(&get, "LLM_TEMPERATURE")?,
            max_tokens: parse_var(&get, "LLM_MAX_TOKENS")?,
            streaming: parse_var(&get, "LLM_STREAMING")?.unwrap_or(llm_defaults.streaming),
        };

        let dialogue_defaults = DialogueConfig::default();
        let listen_defaults = ListenConfig::default();
        let dialogue = DialogueConfig {
            system_prompt: get("SYSTEM_PROMPT").unwrap_or(dialogue_defaults.system_prompt),
            // Set but blank disables the opening line
            opening_line: match lookup("OPENING_LINE") {
                Some(line) if line.trim().is_empty() => None,
                Some(line) => Some(line),
                None => dialogue_defaults.opening_line,
            },
            fallback_utterance: get("FALLBACK_UTTERANCE")
                .unwrap_or(dialogue_defaults.fallback_utterance),
            history_max_messages: parse_var(&get, "HISTORY_MAX_MESSAGES")?,
            flush_min_interval: parse_var(&get, "FLUSH_MIN_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(dialogue_defaults.flush_min_interval),
            listen: ListenConfig {
                concatenate_utterances: parse_var(&get, "LISTEN_CONCAT")?
                    .unwrap_or(listen_defaults.concatenate_utterances),
                end_of_speech_timeout_secs: parse_var(&get, "LISTEN_END_SPEECH_TIMEOUT_SECS")?
                    .unwrap_or(listen_defaults.end_of_speech_timeout_secs),
                stop_on_agent_speech_start: parse_var(&get, "LISTEN_STOP_ON_AGENT_SPEECH")?
                    .unwrap_or(listen_defaults.stop_on_agent_speech_start),
                resume_on_agent_speech_end: parse_var(&get, "LISTEN_RESUME_ON_AGENT_SPEECH_END")?
                    .unwrap_or(listen_defaults.resume_on_agent_speech_end),
                ..listen_defaults
            },
        };

        let realtime_defaults = RealtimeConfig::default();
        let realtime = RealtimeConfig {
            url: get("REALTIME_URL").unwrap_or(realtime_defaults.url),
            instructions: get("REALTIME_INSTRUCTIONS").unwrap_or(realtime_defaults.instructions),
            sample_rate: parse_var(&get, "REALTIME_SAMPLE_RATE")?
                .unwrap_or(realtime_defaults.sample_rate),
            lip_sync: parse_var(&get, "REALTIME_LIP_SYNC")?.unwrap_or(realtime_defaults.lip_sync),
        };

        Ok(Self {
            agent,
            llm,
            dialogue,
            realtime,
            transcript_path: get("CONVERSATION_LOG").map(PathBuf::from),
        })
    }

    /// Check the settings needed by `mode` before anything connects
    ///
    /// # Errors
    /// * `BridgeError::Config` - Describing the first invalid setting
    pub fn validate(&self, mode: RunMode) -> Result<(), BridgeError> {
        if self.agent.host.trim().is_empty() {
            return Err(BridgeError::Config("agent host is empty".to_string()));
        }

        match mode {
            RunMode::Chat => {
                if self.llm.model.trim().is_empty() {
                    return Err(BridgeError::Config("LLM model is empty".to_string()));
                }
                if self.llm.provider == Provider::OpenAi && self.llm.api_key.is_none() {
                    return Err(BridgeError::Config(
                        "OPENAI_API_KEY is required for the openai provider".to_string(),
                    ));
                }
                if self.llm.connect_timeout_secs == 0 || self.llm.read_timeout_secs == 0 {
                    return Err(BridgeError::Config(
                        "LLM timeouts must be greater than zero".to_string(),
                    ));
                }
                if let Some(cap) = self.dialogue.history_max_messages {
                    if cap == 0 || cap % 2 != 0 {
                        return Err(BridgeError::Config(format!(
                            "HISTORY_MAX_MESSAGES must be even and non-zero, got {}",
                            cap
                        )));
                    }
                }
            }
            RunMode::Realtime => {
                if self.llm.api_key.is_none() {
                    return Err(BridgeError::Config(
                        "OPENAI_API_KEY is required for realtime mode".to_string(),
                    ));
                }
                if self.realtime.sample_rate == 0 {
                    return Err(BridgeError::Config(
                        "REALTIME_SAMPLE_RATE must be greater than zero".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn parse_var<T, G>(get: &G, name: &str) -> Result<Option<T>, BridgeError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| BridgeError::Config(format!("invalid {}='{}': {}", name, raw, e))),
        None => Ok(None),
    }
}
