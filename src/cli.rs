//! Command line
//!
//! Flags override the environment-derived `Config` value by value.

use crate::config::{Config, Provider, RunMode};
use clap::{Parser, Subcommand};

/// Bridge a speech robot to a language model
#[derive(Debug, Parser)]
#[command(name = "dialogue-bridge", version, about)]
pub struct Cli {
    /// Robot IP address or host name
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Robot realtime API port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Authentication key for the robot's realtime API
    #[arg(long = "auth-key", global = true)]
    pub auth_key: Option<String>,

    /// JSONL file receiving the conversation
    #[arg(long = "log", global = true)]
    pub transcript: Option<std::path::PathBuf>,

    /// Session to run
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Session kinds
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Text dialogue through a chat backend
    Chat {
        /// Backend provider (openai or ollama)
        #[arg(long)]
        provider: Option<Provider>,

        /// Model name
        #[arg(long)]
        model: Option<String>,

        /// Backend URL or Ollama host
        #[arg(long = "llm-url")]
        base_url: Option<String>,

        /// Speak streamed output as it arrives
        #[arg(long)]
        stream: bool,

        /// System prompt
        #[arg(long = "system-prompt")]
        system_prompt: Option<String>,

        /// Keep at most this many history entries (even)
        #[arg(long = "max-history")]
        max_history: Option<usize>,
    },
    /// Realtime audio relay
    Realtime {
        /// Session instructions
        #[arg(long)]
        instructions: Option<String>,
    },
}

impl Cli {
    /// Session selected on the command line (chat when none is given)
    pub fn mode(&self) -> RunMode {
        match self.command {
            Some(Command::Realtime { .. }) => RunMode::Realtime,
            Some(Command::Chat { .. }) | None => RunMode::Chat,
        }
    }

    /// Apply the flags that were given on top of `config`
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.agent.host = host.clone();
        }
        if let Some(port) = self.port {
            config.agent.port = port;
        }
        if let Some(key) = &self.auth_key {
            config.agent.auth_key = Some(key.clone());
        }
        if let Some(path) = &self.transcript {
            config.transcript_path = Some(path.clone());
        }

        match &self.command {
            Some(Command::Chat {
                provider,
                model,
                base_url,
                stream,
                system_prompt,
                max_history,
            }) => {
                if let Some(provider) = provider {
                    if *provider != config.llm.provider {
                        // Provider defaults follow the provider unless set explicitly below
                        config.llm.provider = *provider;
                        config.llm.model = provider.default_model().to_string();
                        config.llm.base_url = provider.default_base_url();
                    }
                }
                if let Some(model) = model {
                    config.llm.model = model.clone();
                }
                if let Some(url) = base_url {
                    config.llm.base_url = url.clone();
                }
                if *stream {
                    config.llm.streaming = true;
                }
                if let Some(prompt) = system_prompt {
                    config.dialogue.system_prompt = prompt.clone();
                }
                if let Some(cap) = max_history {
                    config.dialogue.history_max_messages = Some(*cap);
                }
            }
            Some(Command::Realtime { instructions }) => {
                if let Some(instructions) = instructions {
                    config.realtime.instructions = instructions.clone();
                }
            }
            None => {}
        }
    }
}
