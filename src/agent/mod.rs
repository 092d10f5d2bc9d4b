//! Speech agent boundary
//!
//! The robot (or any speech-capable agent) is an external collaborator. The
//! bridge only sees the events it delivers and the commands it accepts.
//! `furhat` provides a WebSocket adapter for a Furhat-style realtime event API.

pub mod furhat;
pub mod protocol;

pub use furhat::FurhatClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque, already-encoded audio payload (base64 PCM as delivered by the peer)
///
/// Frames are relayed verbatim and never decoded or transcoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedAudio(String);

impl EncodedAudio {
    /// Wrap an encoded payload
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    /// The encoded payload
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length of the encoded payload in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Event delivered by the speech agent
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The user started speaking
    UserSpeechStart,
    /// The user stopped speaking; `text` is the recognised utterance
    UserSpeechEnd {
        /// Recognised text
        text: String,
    },
    /// The agent started speaking `text`
    AgentSpeechStart {
        /// Text being spoken
        text: String,
    },
    /// The agent finished speaking `text`
    AgentSpeechEnd {
        /// Text that was spoken
        text: String,
    },
    /// A captured microphone frame
    MicrophoneFrame(EncodedAudio),
}

/// Where the agent should capture audio from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSource {
    /// Microphone only
    Microphone,
    /// The agent's own speaker output only
    Speaker,
    /// Both microphone and speaker
    Both,
}

impl AudioSource {
    /// Whether the microphone is captured
    pub fn microphone(&self) -> bool {
        matches!(self, AudioSource::Microphone | AudioSource::Both)
    }

    /// Whether the speaker output is captured
    pub fn speaker(&self) -> bool {
        matches!(self, AudioSource::Speaker | AudioSource::Both)
    }
}

/// Listening behaviour requested from the agent
///
/// Timeout and resume values differ between deployments, so all of them are
/// configuration inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Concatenate consecutive user speech into a single utterance
    pub concatenate_utterances: bool,
    /// Silence (seconds) after which the user utterance is considered finished
    pub end_of_speech_timeout_secs: f64,
    /// Pause listening while the agent speaks
    pub stop_on_agent_speech_start: bool,
    /// Resume listening once the agent stops speaking
    pub resume_on_agent_speech_end: bool,
    /// Stop listening if no speech is detected
    pub stop_on_no_speech: bool,
    /// Stop listening after the first user utterance ends
    pub stop_on_user_end: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            concatenate_utterances: true,
            end_of_speech_timeout_secs: 0.5,
            stop_on_agent_speech_start: true,
            resume_on_agent_speech_end: true,
            stop_on_no_speech: false,
            stop_on_user_end: false,
        }
    }
}

/// Command issued to the speech agent
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    /// Speak the given text
    SpeakText(String),
    /// Stop any ongoing speech
    StopSpeaking,
    /// Start continuous listening
    StartListening(ListenConfig),
    /// Stop listening
    StopListening,
    /// Turn attention to the nearest user
    AttendUser,
    /// Start streaming captured audio frames
    StartAudioCapture {
        /// Sample rate in Hz
        sample_rate: u32,
        /// Capture source
        source: AudioSource,
    },
    /// Stop streaming captured audio frames
    StopAudioCapture,
    /// Open the speech audio output sink
    OpenSpeechAudioSink {
        /// Sample rate in Hz
        sample_rate: u32,
        /// Drive lip movement from the audio
        lip_sync: bool,
    },
    /// Write a chunk of audio to the open sink
    WriteSpeechAudioData(EncodedAudio),
    /// Close the speech audio output sink
    CloseSpeechAudioSink,
}

impl AgentCommand {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            AgentCommand::SpeakText(_) => "speak_text",
            AgentCommand::StopSpeaking => "stop_speaking",
            AgentCommand::StartListening(_) => "start_listening",
            AgentCommand::StopListening => "stop_listening",
            AgentCommand::AttendUser => "attend_user",
            AgentCommand::StartAudioCapture { .. } => "start_audio_capture",
            AgentCommand::StopAudioCapture => "stop_audio_capture",
            AgentCommand::OpenSpeechAudioSink { .. } => "open_speech_audio_sink",
            AgentCommand::WriteSpeechAudioData(_) => "write_speech_audio_data",
            AgentCommand::CloseSpeechAudioSink => "close_speech_audio_sink",
        }
    }
}

/// Errors raised while talking to the speech agent
#[derive(Error, Debug)]
pub enum AgentError {
    /// The connection could not be established
    #[error("Failed to connect to agent: {0}")]
    Connect(String),

    /// A command could not be delivered
    #[error("Failed to send command to agent: {0}")]
    Send(String),

    /// The connection is closed
    #[error("Agent connection closed")]
    Closed,
}

/// Command side of a speech agent
///
/// Events flow the other way through the channel handed out when the
/// connection is made.
#[async_trait]
pub trait SpeechAgent: Send + Sync {
    /// Deliver one command to the agent
    async fn execute(&self, command: &AgentCommand) -> Result<(), AgentError>;
}
