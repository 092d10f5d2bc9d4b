//! Agent wire protocol
//!
//! JSON messages exchanged with a Furhat-style realtime event API. Requests
//! and events are tagged by their `type` field.

use super::{AgentCommand, AgentEvent, EncodedAudio};
use serde::{Deserialize, Serialize};

/// Request sent to the agent
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum AgentRequest {
    /// Authenticate the connection
    #[serde(rename = "request.auth")]
    Auth {
        /// Access key configured on the robot
        key: String,
    },
    /// Speak text
    #[serde(rename = "request.speak.text")]
    SpeakText {
        /// Text to speak
        text: String,
        /// Abort current speech first
        abort: bool,
    },
    /// Stop speaking
    #[serde(rename = "request.speak.stop")]
    SpeakStop,
    /// Start listening
    #[serde(rename = "request.listen.start")]
    ListenStart {
        /// Concatenate speech into one utterance
        concat: bool,
        /// Report partial results
        partial: bool,
        /// Stop when no speech is detected
        stop_no_speech: bool,
        /// Stop when the user stops speaking
        stop_user_end: bool,
        /// Stop when the robot starts speaking
        stop_robot_start: bool,
        /// Resume when the robot stops speaking
        resume_robot_end: bool,
        /// End-of-speech silence timeout in seconds
        end_speech_timeout: f64,
    },
    /// Stop listening
    #[serde(rename = "request.listen.stop")]
    ListenStop,
    /// Attend the closest user
    #[serde(rename = "request.attend.user")]
    AttendUser,
    /// Start streaming audio frames
    #[serde(rename = "request.audio.start")]
    AudioStart {
        /// Sample rate in Hz
        sample_rate: u32,
        /// Capture the microphone
        microphone: bool,
        /// Capture the speaker output
        speaker: bool,
    },
    /// Stop streaming audio frames
    #[serde(rename = "request.audio.stop")]
    AudioStop,
    /// Open the speech audio sink
    #[serde(rename = "request.speak.audio.start")]
    SpeakAudioStart {
        /// Sample rate in Hz
        sample_rate: u32,
        /// Drive lip sync from the audio
        lipsync: bool,
    },
    /// Audio to play through the open sink
    #[serde(rename = "request.speak.audio.data")]
    SpeakAudioData {
        /// Encoded audio
        audio: EncodedAudio,
    },
    /// Close the speech audio sink
    #[serde(rename = "request.speak.audio.end")]
    SpeakAudioEnd,
}

impl From<&AgentCommand> for AgentRequest {
    fn from(command: &AgentCommand) -> Self {
        match command {
            AgentCommand::SpeakText(text) => AgentRequest::SpeakText {
                text: text.clone(),
                abort: false,
            },
            AgentCommand::StopSpeaking => AgentRequest::SpeakStop,
            AgentCommand::StartListening(config) => AgentRequest::ListenStart {
                concat: config.concatenate_utterances,
                partial: false,
                stop_no_speech: config.stop_on_no_speech,
                stop_user_end: config.stop_on_user_end,
                stop_robot_start: config.stop_on_agent_speech_start,
                resume_robot_end: config.resume_on_agent_speech_end,
                end_speech_timeout: config.end_of_speech_timeout_secs,
            },
            AgentCommand::StopListening => AgentRequest::ListenStop,
            AgentCommand::AttendUser => AgentRequest::AttendUser,
            AgentCommand::StartAudioCapture {
                sample_rate,
                source,
            } => AgentRequest::AudioStart {
                sample_rate: *sample_rate,
                microphone: source.microphone(),
                speaker: source.speaker(),
            },
            AgentCommand::StopAudioCapture => AgentRequest::AudioStop,
            AgentCommand::OpenSpeechAudioSink {
                sample_rate,
                lip_sync,
            } => AgentRequest::SpeakAudioStart {
                sample_rate: *sample_rate,
                lipsync: *lip_sync,
            },
            AgentCommand::WriteSpeechAudioData(audio) => AgentRequest::SpeakAudioData {
                audio: audio.clone(),
            },
            AgentCommand::CloseSpeechAudioSink => AgentRequest::SpeakAudioEnd,
        }
    }
}

/// Event received from the agent
///
/// Only the events the bridge reacts to are modelled; everything else lands
/// in `Other`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AgentMessage {
    /// User speech started
    #[serde(rename = "response.hear.start")]
    HearStart,
    /// User speech ended
    #[serde(rename = "response.hear.end")]
    HearEnd {
        /// Recognised text
        #[serde(default)]
        text: String,
    },
    /// Robot speech started
    #[serde(rename = "response.speak.start")]
    SpeakStart {
        /// Text being spoken
        #[serde(default)]
        text: String,
    },
    /// Robot speech ended
    #[serde(rename = "response.speak.end")]
    SpeakEnd {
        /// Text that was spoken
        #[serde(default)]
        text: String,
    },
    /// Captured audio frame
    #[serde(rename = "response.audio.data")]
    AudioData {
        /// Microphone audio, if captured
        #[serde(default)]
        microphone: Option<EncodedAudio>,
    },
    /// Any other message
    #[serde(other)]
    Other,
}

impl AgentMessage {
    /// Convert into the event the bridge consumes, if it is one
    pub fn into_event(self) -> Option<AgentEvent> {
        match self {
            AgentMessage::HearStart => Some(AgentEvent::UserSpeechStart),
            AgentMessage::HearEnd { text } => Some(AgentEvent::UserSpeechEnd { text }),
            AgentMessage::SpeakStart { text } => Some(AgentEvent::AgentSpeechStart { text }),
            AgentMessage::SpeakEnd { text } => Some(AgentEvent::AgentSpeechEnd { text }),
            AgentMessage::AudioData { microphone } => microphone.map(AgentEvent::MicrophoneFrame),
            AgentMessage::Other => None,
        }
    }
}
