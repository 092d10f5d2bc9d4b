//! Audio relay
//!
//! Turn-gated duplex pipe between the speech agent and a realtime backend.
//! Like the text orchestrator it is a pure state machine: `handle` maps one
//! input to the commands and backend events to send, in order.
//!
//! Microphone frames reach the backend only while `ListeningForUser`;
//! anything captured in another state is dropped, never replayed.

use super::events::{ClientEvent, ServerEvent, SessionSettings};
use crate::agent::{AgentCommand, AudioSource, EncodedAudio};
use tracing::{debug, info, warn};

/// Whose turn it is in the voice session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Connected, session not yet configured
    Idle,
    /// Capturing the user; microphone frames are forwarded
    ListeningForUser {
        /// Whether the previous response's audio sink is still open
        sink_open: bool,
    },
    /// The model owns the turn but no audio has arrived yet
    AwaitingModelTurn,
    /// Response audio is being played
    AgentSpeaking {
        /// Whether the agent's audio sink is currently open
        sink_open: bool,
    },
    /// Terminal
    ShuttingDown,
}

/// Input to the relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayInput {
    /// An event from the backend socket
    Backend(ServerEvent),
    /// The agent finished speaking
    AgentSpeechEnd,
    /// A captured microphone frame
    MicrophoneFrame(EncodedAudio),
    /// The socket or the agent connection closed
    Closed {
        /// Why
        reason: String,
    },
    /// The backend sent something undecodable
    ProtocolViolation {
        /// What was wrong
        detail: String,
    },
    /// External shutdown signal
    Shutdown,
}

/// Output of the relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEffect {
    /// Command the agent
    Agent(AgentCommand),
    /// Send an event to the backend
    Backend(ClientEvent),
    /// End the session
    Terminate,
}

/// Relay settings
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    /// Instructions sent in `session.update`
    pub instructions: String,
    /// Sample rate of capture and playback
    pub sample_rate: u32,
    /// Drive lip movement from response audio
    pub lip_sync: bool,
}

/// Turn-gating state machine for the voice session
pub struct AudioRelay {
    settings: RelaySettings,
    state: TurnState,
    dropped_frames: u64,
}

impl AudioRelay {
    /// Create a relay in the `Idle` state
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            settings,
            state: TurnState::Idle,
            dropped_frames: 0,
        }
    }

    /// Current turn state
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Microphone frames dropped outside the user's turn
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Apply one input and return the effects to execute
    pub fn handle(&mut self, input: RelayInput) -> Vec<RelayEffect> {
        if self.state == TurnState::ShuttingDown {
            return Vec::new();
        }

        match input {
            RelayInput::Backend(event) => self.on_backend_event(event),
            RelayInput::AgentSpeechEnd => self.on_agent_speech_end(),
            RelayInput::MicrophoneFrame(audio) => self.on_microphone_frame(audio),
            RelayInput::Closed { reason } => {
                warn!(reason = %reason, "Voice session connection closed");
                self.terminate()
            }
            RelayInput::ProtocolViolation { detail } => {
                warn!(detail = %detail, "Voice session protocol error");
                self.terminate()
            }
            RelayInput::Shutdown => {
                info!("Shutting down voice session");
                self.terminate()
            }
        }
    }

    fn on_backend_event(&mut self, event: ServerEvent) -> Vec<RelayEffect> {
        match event {
            ServerEvent::SessionCreated => {
                if self.state != TurnState::Idle {
                    debug!(state = ?self.state, "Ignoring repeated session.created");
                    return Vec::new();
                }
                info!("Realtime session created");
                self.state = TurnState::AwaitingModelTurn;
                vec![
                    RelayEffect::Backend(ClientEvent::SessionUpdate {
                        session: SessionSettings {
                            instructions: self.settings.instructions.clone(),
                        },
                    }),
                    RelayEffect::Agent(AgentCommand::AttendUser),
                    RelayEffect::Backend(ClientEvent::ResponseCreate),
                ]
            }
            ServerEvent::ResponseCreated => {
                let mut effects = Vec::new();
                if self.sink_open() {
                    effects.push(RelayEffect::Agent(AgentCommand::CloseSpeechAudioSink));
                }
                effects.push(RelayEffect::Agent(AgentCommand::StopAudioCapture));
                self.state = TurnState::AwaitingModelTurn;
                effects
            }
            ServerEvent::AudioDelta { delta } => {
                let mut effects = Vec::new();
                match self.state {
                    // The agent may report speech end while the response is still streaming
                    TurnState::AgentSpeaking { sink_open: true }
                    | TurnState::ListeningForUser { sink_open: true } => {}
                    state => {
                        if let TurnState::ListeningForUser { .. } = state {
                            // Response started without response.created
                            effects.push(RelayEffect::Agent(AgentCommand::StopAudioCapture));
                        }
                        debug!(sample_rate = self.settings.sample_rate, "Opening speech audio sink");
                        effects.push(RelayEffect::Agent(AgentCommand::OpenSpeechAudioSink {
                            sample_rate: self.settings.sample_rate,
                            lip_sync: self.settings.lip_sync,
                        }));
                        self.state = TurnState::AgentSpeaking { sink_open: true };
                    }
                }
                effects.push(RelayEffect::Agent(AgentCommand::WriteSpeechAudioData(delta)));
                effects
            }
            ServerEvent::AudioDone => match self.state {
                TurnState::AgentSpeaking { sink_open: true } => {
                    self.state = TurnState::AgentSpeaking { sink_open: false };
                    vec![RelayEffect::Agent(AgentCommand::CloseSpeechAudioSink)]
                }
                TurnState::ListeningForUser { sink_open: true } => {
                    self.state = TurnState::ListeningForUser { sink_open: false };
                    vec![RelayEffect::Agent(AgentCommand::CloseSpeechAudioSink)]
                }
                state => {
                    debug!(state = ?state, "Audio done without an open sink");
                    Vec::new()
                }
            },
            ServerEvent::Error { error } => {
                warn!(error = %error, "Realtime backend reported an error");
                Vec::new()
            }
            ServerEvent::Other => Vec::new(),
        }
    }

    fn on_agent_speech_end(&mut self) -> Vec<RelayEffect> {
        let sink_open = match self.state {
            TurnState::ListeningForUser { .. } => {
                debug!("Agent speech ended while already listening");
                return Vec::new();
            }
            TurnState::AgentSpeaking { sink_open } => sink_open,
            _ => false,
        };
        debug!(sink_open, "Agent finished speaking; reopening microphone");
        self.state = TurnState::ListeningForUser { sink_open };
        vec![RelayEffect::Agent(AgentCommand::StartAudioCapture {
            sample_rate: self.settings.sample_rate,
            source: AudioSource::Microphone,
        })]
    }

    fn on_microphone_frame(&mut self, audio: EncodedAudio) -> Vec<RelayEffect> {
        if let TurnState::ListeningForUser { .. } = self.state {
            vec![RelayEffect::Backend(ClientEvent::InputAudioAppend { audio })]
        } else {
            self.dropped_frames += 1;
            Vec::new()
        }
    }

    fn sink_open(&self) -> bool {
        matches!(
            self.state,
            TurnState::AgentSpeaking { sink_open: true }
                | TurnState::ListeningForUser { sink_open: true }
        )
    }

    fn terminate(&mut self) -> Vec<RelayEffect> {
        self.state = TurnState::ShuttingDown;
        vec![
            RelayEffect::Agent(AgentCommand::StopAudioCapture),
            RelayEffect::Agent(AgentCommand::StopSpeaking),
            RelayEffect::Terminate,
        ]
    }
}
