//! Voice session driver
//!
//! Runs the realtime audio relay: one task waits on the shutdown token, the
//! backend socket and agent events, feeds each into the `AudioRelay` and
//! executes the effects it returns. Audio deltas are written in arrival order
//! because a single task handles them.

use super::relay::{AudioRelay, RelayEffect, RelayInput, RelaySettings};
use super::socket::RealtimeTransport;
use crate::agent::{AgentEvent, SpeechAgent};
use crate::config::RealtimeConfig;
use crate::error::BridgeError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One realtime voice conversation
pub struct VoiceSession<T: RealtimeTransport> {
    agent: Arc<dyn SpeechAgent>,
    events: mpsc::Receiver<AgentEvent>,
    transport: T,
    relay: AudioRelay,
    shutdown: CancellationToken,
}

impl<T: RealtimeTransport> VoiceSession<T> {
    /// Assemble a session
    pub fn new(
        config: &RealtimeConfig,
        agent: Arc<dyn SpeechAgent>,
        events: mpsc::Receiver<AgentEvent>,
        transport: T,
        shutdown: CancellationToken,
    ) -> Self {
        let relay = AudioRelay::new(RelaySettings {
            instructions: config.instructions.clone(),
            sample_rate: config.sample_rate,
            lip_sync: config.lip_sync,
        });
        Self {
            agent,
            events,
            transport,
            relay,
            shutdown,
        }
    }

    /// Run until shutdown, socket closure or a protocol error
    ///
    /// # Returns
    /// * `Ok(())` - After a requested shutdown
    /// * `Err(BridgeError::Connection)` - If the socket or the agent connection closed
    /// * `Err(BridgeError::Protocol)` - If the backend sent an undecodable event
    /// * `Err(BridgeError::Agent)` - If a command could not be delivered
    pub async fn run(self) -> Result<(), BridgeError> {
        let Self {
            agent,
            mut events,
            mut transport,
            mut relay,
            shutdown,
        } = self;

        info!("Voice session started");
        loop {
            let (input, failure) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => (RelayInput::Shutdown, None),
                event = transport.next_event() => match event {
                    Some(Ok(event)) => {
                        debug!(event = event.name(), "Realtime event");
                        (RelayInput::Backend(event), None)
                    }
                    Some(Err(BridgeError::Protocol(detail))) => (
                        RelayInput::ProtocolViolation { detail: detail.clone() },
                        Some(BridgeError::Protocol(detail)),
                    ),
                    Some(Err(e)) => (RelayInput::Closed { reason: e.to_string() }, Some(e)),
                    None => (
                        RelayInput::Closed { reason: "realtime socket closed".to_string() },
                        Some(BridgeError::Connection("realtime socket closed".to_string())),
                    ),
                },
                event = events.recv() => match event {
                    Some(AgentEvent::AgentSpeechEnd { .. }) => (RelayInput::AgentSpeechEnd, None),
                    Some(AgentEvent::MicrophoneFrame(audio)) => (RelayInput::MicrophoneFrame(audio), None),
                    Some(_) => continue,
                    None => (
                        RelayInput::Closed { reason: "agent event stream closed".to_string() },
                        Some(BridgeError::Connection("agent event stream closed".to_string())),
                    ),
                },
            };

            let effects = relay.handle(input);
            let terminating = effects.contains(&RelayEffect::Terminate);

            for effect in effects {
                let result = match effect {
                    RelayEffect::Agent(command) => agent
                        .execute(&command)
                        .await
                        .map_err(BridgeError::from),
                    RelayEffect::Backend(event) => transport.send(&event).await,
                    RelayEffect::Terminate => {
                        transport.close().await;
                        return match failure {
                            Some(e) => {
                                error!(error = %e, "Voice session ended with an error");
                                Err(e)
                            }
                            None => {
                                info!(dropped_frames = relay.dropped_frames(), "Voice session ended");
                                Ok(())
                            }
                        };
                    }
                };

                if let Err(e) = result {
                    if terminating {
                        warn!(error = %e, "Shutdown step failed");
                        continue;
                    }
                    error!(error = %e, "Voice session failed");
                    for step in relay.handle(RelayInput::Closed {
                        reason: e.to_string(),
                    }) {
                        if let RelayEffect::Agent(command) = step {
                            if let Err(stop_error) = agent.execute(&command).await {
                                warn!(error = %stop_error, "Shutdown step failed");
                            }
                        }
                    }
                    transport.close().await;
                    return Err(e);
                }
            }
        }
    }
}
