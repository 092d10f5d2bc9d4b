//! Dialogue session driver
//!
//! Runs one conversation: a single task waits on the shutdown token, agent
//! events and request updates, feeds each into the `TurnOrchestrator` and
//! executes the effects it returns, in order. All dialogue state is owned by
//! this task, so no locks are involved.

use super::coordinator::{RequestCoordinator, RequestSettings, RequestUpdate, ResponseMode};
use super::flush::StreamFlushPolicy;
use super::history::ConversationHistory;
use super::orchestrator::{Effect, OrchestratorSettings, TurnEvent, TurnOrchestrator};
use crate::agent::{AgentEvent, SpeechAgent};
use crate::config::Config;
use crate::error::BridgeError;
use crate::llm::ChatBackend;
use crate::transcript::TranscriptLog;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One text dialogue between a speech agent and a chat backend
pub struct DialogueSession {
    agent: Arc<dyn SpeechAgent>,
    events: mpsc::Receiver<AgentEvent>,
    orchestrator: TurnOrchestrator,
    coordinator: RequestCoordinator,
    updates: mpsc::UnboundedReceiver<RequestUpdate>,
    transcript: Option<TranscriptLog>,
    shutdown: CancellationToken,
}

impl DialogueSession {
    /// Assemble a session from its parts
    ///
    /// # Arguments
    /// * `agent` - Command side of the speech agent
    /// * `events` - Events delivered by the agent
    /// * `orchestrator` - Turn state machine
    /// * `coordinator` - Request coordinator, with the receiver it reports on
    /// * `shutdown` - Cancelled to end the session
    pub fn new(
        agent: Arc<dyn SpeechAgent>,
        events: mpsc::Receiver<AgentEvent>,
        orchestrator: TurnOrchestrator,
        coordinator: (RequestCoordinator, mpsc::UnboundedReceiver<RequestUpdate>),
        shutdown: CancellationToken,
    ) -> Self {
        let (coordinator, updates) = coordinator;
        Self {
            agent,
            events,
            orchestrator,
            coordinator,
            updates,
            transcript: None,
            shutdown,
        }
    }

    /// Build a session from the application configuration
    ///
    /// Opens the conversation log when one is configured.
    ///
    /// # Errors
    /// * `BridgeError::Config` - If the history cap is invalid
    /// * `BridgeError::Transcript` - If the log file cannot be created
    pub fn from_config(
        config: &Config,
        agent: Arc<dyn SpeechAgent>,
        events: mpsc::Receiver<AgentEvent>,
        backend: Arc<dyn ChatBackend>,
        shutdown: CancellationToken,
    ) -> Result<Self, BridgeError> {
        let history = ConversationHistory::with_capacity(config.dialogue.history_max_messages)?;
        let orchestrator = TurnOrchestrator::new(
            OrchestratorSettings {
                opening_line: config.dialogue.opening_line.clone(),
                fallback_utterance: config.dialogue.fallback_utterance.clone(),
                listen: config.dialogue.listen.clone(),
                flush: StreamFlushPolicy::new(config.dialogue.flush_min_interval),
            },
            history,
            Instant::now(),
        );

        let settings = RequestSettings {
            model: config.llm.model.clone(),
            system_prompt: config.dialogue.system_prompt.clone(),
            opening_line: config.dialogue.opening_line.clone(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
        };
        let mode = if config.llm.streaming {
            ResponseMode::Streaming
        } else {
            ResponseMode::SingleShot
        };
        let coordinator = RequestCoordinator::new(backend, settings, mode);

        let mut session = Self::new(agent, events, orchestrator, coordinator, shutdown);
        if let Some(path) = &config.transcript_path {
            let log = TranscriptLog::create(path)?;
            info!(path = %path.display(), "Writing conversation log");
            session = session.with_transcript(log);
        }
        Ok(session)
    }

    /// Write committed utterances to `log`
    pub fn with_transcript(mut self, log: TranscriptLog) -> Self {
        self.transcript = Some(log);
        self
    }

    /// Run until shutdown or a fatal error
    ///
    /// # Returns
    /// * `Ok(ConversationHistory)` - The committed history after a requested shutdown
    /// * `Err(BridgeError::Connection)` - If the agent event stream ended
    /// * `Err(BridgeError::Agent)` - If a command could not be delivered
    pub async fn run(self) -> Result<ConversationHistory, BridgeError> {
        let Self {
            agent,
            mut events,
            mut orchestrator,
            mut coordinator,
            mut updates,
            mut transcript,
            shutdown,
        } = self;
        let mut exec = Executor {
            agent: agent.as_ref(),
            coordinator: &mut coordinator,
            transcript: &mut transcript,
        };

        info!("Dialogue session started");
        let opening = orchestrator.start_session(Instant::now());
        if let Err(e) = exec.apply(opening).await {
            error!(error = %e, "Failed to open session");
            exec.shut_down(&mut orchestrator).await;
            return Err(e);
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => TurnEvent::Shutdown,
                event = events.recv() => match event {
                    Some(event) => match TurnEvent::from_agent(event) {
                        Some(event) => event,
                        None => continue,
                    },
                    None => {
                        error!("Agent event stream closed");
                        exec.shut_down(&mut orchestrator).await;
                        return Err(BridgeError::Connection(
                            "agent event stream closed".to_string(),
                        ));
                    }
                },
                Some(update) = updates.recv() => match exec.coordinator.admit(update) {
                    Some(update) => TurnEvent::from(update),
                    None => continue,
                },
            };

            if event == TurnEvent::Shutdown {
                exec.shut_down(&mut orchestrator).await;
                break;
            }

            debug!(event = event.name(), "Handling dialogue event");
            let effects = orchestrator.handle(event, Instant::now());
            if let Err(e) = exec.apply(effects).await {
                error!(error = %e, "Dialogue session failed");
                exec.shut_down(&mut orchestrator).await;
                return Err(e);
            }
        }

        info!(
            committed = orchestrator.history().len(),
            "Dialogue session ended"
        );
        Ok(orchestrator.into_history())
    }
}

/// Executes orchestrator effects against the outside world
struct Executor<'a> {
    agent: &'a dyn SpeechAgent,
    coordinator: &'a mut RequestCoordinator,
    transcript: &'a mut Option<TranscriptLog>,
}

impl Executor<'_> {
    /// Apply effects in order, stopping at the first fatal failure
    async fn apply(&mut self, effects: Vec<Effect>) -> Result<(), BridgeError> {
        for effect in effects {
            let result = match effect {
                Effect::Agent(command) => {
                    debug!(command = command.name(), "Sending agent command");
                    self.agent.execute(&command).await.map_err(BridgeError::from)
                }
                other => self.apply_local(other),
            };
            match result {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "Effect failed; continuing"),
                Ok(()) => {}
            }
        }
        Ok(())
    }

    /// Run the shutdown transition; agent failures are logged, not retried
    async fn shut_down(&mut self, orchestrator: &mut TurnOrchestrator) {
        if self.coordinator.is_active() {
            debug!(
                request_id = ?self.coordinator.pending().map(|p| p.id),
                "Cancelling request in flight for shutdown"
            );
        }
        for effect in orchestrator.handle(TurnEvent::Shutdown, Instant::now()) {
            let result = match effect {
                Effect::Agent(command) => {
                    self.agent.execute(&command).await.map_err(BridgeError::from)
                }
                other => self.apply_local(other),
            };
            if let Err(e) = result {
                warn!(error = %e, "Shutdown step failed");
            }
        }
    }

    fn apply_local(&mut self, effect: Effect) -> Result<(), BridgeError> {
        match effect {
            Effect::CancelRequest => {
                self.coordinator.cancel();
            }
            Effect::StartRequest {
                id,
                user_text,
                context,
            } => self.coordinator.start(id, user_text, &context),
            Effect::Record(utterance) => {
                if let Some(log) = self.transcript.as_mut() {
                    log.append(&utterance)?;
                }
            }
            Effect::Agent(_) => {}
        }
        Ok(())
    }
}
