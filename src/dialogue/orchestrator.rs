//! Turn orchestrator
//!
//! The turn-taking state machine. `handle` is a pure transition function:
//! it takes one event, updates the dialogue state and returns the side
//! effects to execute, in order. Nothing here touches the network, so every
//! transition is testable without an agent or a backend.
//!
//! Phases: `Idle → UserSpeaking → ModelPending → Streaming → AgentSpeaking → Idle`,
//! plus the terminal `ShuttingDown`.

use super::flush::{ends_sentence, StreamBuffer, StreamFlushPolicy};
use super::history::{ConversationHistory, Role, Utterance};
use super::RequestId;
use crate::agent::{AgentCommand, AgentEvent, ListenConfig};
use crate::dialogue::coordinator::{RequestOutcome, RequestUpdate};
use crate::llm::BackendError;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Phase of the current turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// Nobody is speaking and no request is in flight
    Idle,
    /// The user is speaking
    UserSpeaking,
    /// A request is in flight and nothing has arrived yet
    ModelPending,
    /// Fragments of the reply are arriving
    Streaming,
    /// The reply is complete and being spoken
    AgentSpeaking,
    /// Terminal; every further event is dropped
    ShuttingDown,
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// The user started speaking
    UserSpeechStart,
    /// The user finished speaking
    UserSpeechEnd {
        /// Recognised text
        text: String,
    },
    /// The agent started speaking
    AgentSpeechStart {
        /// Text being spoken
        text: String,
    },
    /// The agent finished speaking
    AgentSpeechEnd {
        /// Text that was spoken
        text: String,
    },
    /// A streamed fragment of a reply
    Fragment {
        /// Originating request
        id: RequestId,
        /// Fragment text, verbatim
        text: String,
    },
    /// The backend finished a reply
    ResponseComplete {
        /// Originating request
        id: RequestId,
        /// Full reply text
        text: String,
    },
    /// The backend call failed
    RequestFailed {
        /// Originating request
        id: RequestId,
        /// What went wrong
        reason: BackendError,
    },
    /// The backend call was cancelled
    RequestCancelled {
        /// Originating request
        id: RequestId,
    },
    /// External shutdown signal
    Shutdown,
}

impl TurnEvent {
    /// Convert an agent event; microphone frames have no meaning here
    pub fn from_agent(event: AgentEvent) -> Option<Self> {
        match event {
            AgentEvent::UserSpeechStart => Some(TurnEvent::UserSpeechStart),
            AgentEvent::UserSpeechEnd { text } => Some(TurnEvent::UserSpeechEnd { text }),
            AgentEvent::AgentSpeechStart { text } => Some(TurnEvent::AgentSpeechStart { text }),
            AgentEvent::AgentSpeechEnd { text } => Some(TurnEvent::AgentSpeechEnd { text }),
            AgentEvent::MicrophoneFrame(_) => None,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::UserSpeechStart => "user_speech_start",
            TurnEvent::UserSpeechEnd { .. } => "user_speech_end",
            TurnEvent::AgentSpeechStart { .. } => "agent_speech_start",
            TurnEvent::AgentSpeechEnd { .. } => "agent_speech_end",
            TurnEvent::Fragment { .. } => "fragment",
            TurnEvent::ResponseComplete { .. } => "response_complete",
            TurnEvent::RequestFailed { .. } => "request_failed",
            TurnEvent::RequestCancelled { .. } => "request_cancelled",
            TurnEvent::Shutdown => "shutdown",
        }
    }
}

impl From<RequestUpdate> for TurnEvent {
    fn from(update: RequestUpdate) -> Self {
        match update {
            RequestUpdate::Fragment { id, text } => TurnEvent::Fragment { id, text },
            RequestUpdate::Finished { id, outcome } => match outcome {
                RequestOutcome::Completed(text) => TurnEvent::ResponseComplete { id, text },
                RequestOutcome::Cancelled => TurnEvent::RequestCancelled { id },
                RequestOutcome::Failed(reason) => TurnEvent::RequestFailed { id, reason },
            },
        }
    }
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Cancel the request in flight (idempotent)
    CancelRequest,
    /// Start a backend request
    StartRequest {
        /// Id allocated for the request
        id: RequestId,
        /// User text to answer
        user_text: String,
        /// Committed history at the time of the request
        context: Vec<Utterance>,
    },
    /// Send a command to the agent
    Agent(AgentCommand),
    /// Write an utterance to the conversation log
    Record(Utterance),
}

/// Behaviour knobs of the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Spoken when the session opens
    pub opening_line: Option<String>,
    /// Spoken when a request fails
    pub fallback_utterance: String,
    /// Listening behaviour requested at session start
    pub listen: ListenConfig,
    /// When streamed text is spoken
    pub flush: StreamFlushPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyKind {
    Opening,
    Answer,
}

/// Text handed to the agent for the current reply
#[derive(Debug)]
struct Reply {
    kind: ReplyKind,
    issued: Vec<String>,
    spoken: Vec<String>,
    complete: bool,
}

impl Reply {
    fn new(kind: ReplyKind) -> Self {
        Self {
            kind,
            issued: Vec::new(),
            spoken: Vec::new(),
            complete: false,
        }
    }

    fn outstanding(&self) -> usize {
        self.issued.len().saturating_sub(self.spoken.len())
    }

    /// Whether an agent speech event refers to the next unspoken chunk
    ///
    /// Events without text are attributed to that chunk.
    fn is_next(&self, text: &str) -> bool {
        match self.issued.get(self.spoken.len()) {
            Some(next) => {
                let text = text.trim();
                text.is_empty() || text == next
            }
            None => false,
        }
    }
}

/// Dialogue state machine
pub struct TurnOrchestrator {
    settings: OrchestratorSettings,
    phase: TurnPhase,
    history: ConversationHistory,
    next_request_id: RequestId,
    active_request: Option<RequestId>,
    pending_user_text: Option<String>,
    buffer: StreamBuffer,
    reply: Option<Reply>,
}

impl TurnOrchestrator {
    /// Create an idle orchestrator over an (empty or bounded) history
    pub fn new(settings: OrchestratorSettings, history: ConversationHistory, now: Instant) -> Self {
        Self {
            settings,
            phase: TurnPhase::Idle,
            history,
            next_request_id: 1,
            active_request: None,
            pending_user_text: None,
            buffer: StreamBuffer::new(now),
            reply: None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Committed history
    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Consume the orchestrator, keeping the history
    pub fn into_history(self) -> ConversationHistory {
        self.history
    }

    /// Request the orchestrator is waiting on, if any
    pub fn active_request(&self) -> Option<RequestId> {
        self.active_request
    }

    /// User text awaiting commitment, if any
    pub fn pending_user_text(&self) -> Option<&str> {
        self.pending_user_text.as_deref()
    }

    /// Effects that open the session: attend the user, speak the opening line, listen
    ///
    /// The opening line goes to the conversation log but not into the history.
    pub fn start_session(&mut self, now: Instant) -> Vec<Effect> {
        if self.phase == TurnPhase::ShuttingDown {
            return Vec::new();
        }

        let mut effects = vec![Effect::Agent(AgentCommand::AttendUser)];
        self.buffer.reset(now);

        if let Some(line) = self.settings.opening_line.clone() {
            let mut reply = Reply::new(ReplyKind::Opening);
            reply.complete = true;
            self.reply = Some(reply);
            effects.push(Effect::Record(Utterance::assistant(line.clone())));
            self.speak(line, &mut effects);
            self.phase = TurnPhase::AgentSpeaking;
        }

        effects.push(Effect::Agent(AgentCommand::StartListening(
            self.settings.listen.clone(),
        )));
        effects
    }

    /// Apply one event and return the resulting side effects
    pub fn handle(&mut self, event: TurnEvent, now: Instant) -> Vec<Effect> {
        if self.phase == TurnPhase::ShuttingDown {
            debug!(event = event.name(), "Dropping event after shutdown");
            return Vec::new();
        }

        let mut effects = Vec::new();
        match event {
            TurnEvent::UserSpeechStart => self.on_user_speech_start(now, &mut effects),
            TurnEvent::UserSpeechEnd { text } => self.on_user_speech_end(text, now, &mut effects),
            TurnEvent::AgentSpeechStart { text } => self.on_agent_speech_start(&text, &mut effects),
            TurnEvent::AgentSpeechEnd { text } => self.on_agent_speech_end(text, &mut effects),
            TurnEvent::Fragment { id, text } => self.on_fragment(id, &text, now, &mut effects),
            TurnEvent::ResponseComplete { id, text } => {
                self.on_response_complete(id, text, now, &mut effects)
            }
            TurnEvent::RequestFailed { id, reason } => {
                self.on_request_failed(id, &reason, now, &mut effects)
            }
            TurnEvent::RequestCancelled { id } => self.on_request_cancelled(id, now, &mut effects),
            TurnEvent::Shutdown => self.on_shutdown(&mut effects),
        }
        effects
    }

    fn on_user_speech_start(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        debug!(phase = ?self.phase, "User started speaking");
        self.interrupt(now, effects);
        self.phase = TurnPhase::UserSpeaking;
    }

    fn on_user_speech_end(&mut self, text: String, now: Instant, effects: &mut Vec<Effect>) {
        let text = text.trim().to_string();
        if text.is_empty() {
            debug!("Ignoring empty user utterance");
            if self.phase == TurnPhase::UserSpeaking {
                self.phase = TurnPhase::Idle;
            }
            return;
        }

        // No start event was seen for this utterance
        if self.phase != TurnPhase::UserSpeaking
            && (self.active_request.is_some() || self.reply.is_some())
        {
            self.interrupt(now, effects);
        }

        let id = self.next_request_id;
        self.next_request_id += 1;
        self.active_request = Some(id);
        self.pending_user_text = Some(text.clone());
        self.buffer.reset(now);

        info!(request_id = id, text_len = text.len(), "User finished speaking");
        effects.push(Effect::StartRequest {
            id,
            user_text: text,
            context: self.history.snapshot(),
        });
        self.phase = TurnPhase::ModelPending;
    }

    fn on_agent_speech_start(&mut self, text: &str, effects: &mut Vec<Effect>) {
        debug!(text_len = text.len(), "Agent started speaking");
        let answering = matches!(
            &self.reply,
            Some(reply) if reply.kind == ReplyKind::Answer && reply.is_next(text)
        );
        if answering {
            self.commit_pending_user(effects);
        }
    }

    fn on_agent_speech_end(&mut self, text: String, effects: &mut Vec<Effect>) {
        let Some(reply) = self.reply.as_mut() else {
            debug!("Agent speech ended outside a reply");
            return;
        };
        if !reply.is_next(&text) {
            debug!(text_len = text.len(), "Agent speech end does not match the current reply");
            return;
        }

        let spoken = reply.issued[reply.spoken.len()].clone();
        reply.spoken.push(spoken);
        self.finish_reply_if_done(effects);
    }

    fn on_fragment(&mut self, id: RequestId, text: &str, now: Instant, effects: &mut Vec<Effect>) {
        if !self.is_current(id) {
            return;
        }
        if !matches!(self.phase, TurnPhase::ModelPending | TurnPhase::Streaming) {
            debug!(request_id = id, phase = ?self.phase, "Fragment outside a pending request");
            return;
        }

        self.phase = TurnPhase::Streaming;
        if self.reply.is_none() {
            self.reply = Some(Reply::new(ReplyKind::Answer));
        }

        self.buffer.push(text);
        let flush = self.settings.flush.should_flush(
            self.buffer.text(),
            now,
            self.buffer.last_flush(),
            ends_sentence(text),
        );
        if flush {
            if let Some(chunk) = self.buffer.flush(now) {
                debug!(request_id = id, chunk_len = chunk.len(), "Flushing streamed text");
                self.speak(chunk, effects);
            }
        }
    }

    fn on_response_complete(
        &mut self,
        id: RequestId,
        text: String,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if !self.is_current(id) {
            return;
        }
        self.active_request = None;
        info!(request_id = id, response_len = text.len(), "Reply complete");

        let streamed = self.phase == TurnPhase::Streaming;
        if self.reply.is_none() {
            self.reply = Some(Reply::new(ReplyKind::Answer));
        }

        if streamed {
            if let Some(rest) = self.buffer.flush(now) {
                self.speak(rest, effects);
            }
        }

        // Single-shot reply, or a stream whose fragments were all blank
        let nothing_issued = self.reply.as_ref().map_or(true, |r| r.issued.is_empty());
        if nothing_issued {
            let text = text.trim();
            let line = if text.is_empty() {
                self.settings.fallback_utterance.clone()
            } else {
                text.to_string()
            };
            self.speak(line, effects);
        }

        if let Some(reply) = self.reply.as_mut() {
            reply.complete = true;
        }
        self.phase = TurnPhase::AgentSpeaking;
        self.finish_reply_if_done(effects);
    }

    fn on_request_failed(
        &mut self,
        id: RequestId,
        reason: &BackendError,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) {
        if !self.is_current(id) {
            return;
        }
        self.active_request = None;
        warn!(request_id = id, error = %reason, "Request failed; speaking fallback");

        self.buffer.reset(now);
        let reply = self.reply.get_or_insert_with(|| Reply::new(ReplyKind::Answer));
        reply.complete = true;
        self.speak(self.settings.fallback_utterance.clone(), effects);
        self.phase = TurnPhase::AgentSpeaking;
    }

    fn on_request_cancelled(&mut self, id: RequestId, now: Instant, effects: &mut Vec<Effect>) {
        if !self.is_current(id) {
            return;
        }
        debug!(request_id = id, "Request cancelled");
        self.active_request = None;
        self.abandon_reply(effects);
        self.pending_user_text = None;
        self.buffer.reset(now);
        self.phase = TurnPhase::Idle;
    }

    fn on_shutdown(&mut self, effects: &mut Vec<Effect>) {
        info!(phase = ?self.phase, "Shutting down dialogue");
        effects.push(Effect::CancelRequest);
        effects.push(Effect::Agent(AgentCommand::StopListening));
        effects.push(Effect::Agent(AgentCommand::StopSpeaking));
        self.active_request = None;
        self.pending_user_text = None;
        self.reply = None;
        self.phase = TurnPhase::ShuttingDown;
    }

    /// Cancel whatever is in flight before the user takes the turn
    fn interrupt(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        effects.push(Effect::CancelRequest);
        if let Some(id) = self.active_request.take() {
            info!(request_id = id, "Interrupted pending request");
        }

        self.abandon_reply(effects);
        self.pending_user_text = None;
        self.buffer.reset(now);
    }

    /// Drop the current reply; if its user half was committed, keep what was already said
    fn abandon_reply(&mut self, effects: &mut Vec<Effect>) {
        let Some(reply) = self.reply.take() else {
            return;
        };
        if !reply.issued.is_empty() {
            // Chunks still queued on the agent belong to the abandoned reply
            effects.push(Effect::Agent(AgentCommand::StopSpeaking));
        }
        if reply.kind == ReplyKind::Answer && self.history.awaiting_reply() {
            let said = reply.issued.join(" ");
            if !said.trim().is_empty() {
                self.commit(Role::Assistant, said, effects);
            }
        }
    }

    fn speak(&mut self, text: String, effects: &mut Vec<Effect>) {
        if let Some(reply) = self.reply.as_mut() {
            reply.issued.push(text.clone());
        }
        effects.push(Effect::Agent(AgentCommand::SpeakText(text)));
    }

    fn finish_reply_if_done(&mut self, effects: &mut Vec<Effect>) {
        let done = matches!(&self.reply, Some(reply) if reply.complete && reply.outstanding() == 0);
        if !done {
            return;
        }
        let Some(reply) = self.reply.take() else {
            return;
        };

        if reply.kind == ReplyKind::Answer {
            let said = reply.spoken.join(" ");
            if said.trim().is_empty() {
                self.pending_user_text = None;
            } else {
                // Agent start event may have been missed
                self.commit_pending_user(effects);
                if self.history.awaiting_reply() {
                    self.commit(Role::Assistant, said, effects);
                }
            }
        }

        if self.phase == TurnPhase::AgentSpeaking {
            self.phase = TurnPhase::Idle;
        }
    }

    fn commit_pending_user(&mut self, effects: &mut Vec<Effect>) {
        if let Some(text) = self.pending_user_text.take() {
            self.commit(Role::User, text, effects);
        }
    }

    fn commit(&mut self, role: Role, text: String, effects: &mut Vec<Effect>) {
        let utterance = Utterance::new(role, text);
        debug!(role = role.as_str(), text_len = utterance.text.len(), "Committing utterance");
        self.history.append(utterance.clone());
        effects.push(Effect::Record(utterance));
    }

    fn is_current(&self, id: RequestId) -> bool {
        if self.active_request == Some(id) {
            true
        } else {
            debug!(request_id = id, active = ?self.active_request, "Ignoring stale request event");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(opening_line: Option<&str>) -> OrchestratorSettings {
        OrchestratorSettings {
            opening_line: opening_line.map(str::to_string),
            fallback_utterance: "Sorry, I had trouble thinking.".to_string(),
            listen: ListenConfig::default(),
            flush: StreamFlushPolicy::new(Duration::from_millis(400)),
        }
    }

    fn spoken(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Agent(AgentCommand::SpeakText(text)) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_session_effects() {
        let t0 = Instant::now();
        let mut orchestrator =
            TurnOrchestrator::new(settings(Some("Hello!")), ConversationHistory::new(), t0);
        let effects = orchestrator.start_session(t0);

        assert_eq!(effects[0], Effect::Agent(AgentCommand::AttendUser));
        assert!(matches!(&effects[1], Effect::Record(u) if u.text == "Hello!"));
        assert_eq!(effects[2], Effect::Agent(AgentCommand::SpeakText("Hello!".to_string())));
        assert!(matches!(effects[3], Effect::Agent(AgentCommand::StartListening(_))));
        assert_eq!(orchestrator.phase(), TurnPhase::AgentSpeaking);

        let effects = orchestrator.handle(
            TurnEvent::AgentSpeechEnd {
                text: "Hello!".to_string(),
            },
            t0,
        );
        assert!(effects.is_empty());
        assert!(orchestrator.history().is_empty());
        assert_eq!(orchestrator.phase(), TurnPhase::Idle);
    }

    #[test]
    fn test_blank_utterance_starts_nothing() {
        let t0 = Instant::now();
        let mut orchestrator = TurnOrchestrator::new(settings(None), ConversationHistory::new(), t0);
        orchestrator.handle(TurnEvent::UserSpeechStart, t0);
        let effects = orchestrator.handle(
            TurnEvent::UserSpeechEnd {
                text: "  ".to_string(),
            },
            t0,
        );
        assert!(effects.is_empty());
        assert_eq!(orchestrator.phase(), TurnPhase::Idle);
        assert!(orchestrator.active_request().is_none());
    }

    #[test]
    fn test_single_shot_turn_commits_pair() {
        let t0 = Instant::now();
        let mut orchestrator = TurnOrchestrator::new(settings(None), ConversationHistory::new(), t0);
        orchestrator.handle(TurnEvent::UserSpeechStart, t0);
        let effects = orchestrator.handle(
            TurnEvent::UserSpeechEnd {
                text: "Hi robot".to_string(),
            },
            t0,
        );
        let id = match &effects[..] {
            [Effect::StartRequest { id, user_text, context }] => {
                assert_eq!(user_text, "Hi robot");
                assert!(context.is_empty());
                *id
            }
            other => panic!("unexpected effects {:?}", other),
        };
        assert_eq!(orchestrator.phase(), TurnPhase::ModelPending);

        let effects = orchestrator.handle(
            TurnEvent::ResponseComplete {
                id,
                text: "Hello human.".to_string(),
            },
            t0,
        );
        assert_eq!(spoken(&effects), vec!["Hello human."]);
        assert_eq!(orchestrator.phase(), TurnPhase::AgentSpeaking);

        orchestrator.handle(
            TurnEvent::AgentSpeechStart {
                text: "Hello human.".to_string(),
            },
            t0,
        );
        assert_eq!(orchestrator.history().len(), 1);

        let effects = orchestrator.handle(
            TurnEvent::AgentSpeechEnd {
                text: "Hello human.".to_string(),
            },
            t0,
        );
        assert!(matches!(&effects[..], [Effect::Record(u)] if u.role == Role::Assistant));
        let roles: Vec<Role> = orchestrator.history().iter().map(|u| u.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(orchestrator.phase(), TurnPhase::Idle);
    }

    #[test]
    fn test_time_floor_flushes_partial_text() {
        let t0 = Instant::now();
        let mut orchestrator = TurnOrchestrator::new(settings(None), ConversationHistory::new(), t0);
        orchestrator.handle(
            TurnEvent::UserSpeechEnd {
                text: "Tell me a story".to_string(),
            },
            t0,
        );

        let effects = orchestrator.handle(
            TurnEvent::Fragment {
                id: 1,
                text: "Once upon".to_string(),
            },
            t0 + Duration::from_millis(100),
        );
        assert!(spoken(&effects).is_empty());

        let effects = orchestrator.handle(
            TurnEvent::Fragment {
                id: 1,
                text: " a time".to_string(),
            },
            t0 + Duration::from_millis(500),
        );
        assert_eq!(spoken(&effects), vec!["Once upon a time"]);
        assert_eq!(orchestrator.phase(), TurnPhase::Streaming);
    }

    #[test]
    fn test_failure_speaks_fallback() {
        let t0 = Instant::now();
        let mut orchestrator = TurnOrchestrator::new(settings(None), ConversationHistory::new(), t0);
        orchestrator.handle(
            TurnEvent::UserSpeechEnd {
                text: "Hello?".to_string(),
            },
            t0,
        );
        let effects = orchestrator.handle(
            TurnEvent::RequestFailed {
                id: 1,
                reason: BackendError::Timeout(30),
            },
            t0,
        );
        assert_eq!(spoken(&effects), vec!["Sorry, I had trouble thinking."]);
        assert_eq!(orchestrator.phase(), TurnPhase::AgentSpeaking);
    }

    #[test]
    fn test_cancelled_event_returns_to_idle_silently() {
        let t0 = Instant::now();
        let mut orchestrator = TurnOrchestrator::new(settings(None), ConversationHistory::new(), t0);
        orchestrator.handle(
            TurnEvent::UserSpeechEnd {
                text: "Hello?".to_string(),
            },
            t0,
        );
        let effects = orchestrator.handle(TurnEvent::RequestCancelled { id: 1 }, t0);
        assert!(effects.is_empty());
        assert_eq!(orchestrator.phase(), TurnPhase::Idle);
        assert!(orchestrator.pending_user_text().is_none());
    }

    #[test]
    fn test_request_update_conversion() {
        let event: TurnEvent = RequestUpdate::Finished {
            id: 4,
            outcome: RequestOutcome::Failed(BackendError::Timeout(3)),
        }
        .into();
        assert_eq!(event.name(), "request_failed");
        assert!(TurnEvent::from_agent(AgentEvent::MicrophoneFrame(
            crate::agent::EncodedAudio::new("AAAA")
        ))
        .is_none());
    }
}
