//! Request coordinator
//!
//! Owns the single outstanding backend request. Each request runs as a
//! spawned task guarded by a `CancellationToken`; its fragments and final
//! outcome come back over a channel tagged with the request id. `admit`
//! is the gate: anything from a request that was cancelled or superseded
//! is discarded there, so a completion racing with `cancel()` never reaches
//! the orchestrator.

use super::history::Utterance;
use super::RequestId;
use crate::error::BridgeError;
use crate::llm::{BackendError, ChatBackend, ChatMessage, ChatRequest, ChatRole};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the backend is asked to answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// One complete reply per request
    SingleShot,
    /// Fragments as they are generated, then the complete reply
    Streaming,
}

/// Fixed parts of every request
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSettings {
    /// Model name
    pub model: String,
    /// Instructions placed first in the context
    pub system_prompt: String,
    /// Session opening line, placed after the system prompt as assistant text
    pub opening_line: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens
    pub max_tokens: Option<u32>,
}

/// Terminal result of a request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// The backend produced a reply
    Completed(String),
    /// The request was cancelled before it finished
    Cancelled,
    /// The backend failed
    Failed(BackendError),
}

impl RequestOutcome {
    /// Map the outcome onto the session error taxonomy
    pub fn into_result(self) -> Result<String, BridgeError> {
        match self {
            RequestOutcome::Completed(text) => Ok(text),
            RequestOutcome::Cancelled => Err(BridgeError::Cancelled),
            RequestOutcome::Failed(e) => Err(BridgeError::RequestFailed(e)),
        }
    }
}

/// Message from a request task
#[derive(Debug, Clone, PartialEq)]
pub enum RequestUpdate {
    /// A streamed text fragment
    Fragment {
        /// Originating request
        id: RequestId,
        /// Fragment text, verbatim
        text: String,
    },
    /// The request ended; always the last update for `id`
    Finished {
        /// Originating request
        id: RequestId,
        /// How it ended
        outcome: RequestOutcome,
    },
}

impl RequestUpdate {
    /// Originating request
    pub fn id(&self) -> RequestId {
        match self {
            RequestUpdate::Fragment { id, .. } | RequestUpdate::Finished { id, .. } => *id,
        }
    }
}

/// The one request currently in flight
pub struct PendingTurn {
    /// Request id
    pub id: RequestId,
    /// User text the request answers
    pub user_text: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PendingTurn {
    /// Whether cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn cancel(self) {
        self.cancel.cancel();
        // The task observes the token at its next await; dropping the handle detaches it
        drop(self.handle);
    }
}

/// Starts, tracks and cancels backend requests
pub struct RequestCoordinator {
    backend: Arc<dyn ChatBackend>,
    settings: RequestSettings,
    mode: ResponseMode,
    pending: Option<PendingTurn>,
    updates: mpsc::UnboundedSender<RequestUpdate>,
}

impl RequestCoordinator {
    /// Create a coordinator and the channel its request tasks report on
    ///
    /// Every update read from the receiver must pass through [`admit`](Self::admit).
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        settings: RequestSettings,
        mode: ResponseMode,
    ) -> (Self, mpsc::UnboundedReceiver<RequestUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        (
            Self {
                backend,
                settings,
                mode,
                pending: None,
                updates,
            },
            rx,
        )
    }

    /// Start a request answering `user_text` with `history` as context
    ///
    /// A request still in flight is cancelled first.
    pub fn start(&mut self, id: RequestId, user_text: String, history: &[Utterance]) {
        if let Some(previous) = self.pending.take() {
            warn!(
                request_id = previous.id,
                new_request_id = id,
                "Starting a request while another is in flight; cancelling it"
            );
            previous.cancel();
        }

        let request = build_request(&self.settings, history, &user_text);
        let token = CancellationToken::new();

        info!(
            request_id = id,
            backend = self.backend.name(),
            mode = ?self.mode,
            context_len = request.messages.len(),
            "Starting backend request"
        );

        let handle = tokio::spawn(run_request(
            Arc::clone(&self.backend),
            request,
            self.mode,
            id,
            token.clone(),
            self.updates.clone(),
        ));

        self.pending = Some(PendingTurn {
            id,
            user_text,
            cancel: token,
            handle,
        });
    }

    /// Cancel the request in flight, if any
    ///
    /// Idempotent. Once this returns, no update from the cancelled request
    /// passes [`admit`](Self::admit).
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                info!(request_id = pending.id, "Cancelling backend request");
                pending.cancel();
                true
            }
            None => false,
        }
    }

    /// Filter an update from the channel
    ///
    /// Returns `None` for updates of cancelled or superseded requests. A
    /// `Finished` update releases the pending slot.
    pub fn admit(&mut self, update: RequestUpdate) -> Option<RequestUpdate> {
        let id = update.id();
        let current = matches!(&self.pending, Some(p) if p.id == id && !p.is_cancelled());
        if !current {
            debug!(request_id = id, "Discarding update from inactive request");
            return None;
        }
        if matches!(update, RequestUpdate::Finished { .. }) {
            self.pending = None;
        }
        Some(update)
    }

    /// The request in flight, if any
    pub fn pending(&self) -> Option<&PendingTurn> {
        self.pending.as_ref()
    }

    /// Whether a request is in flight
    pub fn is_active(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for RequestCoordinator {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }
}

/// Assemble the model context: system prompt, opening line, history, new user text
pub fn build_request(
    settings: &RequestSettings,
    history: &[Utterance],
    user_text: &str,
) -> ChatRequest {
    let mut messages = Vec::with_capacity(history.len() + 3);
    if !settings.system_prompt.trim().is_empty() {
        messages.push(ChatMessage::new(ChatRole::System, settings.system_prompt.clone()));
    }
    if let Some(line) = &settings.opening_line {
        messages.push(ChatMessage::new(ChatRole::Assistant, line.clone()));
    }
    messages.extend(history.iter().map(ChatMessage::from));
    messages.push(ChatMessage::new(ChatRole::User, user_text));

    ChatRequest {
        model: settings.model.clone(),
        messages,
        temperature: settings.temperature,
        max_tokens: settings.max_tokens,
    }
}

async fn run_request(
    backend: Arc<dyn ChatBackend>,
    request: ChatRequest,
    mode: ResponseMode,
    id: RequestId,
    cancel: CancellationToken,
    updates: mpsc::UnboundedSender<RequestUpdate>,
) {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => RequestOutcome::Cancelled,
        outcome = call_backend(backend.as_ref(), &request, mode, id, &updates) => outcome,
    };

    match outcome.clone().into_result() {
        Ok(text) => debug!(request_id = id, response_len = text.len(), "Backend request completed"),
        Err(BridgeError::Cancelled) => debug!(request_id = id, "Backend request aborted"),
        Err(e) => warn!(request_id = id, error = %e, "Backend request failed"),
    }

    // The receiver is gone only when the session has ended
    let _ = updates.send(RequestUpdate::Finished { id, outcome });
}

async fn call_backend(
    backend: &dyn ChatBackend,
    request: &ChatRequest,
    mode: ResponseMode,
    id: RequestId,
    updates: &mpsc::UnboundedSender<RequestUpdate>,
) -> RequestOutcome {
    match mode {
        ResponseMode::SingleShot => match backend.chat(request).await {
            Ok(text) if !text.trim().is_empty() => RequestOutcome::Completed(text),
            Ok(_) => RequestOutcome::Failed(BackendError::Malformed("empty reply".to_string())),
            Err(e) => RequestOutcome::Failed(e),
        },
        ResponseMode::Streaming => {
            let mut stream = match backend.chat_stream(request).await {
                Ok(stream) => stream,
                Err(e) => return RequestOutcome::Failed(e),
            };

            let mut full = String::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(text) => {
                        full.push_str(&text);
                        let _ = updates.send(RequestUpdate::Fragment { id, text });
                    }
                    Err(e) => return RequestOutcome::Failed(e),
                }
            }

            let full = full.trim().to_string();
            if full.is_empty() {
                RequestOutcome::Failed(BackendError::Malformed("empty streamed reply".to_string()))
            } else {
                RequestOutcome::Completed(full)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FragmentStream;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Backend that answers only once a permit is released
    struct GatedBackend {
        gate: Arc<Semaphore>,
        reply: String,
    }

    #[async_trait]
    impl ChatBackend for GatedBackend {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<String, BackendError> {
            let _permit = self.gate.acquire().await.unwrap();
            Ok(self.reply.clone())
        }

        async fn chat_stream(
            &self,
            _request: &ChatRequest,
        ) -> Result<FragmentStream, BackendError> {
            let _permit = self.gate.acquire().await.unwrap();
            let fragments: Vec<Result<String, BackendError>> = self
                .reply
                .split_inclusive(' ')
                .map(|s| Ok(s.to_string()))
                .collect();
            Ok(Box::pin(futures_util::stream::iter(fragments)))
        }
    }

    fn settings() -> RequestSettings {
        RequestSettings {
            model: "test-model".to_string(),
            system_prompt: "Be kind.".to_string(),
            opening_line: Some("Hello!".to_string()),
            temperature: None,
            max_tokens: None,
        }
    }

    fn coordinator(mode: ResponseMode, reply: &str) -> (
        RequestCoordinator,
        mpsc::UnboundedReceiver<RequestUpdate>,
        Arc<Semaphore>,
    ) {
        let gate = Arc::new(Semaphore::new(0));
        let backend = Arc::new(GatedBackend {
            gate: Arc::clone(&gate),
            reply: reply.to_string(),
        });
        let (coordinator, rx) = RequestCoordinator::new(backend, settings(), mode);
        (coordinator, rx, gate)
    }

    #[test]
    fn test_build_request_order() {
        let history = vec![Utterance::user("hi"), Utterance::assistant("hey")];
        let request = build_request(&settings(), &history, "what now?");
        let roles: Vec<ChatRole> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                ChatRole::System,
                ChatRole::Assistant,
                ChatRole::User,
                ChatRole::Assistant,
                ChatRole::User
            ]
        );
        assert_eq!(request.messages[1].content, "Hello!");
        assert_eq!(request.messages[4].content, "what now?");
        assert_eq!(request.model, "test-model");
    }

    #[tokio::test]
    async fn test_single_shot_completes() {
        let (mut coordinator, mut rx, gate) = coordinator(ResponseMode::SingleShot, "Sure.");
        coordinator.start(1, "hello".to_string(), &[]);
        assert_eq!(coordinator.pending().map(|p| p.user_text.as_str()), Some("hello"));
        gate.add_permits(1);

        let update = coordinator.admit(rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            update,
            RequestUpdate::Finished {
                id: 1,
                outcome: RequestOutcome::Completed("Sure.".to_string())
            }
        );
        assert!(!coordinator.is_active());
    }

    #[tokio::test]
    async fn test_streaming_sends_fragments_then_finish() {
        let (mut coordinator, mut rx, gate) = coordinator(ResponseMode::Streaming, "It is sunny.");
        coordinator.start(3, "weather?".to_string(), &[]);
        gate.add_permits(1);

        let mut fragments = Vec::new();
        loop {
            match coordinator.admit(rx.recv().await.unwrap()) {
                Some(RequestUpdate::Fragment { text, .. }) => fragments.push(text),
                Some(RequestUpdate::Finished { outcome, .. }) => {
                    assert_eq!(outcome, RequestOutcome::Completed("It is sunny.".to_string()));
                    break;
                }
                None => panic!("update unexpectedly discarded"),
            }
        }
        assert_eq!(fragments, vec!["It ", "is ", "sunny."]);
    }

    #[tokio::test]
    async fn test_cancel_suppresses_late_completion() {
        let (mut coordinator, mut rx, gate) = coordinator(ResponseMode::SingleShot, "Too late.");
        coordinator.start(1, "hello".to_string(), &[]);

        assert!(coordinator.cancel());
        assert!(!coordinator.cancel());
        gate.add_permits(1);

        let update = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.id(), 1);
        assert!(coordinator.admit(update).is_none());
    }

    #[tokio::test]
    async fn test_start_supersedes_previous() {
        let (mut coordinator, mut rx, gate) = coordinator(ResponseMode::SingleShot, "Answer.");
        coordinator.start(1, "first".to_string(), &[]);
        coordinator.start(2, "second".to_string(), &[]);
        assert_eq!(coordinator.pending().map(|p| p.id), Some(2));
        gate.add_permits(1);

        let mut admitted = Vec::new();
        while admitted.is_empty() {
            let update = rx.recv().await.unwrap();
            if let Some(update) = coordinator.admit(update) {
                admitted.push(update);
            }
        }
        assert_eq!(admitted[0].id(), 2);
    }

    #[test]
    fn test_outcome_into_result() {
        assert_eq!(
            RequestOutcome::Completed("ok".to_string()).into_result().unwrap(),
            "ok"
        );
        assert!(matches!(
            RequestOutcome::Cancelled.into_result(),
            Err(BridgeError::Cancelled)
        ));
        assert!(matches!(
            RequestOutcome::Failed(BackendError::Timeout(30)).into_result(),
            Err(BridgeError::RequestFailed(_))
        ));
    }
}
