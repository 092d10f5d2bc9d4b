//! Text dialogue turn-taking
//!
//! - `history`: committed user/assistant turns
//! - `flush`: when streamed text becomes a speakable chunk
//! - `coordinator`: the single in-flight backend request
//! - `orchestrator`: the turn state machine, a pure `(state, event) -> effects` table
//! - `session`: the async driver wiring agent events, backend updates and effects

pub mod coordinator;
pub mod flush;
pub mod history;
pub mod orchestrator;
pub mod session;

pub use coordinator::{
    PendingTurn, RequestCoordinator, RequestOutcome, RequestSettings, RequestUpdate, ResponseMode,
};
pub use flush::{StreamBuffer, StreamFlushPolicy};
pub use history::{ConversationHistory, Role, Utterance};
pub use orchestrator::{Effect, OrchestratorSettings, TurnEvent, TurnOrchestrator, TurnPhase};
pub use session::DialogueSession;

/// Identifier of one backend request, unique within a session
pub type RequestId = u64;
