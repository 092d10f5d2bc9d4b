//! Realtime voice variant
//!
//! Replaces the text round-trip with a continuous audio session: microphone
//! frames go to the backend socket during the user's turn and response
//! audio is played through the agent's speech audio sink.

pub mod events;
pub mod relay;
pub mod session;
pub mod socket;

pub use events::{ClientEvent, ServerEvent};
pub use relay::{AudioRelay, RelayEffect, RelayInput, RelaySettings, TurnState};
pub use session::VoiceSession;
pub use socket::{RealtimeTransport, WebSocketTransport};
