//! Conversation history
//!
//! Committed user/assistant turns in chronological order, used as model
//! context. Optionally bounded to a sliding window of the most recent
//! entries; eviction always removes a whole user/assistant pair.

use crate::error::BridgeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Speaker of a committed utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human talking to the agent
    User,
    /// The model, spoken by the agent
    Assistant,
}

impl Role {
    /// Convert the role to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One committed turn half
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    /// Who spoke
    pub role: Role,
    /// What was said
    pub text: String,
    /// When it was committed
    pub timestamp: DateTime<Utc>,
}

impl Utterance {
    /// Create an utterance stamped with the current time
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a user utterance
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    /// Create an assistant utterance
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

/// Ordered record of committed utterances
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    entries: VecDeque<Utterance>,
    capacity: Option<usize>,
}

impl ConversationHistory {
    /// Create an unbounded history
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a history that keeps at most `capacity` entries
    ///
    /// # Errors
    /// * `BridgeError::Config` - If `capacity` is zero or odd; an odd window
    ///   would split a user/assistant pair
    pub fn bounded(capacity: usize) -> Result<Self, BridgeError> {
        if capacity == 0 || capacity % 2 != 0 {
            return Err(BridgeError::Config(format!(
                "history capacity must be even and non-zero, got {}",
                capacity
            )));
        }
        Ok(Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity: Some(capacity),
        })
    }

    /// Create a history from an optional cap (None = unbounded)
    pub fn with_capacity(capacity: Option<usize>) -> Result<Self, BridgeError> {
        match capacity {
            Some(cap) => Self::bounded(cap),
            None => Ok(Self::new()),
        }
    }

    /// Append an utterance, evicting the oldest pair once over capacity
    pub fn append(&mut self, utterance: Utterance) {
        self.entries.push_back(utterance);
        if let Some(cap) = self.capacity {
            while self.entries.len() > cap {
                self.entries.pop_front();
                self.entries.pop_front();
            }
        }
    }

    /// Independent ordered copy for use as model context
    pub fn snapshot(&self) -> Vec<Utterance> {
        self.entries.iter().cloned().collect()
    }

    /// Whether the last committed utterance is a user turn with no reply yet
    pub fn awaiting_reply(&self) -> bool {
        matches!(self.entries.back(), Some(u) if u.role == Role::User)
    }

    /// Iterate over committed utterances, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Utterance> {
        self.entries.iter()
    }

    /// Number of committed utterances
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been committed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured cap, if any
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}
