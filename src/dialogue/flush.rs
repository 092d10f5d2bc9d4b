//! Stream flush policy
//!
//! Decides when buffered streamed text becomes a speakable chunk: after a
//! minimum interval has passed, or as soon as a fragment closes a sentence.

use std::time::{Duration, Instant};

/// Characters that end a sentence
const SENTENCE_TERMINATORS: [char; 3] = ['.', '?', '!'];

/// Time/punctuation flush rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFlushPolicy {
    /// Flush once strictly more than this has elapsed since the last flush
    pub min_interval: Duration,
}

impl Default for StreamFlushPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(400),
        }
    }
}

impl StreamFlushPolicy {
    /// Create a policy with the given time floor
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }

    /// Whether `buffer` should be spoken now
    ///
    /// A blank buffer is never flushed.
    pub fn should_flush(
        &self,
        buffer: &str,
        now: Instant,
        last_flush: Instant,
        fragment_ends_sentence: bool,
    ) -> bool {
        if buffer.trim().is_empty() {
            return false;
        }
        fragment_ends_sentence || now.saturating_duration_since(last_flush) > self.min_interval
    }
}

/// Whether a streamed fragment ends with a sentence terminator
pub fn ends_sentence(fragment: &str) -> bool {
    fragment.trim_end().ends_with(&SENTENCE_TERMINATORS[..])
}

/// Text accumulated since the last flush of a streamed response
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    text: String,
    last_flush: Instant,
}

impl StreamBuffer {
    /// Empty buffer whose flush clock starts at `now`
    pub fn new(now: Instant) -> Self {
        Self {
            text: String::new(),
            last_flush: now,
        }
    }

    /// Append a fragment verbatim
    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
    }

    /// Buffered text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Time of the last flush (or creation)
    pub fn last_flush(&self) -> Instant {
        self.last_flush
    }

    /// Take the buffered text, trimmed, and restart the flush clock
    ///
    /// Returns `None` when the buffer holds only whitespace.
    pub fn flush(&mut self, now: Instant) -> Option<String> {
        let text = std::mem::take(&mut self.text);
        self.last_flush = now;
        let chunk = text.trim();
        if chunk.is_empty() {
            None
        } else {
            Some(chunk.to_string())
        }
    }

    /// Drop buffered text and restart the flush clock
    pub fn reset(&mut self, now: Instant) {
        self.text.clear();
        self.last_flush = now;
    }
}
