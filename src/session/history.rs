//! Conversation record — roles, turns, and the transcript.
//!
//! Turns are immutable once appended, with one exception: the in-flight
//! assistant turn grows by streaming deltas until the session reaches a
//! terminal state.  Only the session orchestrator mutates the transcript.

use chrono::{DateTime, Utc};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Wire role string as the engine expects it.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of the conversation.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    /// Ordered text segments; joined for display and for the engine prompt.
    pub text_parts: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text_parts: vec![text.into()],
            timestamp: Utc::now(),
        }
    }

    /// Empty assistant turn, ready to receive streamed deltas.
    pub fn assistant_placeholder() -> Self {
        Self {
            role: Role::Assistant,
            text_parts: vec![String::new()],
            timestamp: Utc::now(),
        }
    }

    /// All segments joined into one string.
    pub fn text(&self) -> String {
        self.text_parts.concat()
    }
}

/// The transcript.
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    turns: Vec<ChatTurn>,
}

impl ChatHistory {
    pub fn push(&mut self, turn: ChatTurn) {
        self.turns.push(turn);
    }

    /// Append a streamed delta to the in-flight assistant turn.
    /// No-op unless the last turn is an assistant turn.
    pub fn append_delta(&mut self, delta: &str) {
        if let Some(turn) = self.turns.last_mut() {
            if turn.role == Role::Assistant {
                if let Some(part) = turn.text_parts.last_mut() {
                    part.push_str(delta);
                }
            }
        }
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    /// Text of the most recent user turn, if any.
    pub fn last_user_text(&self) -> Option<String> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(ChatTurn::text)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}
