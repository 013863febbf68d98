//! Short-lived on-screen chat history

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Most lines kept on screen at once
pub const CHAT_LINES: usize = 7;
pub const CHAT_EXPIRE: Duration = Duration::from_millis(18_000);

/// A formatted line and when it arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub text: String,
    pub received: Instant,
}

/// Holds at most [`CHAT_LINES`] lines; the oldest line is evicted first and
/// every line disappears [`CHAT_EXPIRE`] after it arrived.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    lines: VecDeque<ChatLine>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a line, evicting the oldest when the log is full
    pub fn push(&mut self, text: impl Into<String>, now: Instant) {
        if self.lines.len() == CHAT_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(ChatLine {
            text: text.into(),
            received: now,
        });
    }

    /// Drops every line older than [`CHAT_EXPIRE`]
    pub fn expire(&mut self, now: Instant) {
        while let Some(line) = self.lines.front() {
            if now.saturating_duration_since(line.received) < CHAT_EXPIRE {
                break;
            }
            self.lines.pop_front();
        }
    }

    /// Current lines, oldest first
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|line| line.text.as_str())
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
