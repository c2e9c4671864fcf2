//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// Sender recorded for text typed by the connected client
pub const SENDER_USER: &str = "user";

/// Sender recorded for text produced by the AI engine
pub const SENDER_ASSISTANT: &str = "assistant";

/// Role attached to outbound frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Assistant,
}

/// A stored chat message.
///
/// Messages of one conversation share a leading id prefix; there is no
/// separate conversation index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub sender: String,
    /// Wall-clock seconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ChatMessage {
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            sender: sender.into(),
            timestamp,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_from_user(&self) -> bool {
        self.sender == SENDER_USER
    }
}
