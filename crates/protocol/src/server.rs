//! Server → Client frames

use serde::{Deserialize, Serialize};

use crate::types::Role;

/// One outbound WebSocket frame per chat turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        role: Role,
        content: String,
        session_id: String,
    },
    Error {
        role: Role,
        content: String,
        session_id: String,
    },
}

impl ServerFrame {
    pub fn message(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        ServerFrame::Message {
            role: Role::Assistant,
            content: content.into(),
            session_id: session_id.into(),
        }
    }

    pub fn error(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        ServerFrame::Error {
            role: Role::Assistant,
            content: content.into(),
            session_id: session_id.into(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ServerFrame::Message { content, .. } | ServerFrame::Error { content, .. } => content,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            ServerFrame::Message { session_id, .. } | ServerFrame::Error { session_id, .. } => {
                session_id
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ServerFrame::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_frame_wire_shape() {
        let frame = ServerFrame::message("1700000000-1", "hi there");
        let value: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "message",
                "role": "assistant",
                "content": "hi there",
                "session_id": "1700000000-1",
            })
        );
    }

    #[test]
    fn error_frame_wire_shape() {
        let frame = ServerFrame::error("s", "engine unavailable");
        let value: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["role"], "assistant");
        assert!(frame.is_error());
        assert_eq!(frame.content(), "engine unavailable");
        assert_eq!(frame.session_id(), "s");
    }
}
