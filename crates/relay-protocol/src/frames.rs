//! Frame types for the Relay protocol.
//!
//! Frames are JSON objects discriminated by a `type` field. Envelopes only
//! carry stable identifiers and content, never anything tied to a connection.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frame type identifiers as they appear in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    DirectMessage,
    MessageEdited,
    MessageDeleted,
}

impl FrameType {
    /// The wire name of this frame type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::DirectMessage => "direct_message",
            FrameType::MessageEdited => "message_edited",
            FrameType::MessageDeleted => "message_deleted",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame sent by a client.
///
/// Only `direct_message` is accepted; any other `type` fails to decode and
/// is dropped by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IncomingFrame {
    /// Send a message to another user.
    #[serde(rename = "direct_message")]
    DirectMessage {
        /// Recipient user id.
        to: Uuid,
        /// Message text.
        content: String,
    },
}

impl IncomingFrame {
    /// Create a new DirectMessage frame.
    #[must_use]
    pub fn direct_message(to: Uuid, content: impl Into<String>) -> Self {
        IncomingFrame::DirectMessage {
            to,
            content: content.into(),
        }
    }
}

/// A frame pushed by the server to live sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutgoingFrame {
    /// Live delivery of a newly persisted message.
    #[serde(rename = "direct_message")]
    DirectMessage {
        /// Persisted message id.
        id: Uuid,
        /// Sender user id.
        from: Uuid,
        /// Message text.
        content: String,
        /// Creation time in unix seconds, as recorded by the store.
        timestamp: i64,
    },

    /// A message was edited by its sender.
    #[serde(rename = "message_edited")]
    MessageEdited {
        /// Edited message id.
        id: Uuid,
        /// New content.
        content: String,
    },

    /// A message was soft-deleted by its sender.
    #[serde(rename = "message_deleted")]
    MessageDeleted {
        /// Deleted message id.
        id: Uuid,
    },
}

impl OutgoingFrame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            OutgoingFrame::DirectMessage { .. } => FrameType::DirectMessage,
            OutgoingFrame::MessageEdited { .. } => FrameType::MessageEdited,
            OutgoingFrame::MessageDeleted { .. } => FrameType::MessageDeleted,
        }
    }

    /// Create a new DirectMessage frame.
    #[must_use]
    pub fn direct_message(id: Uuid, from: Uuid, content: impl Into<String>, timestamp: i64) -> Self {
        OutgoingFrame::DirectMessage {
            id,
            from,
            content: content.into(),
            timestamp,
        }
    }

    /// Create a new MessageEdited frame.
    #[must_use]
    pub fn message_edited(id: Uuid, content: impl Into<String>) -> Self {
        OutgoingFrame::MessageEdited {
            id,
            content: content.into(),
        }
    }

    /// Create a new MessageDeleted frame.
    #[must_use]
    pub fn message_deleted(id: Uuid) -> Self {
        OutgoingFrame::MessageDeleted { id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_type() {
        let id = Uuid::new_v4();
        assert_eq!(
            OutgoingFrame::message_deleted(id).frame_type(),
            FrameType::MessageDeleted
        );
        assert_eq!(FrameType::MessageEdited.to_string(), "message_edited");
    }

    #[test]
    fn test_outgoing_direct_message_shape() {
        let id = Uuid::new_v4();
        let from = Uuid::new_v4();
        let frame = OutgoingFrame::direct_message(id, from, "hello", 1_700_000_000);

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "direct_message",
                "id": id.to_string(),
                "from": from.to_string(),
                "content": "hello",
                "timestamp": 1_700_000_000,
            })
        );
    }

    #[test]
    fn test_outgoing_deleted_carries_only_id() {
        let id = Uuid::new_v4();
        let value = serde_json::to_value(OutgoingFrame::message_deleted(id)).unwrap();
        assert_eq!(value, json!({ "type": "message_deleted", "id": id.to_string() }));
    }
}
