//! Codec for encoding and decoding Relay frames.
//!
//! Frames travel as JSON text. Outgoing frames are encoded once into a shared
//! [`Payload`] so fan-out to many sessions never re-serializes.

use std::sync::Arc;

use thiserror::Error;

use crate::frames::{IncomingFrame, OutgoingFrame};

/// Maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// An encoded outgoing frame, shared between every session it is queued on.
pub type Payload = Arc<str>;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding error, including unknown frame types.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode an outgoing frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &OutgoingFrame) -> Result<Payload, ProtocolError> {
    let text = serde_json::to_string(frame).map_err(ProtocolError::Encode)?;
    Ok(Arc::from(text))
}

/// Decode an incoming frame from raw bytes.
///
/// # Errors
///
/// Returns an error if the data is too large, is not JSON, or names an
/// unknown frame type.
pub fn decode(data: &[u8]) -> Result<IncomingFrame, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    serde_json::from_slice(data).map_err(ProtocolError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_decode_direct_message() {
        let to = Uuid::new_v4();
        let raw = format!(r#"{{"type":"direct_message","to":"{to}","content":"hey"}}"#);

        let frame = decode(raw.as_bytes()).unwrap();
        assert_eq!(frame, IncomingFrame::direct_message(to, "hey"));
    }

    #[test]
    fn test_decode_unknown_type() {
        let raw = br#"{"type":"typing","to":"x"}"#;
        assert!(matches!(decode(raw), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(decode(b"not json").is_err());
        // Recipient must be a user id
        assert!(decode(br#"{"type":"direct_message","to":"bob","content":"x"}"#).is_err());
        // Content is required
        let raw = format!(r#"{{"type":"direct_message","to":"{}"}}"#, Uuid::new_v4());
        assert!(decode(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let data = vec![b' '; MAX_FRAME_SIZE + 1];
        match decode(&data) {
            Err(ProtocolError::FrameTooLarge(size)) => assert_eq!(size, MAX_FRAME_SIZE + 1),
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_is_json_text() {
        let id = Uuid::new_v4();
        let payload = encode(&OutgoingFrame::message_edited(id, "fixed")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "message_edited");
        assert_eq!(value["content"], "fixed");
    }
}
