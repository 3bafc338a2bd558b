//! # relay-protocol
//!
//! Wire envelopes for the Relay direct-messaging hub.
//!
//! Clients and the server exchange JSON text frames tagged by `type`:
//!
//! - `direct_message` - inbound send request, and outbound live delivery
//! - `message_edited` / `message_deleted` - outbound mutation events
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, IncomingFrame};
//!
//! let raw = br#"{"type":"direct_message","to":"67e55044-10b1-426f-9247-bb680e5fe0c8","content":"hi"}"#;
//! let frame = codec::decode(raw).unwrap();
//! assert!(matches!(frame, IncomingFrame::DirectMessage { .. }));
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, Payload, ProtocolError};
pub use frames::{FrameType, IncomingFrame, OutgoingFrame};
