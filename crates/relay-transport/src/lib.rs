//! # relay-transport
//!
//! Transport abstraction layer for the Relay hub.
//!
//! Every connection is split into a read half ([`FrameSource`]) and a write
//! half ([`FrameSink`]) so a session can read and write concurrently:
//!
//! - **WebSocket** - an upgraded axum socket (feature `websocket`)
//! - **Memory** - a channel-backed pair for tests and embedding
//!
//! ```rust,ignore
//! use relay_transport::{FrameSource, Inbound};
//!
//! async fn drain(mut source: impl FrameSource) {
//!     while let Ok(Some(frame)) = source.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{ConnectionId, FrameSink, FrameSource, Inbound, TransportError};
