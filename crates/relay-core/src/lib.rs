//! # relay-core
//!
//! Connection hub, sessions and message routing for the Relay
//! direct-messaging server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - Registry of live sessions per user, routing and broadcast
//! - **Session** - One connection's inbound and outbound loops
//! - **RateLimiter** - Per-key sliding-window admission control
//! - **MessageStore** - Persistence seam for direct messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │   Session   │────▶│     Hub     │────▶│ MessageStore │
//! │  (inbound)  │     └─────────────┘     └──────────────┘
//! └─────────────┘            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │   Session   │
//!                     │ (outbound)  │
//!                     └─────────────┘
//! ```

pub mod hub;
pub mod message;
pub mod ratelimit;
pub mod session;
pub mod store;

pub use hub::{
    DropReason, Hub, HubConfig, HubStats, OverflowPolicy, RouteOutcome, SessionHandle,
};
pub use message::{HistoryQuery, Message, MessageId, UserId};
pub use ratelimit::RateLimiter;
pub use session::{CloseReason, Session, SessionConfig, SessionSummary};
pub use store::{MemoryStore, MessageStore, StoreError};
