//! # relay-server
//!
//! HTTP and WebSocket front end for the Relay direct-messaging hub.
//!
//! - `GET /ws?token=<jwt>` - live delivery, authenticated before upgrade
//! - `GET /chats/:user_id` - conversation history
//! - `PUT /messages/:message_id` / `DELETE /messages/:message_id` - edits and
//!   deletes, pushed to both participants
//! - `GET /health` - liveness

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod rest;
pub mod store;
