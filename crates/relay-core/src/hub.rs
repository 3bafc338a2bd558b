//! The connection hub.
//!
//! The hub owns the registry of live sessions, keyed by user, and routes
//! direct messages and mutation events to them.
//!
//! Every operation touching one user's session set (register, unregister
//! and the fan-out loop of a route or broadcast) runs under that user's
//! shard lock, so they are serialized per identity. The lock is never held
//! across the persistence call.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_protocol::{codec, IncomingFrame, OutgoingFrame, Payload};
use relay_transport::ConnectionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::message::{Message, MessageId, UserId};
use crate::store::{MessageStore, StoreError};

/// Default capacity of a session's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default maximum length of a message body, in bytes.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 16 * 1024;

/// What to do when a session's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Drop the payload for that session only.
    Drop,
    /// Evict the session as unresponsive.
    #[default]
    Disconnect,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum message body length in bytes.
    pub max_content_length: usize,
    /// Behaviour when an outbound queue is full.
    pub overflow_policy: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

/// Why an enqueue did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnqueueError {
    Full,
    Closed,
}

#[derive(Debug)]
struct HandleInner {
    id: ConnectionId,
    user: UserId,
    /// The only sender of the session's outbound queue. Taken on close.
    outbound: Mutex<Option<mpsc::Sender<Payload>>>,
    closed: AtomicBool,
}

/// The hub's view of one live session: its identity and outbound queue.
///
/// Clones share the same queue. Closing any clone closes the queue for
/// all of them, exactly once.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

impl SessionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(user: UserId, capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            inner: Arc::new(HandleInner {
                id: ConnectionId::generate(),
                user,
                outbound: Mutex::new(Some(tx)),
                closed: AtomicBool::new(false),
            }),
        };
        (handle, rx)
    }

    /// Get the session id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Get the owning user.
    #[must_use]
    pub fn user(&self) -> UserId {
        self.inner.user
    }

    /// Check if the outbound queue was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn enqueue(&self, payload: &Payload) -> Result<(), EnqueueError> {
        let outbound = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match outbound.as_ref() {
            Some(tx) => tx.try_send(Arc::clone(payload)).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            }),
            None => Err(EnqueueError::Closed),
        }
    }

    /// Close the outbound queue.
    ///
    /// Returns `true` only for the call that actually closed it.
    fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Dropping the sender lets the outbound loop drain and stop
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }
}

/// Why a frame was not routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not JSON, missing fields, unknown type or unparsable recipient.
    Malformed,
    /// Empty message body.
    EmptyContent,
    /// Message body over the configured limit.
    ContentTooLong,
}

/// Result of routing one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Stored and enqueued to every live session of the receiver.
    Delivered {
        /// Id of the stored message.
        message_id: MessageId,
        /// Number of sessions the payload was queued on.
        sessions: usize,
    },
    /// Ignored without side effects.
    Dropped(DropReason),
    /// The store rejected the write; nothing was delivered.
    PersistFailed,
}

/// The connection hub.
pub struct Hub {
    /// Live sessions per user.
    sessions: DashMap<UserId, HashMap<ConnectionId, SessionHandle>>,
    /// Message persistence.
    store: Arc<dyn MessageStore>,
    /// Configuration.
    config: HubConfig,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self::with_config(store, HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn MessageStore>, config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        Self {
            sessions: DashMap::new(),
            store,
            config,
        }
    }

    /// Get the message store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            user_count: self.sessions.len(),
            session_count: self.sessions.iter().map(|s| s.len()).sum(),
        }
    }

    /// Check if a user has at least one live session.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.sessions.contains_key(user)
    }

    /// Get the number of live sessions of a user.
    #[must_use]
    pub fn session_count(&self, user: &UserId) -> usize {
        self.sessions.get(user).map(|s| s.len()).unwrap_or(0)
    }

    /// Register a session under its user.
    ///
    /// Returns `false` without side effects if the session is already
    /// registered or its queue was already closed.
    pub fn register(&self, handle: SessionHandle) -> bool {
        if handle.is_closed() {
            return false;
        }

        let user = handle.user();
        let id = handle.id();
        let mut sessions = self.sessions.entry(user).or_default();
        if sessions.contains_key(&id) {
            return false;
        }
        sessions.insert(id, handle);

        debug!(user = %user, session = %id, sessions = sessions.len(), "Registered");
        true
    }

    /// Remove a session and close its outbound queue.
    ///
    /// Idempotent: only the first call for a session returns `true`.
    pub fn unregister(&self, user: &UserId, id: ConnectionId) -> bool {
        let removed = match self.sessions.entry(*user) {
            Entry::Occupied(mut entry) => {
                let handle = entry.get_mut().remove(&id);
                if entry.get().is_empty() {
                    entry.remove();
                }
                handle
            }
            Entry::Vacant(_) => None,
        };

        match removed {
            Some(handle) => {
                handle.close();
                debug!(user = %user, session = %id, "Unregistered");
                true
            }
            None => false,
        }
    }

    /// Route one raw inbound frame from `sender`.
    ///
    /// The message is stored first; it is delivered to the receiver's live
    /// sessions only if storing succeeded.
    pub async fn route_direct_message(&self, sender: &UserId, raw: &[u8]) -> RouteOutcome {
        let frame = match codec::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(user = %sender, error = %e, "Dropping malformed frame");
                return RouteOutcome::Dropped(DropReason::Malformed);
            }
        };

        let IncomingFrame::DirectMessage { to, content } = frame;

        if content.is_empty() {
            return RouteOutcome::Dropped(DropReason::EmptyContent);
        }
        if content.len() > self.config.max_content_length {
            debug!(user = %sender, length = content.len(), "Dropping oversized message");
            return RouteOutcome::Dropped(DropReason::ContentTooLong);
        }

        let receiver = UserId::from(to);
        let message = match self.store.create(*sender, receiver, &content).await {
            Ok(message) => message,
            Err(e) => {
                warn!(user = %sender, to = %receiver, error = %e, "Failed to store message");
                return RouteOutcome::PersistFailed;
            }
        };

        let frame = OutgoingFrame::direct_message(
            message.id.as_uuid(),
            sender.as_uuid(),
            message.content.as_str(),
            message.timestamp(),
        );
        let sessions = match codec::encode(&frame) {
            Ok(payload) => self.deliver(&receiver, &payload),
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to encode message");
                0
            }
        };

        trace!(
            user = %sender,
            to = %receiver,
            message_id = %message.id,
            sessions,
            "Routed direct message"
        );

        RouteOutcome::Delivered {
            message_id: message.id,
            sessions,
        }
    }

    /// Queue `payload` on every live session of every user in `users`.
    ///
    /// Duplicate users are delivered to once. Returns the number of
    /// sessions the payload was queued on.
    pub fn broadcast_to_users(&self, users: &[UserId], payload: &Payload) -> usize {
        let mut seen = Vec::with_capacity(users.len());
        let mut delivered = 0;
        for user in users {
            if seen.contains(user) {
                continue;
            }
            seen.push(*user);
            delivered += self.deliver(user, payload);
        }
        delivered
    }

    /// Edit a message and notify both participants.
    ///
    /// # Errors
    ///
    /// Returns the store error; nothing is broadcast in that case.
    pub async fn edit_message(
        &self,
        id: MessageId,
        requester: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        let message = self.store.edit(id, requester, content).await?;
        self.notify_participants(
            &message,
            &OutgoingFrame::message_edited(message.id.as_uuid(), message.content.as_str()),
        );
        Ok(message)
    }

    /// Soft-delete a message and notify both participants.
    ///
    /// # Errors
    ///
    /// Returns the store error; nothing is broadcast in that case.
    pub async fn delete_message(
        &self,
        id: MessageId,
        requester: UserId,
    ) -> Result<Message, StoreError> {
        let message = self.store.soft_delete(id, requester).await?;
        self.notify_participants(&message, &OutgoingFrame::message_deleted(message.id.as_uuid()));
        Ok(message)
    }

    fn notify_participants(&self, message: &Message, frame: &OutgoingFrame) {
        match codec::encode(frame) {
            Ok(payload) => {
                let sessions =
                    self.broadcast_to_users(&[message.sender, message.receiver], &payload);
                debug!(
                    message_id = %message.id,
                    event = %frame.frame_type(),
                    sessions,
                    "Broadcast message event"
                );
            }
            Err(e) => error!(message_id = %message.id, error = %e, "Failed to encode event"),
        }
    }

    /// Queue `payload` on every live session of `user`.
    fn deliver(&self, user: &UserId, payload: &Payload) -> usize {
        let mut delivered = 0;
        let mut evicted = Vec::new();

        if let Some(sessions) = self.sessions.get(user) {
            for (id, handle) in sessions.iter() {
                match handle.enqueue(payload) {
                    Ok(()) => delivered += 1,
                    Err(EnqueueError::Full) => match self.config.overflow_policy {
                        OverflowPolicy::Drop => {
                            warn!(user = %user, session = %id, "Outbound queue full, dropping payload");
                        }
                        OverflowPolicy::Disconnect => {
                            warn!(user = %user, session = %id, "Outbound queue full, evicting session");
                            evicted.push(*id);
                        }
                    },
                    Err(EnqueueError::Closed) => evicted.push(*id),
                }
            }
        }

        for id in evicted {
            self.unregister(user, id);
        }

        delivered
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Number of users with at least one live session.
    pub user_count: usize,
    /// Total number of live sessions.
    pub session_count: usize,
}
