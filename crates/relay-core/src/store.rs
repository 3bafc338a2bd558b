//! Message persistence.
//!
//! The hub only talks to storage through [`MessageStore`]. [`MemoryStore`]
//! keeps everything in process; the server crate provides a SQLite store.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

use crate::message::{HistoryQuery, Message, MessageId, UserId};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No live message with this id.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// The requester is not the sender of the message.
    #[error("Not allowed to modify message: {0}")]
    Forbidden(MessageId),

    /// The storage backend failed.
    #[error("Storage error: {0}")]
    Backend(String),
}

/// Durable storage for direct messages.
///
/// Soft-deleted messages are invisible: editing or deleting them again
/// reports [`StoreError::NotFound`] and history never returns them.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a new message.
    async fn create(
        &self,
        sender: UserId,
        receiver: UserId,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Replace the content of a message. Only its sender may do this.
    async fn edit(
        &self,
        id: MessageId,
        requester: UserId,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Flag a message as deleted. Only its sender may do this.
    async fn soft_delete(&self, id: MessageId, requester: UserId) -> Result<Message, StoreError>;

    /// The conversation between `a` and `b`, newest first.
    async fn history(
        &self,
        a: UserId,
        b: UserId,
        query: &HistoryQuery,
    ) -> Result<Vec<Message>, StoreError>;
}

/// An in-process message store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Messages with their insertion sequence, used to order equal timestamps.
    messages: DashMap<MessageId, (u64, Message)>,
    sequence: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages, including soft-deleted ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if nothing was ever stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Get a message by id, including soft-deleted ones.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<Message> {
        self.messages.get(id).map(|entry| entry.1.clone())
    }

    fn modify(
        &self,
        id: MessageId,
        requester: UserId,
        apply: impl FnOnce(&mut Message),
    ) -> Result<Message, StoreError> {
        let mut entry = self
            .messages
            .get_mut(&id)
            .filter(|entry| !entry.1.deleted)
            .ok_or(StoreError::NotFound(id))?;

        let message = &mut entry.1;
        if message.sender != requester {
            return Err(StoreError::Forbidden(id));
        }

        apply(message);
        Ok(message.clone())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(
        &self,
        sender: UserId,
        receiver: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        let message = Message::new(sender, receiver, content);
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.messages.insert(message.id, (seq, message.clone()));
        debug!(message_id = %message.id, "Stored message");
        Ok(message)
    }

    async fn edit(
        &self,
        id: MessageId,
        requester: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        self.modify(id, requester, |message| {
            message.content = content.to_owned();
            message.edited_at = Some(Utc::now());
        })
    }

    async fn soft_delete(&self, id: MessageId, requester: UserId) -> Result<Message, StoreError> {
        self.modify(id, requester, |message| message.deleted = true)
    }

    async fn history(
        &self,
        a: UserId,
        b: UserId,
        query: &HistoryQuery,
    ) -> Result<Vec<Message>, StoreError> {
        let mut rows: Vec<(u64, Message)> = self
            .messages
            .iter()
            .filter(|entry| {
                let message = &entry.1;
                !message.deleted
                    && message.between(&a, &b)
                    && query.before.map_or(true, |before| message.created_at < before)
            })
            .map(|entry| entry.value().clone())
            .collect();

        rows.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a))
        });
        rows.truncate(query.limit);

        Ok(rows.into_iter().map(|(_, message)| message).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_history() {
        let store = MemoryStore::new();
        let (a, b, c) = (UserId::random(), UserId::random(), UserId::random());

        store.create(a, b, "one").await.unwrap();
        store.create(b, a, "two").await.unwrap();
        store.create(a, c, "elsewhere").await.unwrap();

        let history = store.history(a, b, &HistoryQuery::new()).await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "one"]);

        // Same conversation from the other side
        let history = store.history(b, a, &HistoryQuery::new()).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_history_limit_newest_first_without_deleted() {
        let store = MemoryStore::new();
        let (a, b) = (UserId::random(), UserId::random());

        let mut ids = Vec::new();
        for i in 0..30 {
            ids.push(store.create(a, b, &format!("m{i}")).await.unwrap().id);
        }
        store.soft_delete(ids[29], a).await.unwrap();

        let history = store.history(a, b, &HistoryQuery::new()).await.unwrap();
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].content, "m28");
        assert_eq!(history[19].content, "m9");
        assert!(history.iter().all(|m| !m.deleted));
    }

    #[tokio::test]
    async fn test_history_before_cursor_is_exclusive() {
        let store = MemoryStore::new();
        let (a, b) = (UserId::random(), UserId::random());
        let msg = store.create(a, b, "now").await.unwrap();

        let query = HistoryQuery::new().before_unix(Some(msg.timestamp()));
        assert!(store.history(a, b, &query).await.unwrap().is_empty());

        let query = HistoryQuery::new().before_unix(Some(msg.timestamp() + 1));
        assert_eq!(store.history(a, b, &query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_only_sender_may_edit_or_delete() {
        let store = MemoryStore::new();
        let (a, b) = (UserId::random(), UserId::random());
        let msg = store.create(a, b, "original").await.unwrap();

        assert!(matches!(
            store.edit(msg.id, b, "hijacked").await,
            Err(StoreError::Forbidden(_))
        ));
        assert!(matches!(
            store.soft_delete(msg.id, b).await,
            Err(StoreError::Forbidden(_))
        ));
        assert_eq!(store.get(&msg.id).unwrap().content, "original");

        let edited = store.edit(msg.id, a, "fixed").await.unwrap();
        assert_eq!(edited.content, "fixed");
        assert!(edited.edited_at.is_some());
    }

    #[tokio::test]
    async fn test_deleted_messages_are_not_found() {
        let store = MemoryStore::new();
        let (a, b) = (UserId::random(), UserId::random());
        let msg = store.create(a, b, "bye").await.unwrap();

        let deleted = store.soft_delete(msg.id, a).await.unwrap();
        assert!(deleted.deleted);
        // Content is kept
        assert_eq!(store.get(&msg.id).unwrap().content, "bye");

        assert!(matches!(
            store.soft_delete(msg.id, a).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.edit(msg.id, a, "again").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.edit(MessageId::generate(), a, "missing").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
