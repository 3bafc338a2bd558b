//! Identities and the persisted message model.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default number of rows returned by a history query.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Largest accepted history page.
pub const MAX_HISTORY_LIMIT: usize = 100;

/// A stable user identity, as resolved by the authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    /// Wrap a UUID.
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a random identity.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// A persisted message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Wrap a UUID.
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a fresh message id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A stored direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier.
    pub id: MessageId,
    /// Author; the only user allowed to edit or delete.
    pub sender: UserId,
    /// Addressee.
    pub receiver: UserId,
    /// Current text.
    pub content: String,
    /// Soft-delete flag.
    pub deleted: bool,
    /// When the content was last replaced.
    pub edited_at: Option<DateTime<Utc>>,
    /// When the message was stored.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new, not yet stored message.
    #[must_use]
    pub fn new(sender: UserId, receiver: UserId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            sender,
            receiver,
            content: content.into(),
            deleted: false,
            edited_at: None,
            created_at: Utc::now(),
        }
    }

    /// Creation time in unix seconds.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.created_at.timestamp()
    }

    /// Check whether this message belongs to the conversation between `a` and `b`.
    #[must_use]
    pub fn between(&self, a: &UserId, b: &UserId) -> bool {
        (self.sender == *a && self.receiver == *b) || (self.sender == *b && self.receiver == *a)
    }
}

/// Parameters of a conversation history query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Maximum number of rows.
    pub limit: usize,
    /// Exclusive upper bound on creation time.
    pub before: Option<DateTime<Utc>>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HISTORY_LIMIT,
            before: None,
        }
    }
}

impl HistoryQuery {
    /// Create a query with the default limit and no cursor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page size. Values outside `1..=MAX_HISTORY_LIMIT` fall back
    /// to the default.
    #[must_use]
    pub fn with_limit(mut self, limit: Option<i64>) -> Self {
        self.limit = match limit {
            Some(l) if l >= 1 && l <= MAX_HISTORY_LIMIT as i64 => l as usize,
            _ => DEFAULT_HISTORY_LIMIT,
        };
        self
    }

    /// Only return messages created strictly before `before` unix seconds.
    ///
    /// Cursors outside the representable range clamp to the earliest or
    /// latest representable instant.
    #[must_use]
    pub fn before_unix(mut self, before: Option<i64>) -> Self {
        self.before = before.map(|ts| {
            Utc.timestamp_opt(ts, 0).single().unwrap_or(if ts < 0 {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            })
        });
        self
    }
}
