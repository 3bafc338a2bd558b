//! SQLite message store.
//!
//! A single connection behind a mutex; every call runs on the blocking
//! pool. Timestamps are stored as unix microseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{HistoryQuery, Message, MessageId, MessageStore, StoreError, UserId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

const SELECT_COLUMNS: &str =
    "SELECT id, sender_id, receiver_id, content, deleted, edited_at, created_at FROM messages";

/// Message store backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(backend)?;
        info!("Opened message database at {}", path.display());
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(backend)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                content TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                edited_at INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(sender_id, receiver_id, created_at);",
        )
        .map_err(backend)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("Store task failed: {}", e)))?
    }

    async fn modify(
        &self,
        id: MessageId,
        requester: UserId,
        update: &'static str,
        content: Option<String>,
    ) -> Result<Message, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;

            let row: Option<(String, bool)> = tx
                .query_row(
                    "SELECT sender_id, deleted FROM messages WHERE id = ?1",
                    params![id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(backend)?;

            match row {
                Some((_, true)) | None => return Err(StoreError::NotFound(id)),
                Some((sender, false)) if sender != requester.to_string() => {
                    return Err(StoreError::Forbidden(id));
                }
                Some(_) => {}
            }

            let updated = match content {
                Some(content) => tx.execute(
                    update,
                    params![id.to_string(), content, to_micros(&Utc::now())],
                ),
                None => tx.execute(update, params![id.to_string()]),
            };
            updated.map_err(backend)?;

            let message = tx
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                    params![id.to_string()],
                    message_from_row,
                )
                .map_err(backend)?;
            tx.commit().map_err(backend)?;
            Ok(message)
        })
        .await
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn create(
        &self,
        sender: UserId,
        receiver: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut message = Message::new(sender, receiver, content);
        // Match what a later read returns
        message.created_at = from_micros(to_micros(&message.created_at));

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, content, deleted, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    message.id.to_string(),
                    message.sender.to_string(),
                    message.receiver.to_string(),
                    message.content,
                    to_micros(&message.created_at),
                ],
            )
            .map_err(backend)?;
            debug!(message_id = %message.id, "Stored message");
            Ok(message)
        })
        .await
    }

    async fn edit(
        &self,
        id: MessageId,
        requester: UserId,
        content: &str,
    ) -> Result<Message, StoreError> {
        self.modify(
            id,
            requester,
            "UPDATE messages SET content = ?2, edited_at = ?3 WHERE id = ?1",
            Some(content.to_owned()),
        )
        .await
    }

    async fn soft_delete(&self, id: MessageId, requester: UserId) -> Result<Message, StoreError> {
        self.modify(
            id,
            requester,
            "UPDATE messages SET deleted = 1 WHERE id = ?1",
            None,
        )
        .await
    }

    async fn history(
        &self,
        a: UserId,
        b: UserId,
        query: &HistoryQuery,
    ) -> Result<Vec<Message>, StoreError> {
        let before = query.before.as_ref().map_or(i64::MAX, to_micros);
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{SELECT_COLUMNS}
                     WHERE deleted = 0
                       AND ((sender_id = ?1 AND receiver_id = ?2)
                         OR (sender_id = ?2 AND receiver_id = ?1))
                       AND created_at < ?3
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?4"
                ))
                .map_err(backend)?;

            let messages = stmt
                .query_map(
                    params![a.to_string(), b.to_string(), before, limit],
                    message_from_row,
                )
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)?;
            Ok(messages)
        })
        .await
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn to_micros(time: &DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId::new(uuid_column(row, 0)?),
        sender: UserId::new(uuid_column(row, 1)?),
        receiver: UserId::new(uuid_column(row, 2)?),
        content: row.get(3)?,
        deleted: row.get(4)?,
        edited_at: row.get::<_, Option<i64>>(5)?.map(from_micros),
        created_at: from_micros(row.get(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_create_and_history() {
        let store = store();
        let (a, b, c) = (UserId::random(), UserId::random(), UserId::random());

        let first = store.create(a, b, "one").await.unwrap();
        store.create(b, a, "two").await.unwrap();
        store.create(a, c, "elsewhere").await.unwrap();

        let history = store.history(b, a, &HistoryQuery::new()).await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "one"]);
        assert_eq!(history[1], first);
    }

    #[tokio::test]
    async fn test_history_limit_newest_first_without_deleted() {
        let store = store();
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

        let page = HistoryQuery::new().with_limit(Some(5));
        assert_eq!(store.history(a, b, &page).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_history_before_cursor() {
        let store = store();
        let (a, b) = (UserId::random(), UserId::random());
        let msg = store.create(a, b, "now").await.unwrap();

        let query = HistoryQuery::new().before_unix(Some(msg.timestamp()));
        assert!(store.history(a, b, &query).await.unwrap().is_empty());

        let query = HistoryQuery::new().before_unix(Some(msg.timestamp() + 1));
        assert_eq!(store.history(a, b, &query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_cursor_out_of_range() {
        let store = store();
        let (a, b) = (UserId::random(), UserId::random());
        store.create(a, b, "now").await.unwrap();

        let query = HistoryQuery::new().before_unix(Some(i64::MIN));
        assert!(store.history(a, b, &query).await.unwrap().is_empty());

        let query = HistoryQuery::new().before_unix(Some(i64::MAX));
        assert_eq!(store.history(a, b, &query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_edit_and_delete_authorization() {
        let store = store();
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

        let edited = store.edit(msg.id, a, "fixed").await.unwrap();
        assert_eq!(edited.content, "fixed");
        assert!(edited.edited_at.is_some());

        let deleted = store.soft_delete(msg.id, a).await.unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.content, "fixed");

        assert!(matches!(
            store.edit(msg.id, a, "again").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.soft_delete(MessageId::generate(), a).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.history(a, b, &HistoryQuery::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_file_keeps_messages() {
        let path = std::env::temp_dir().join(format!("relay-store-{}.db", Uuid::new_v4()));
        let (a, b) = (UserId::random(), UserId::random());

        {
            let store = SqliteStore::open(&path).unwrap();
            store.create(a, b, "durable").await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let history = store.history(a, b, &HistoryQuery::new()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "durable");

        drop(store);
        let _ = std::fs::remove_file(&path);
    }
}
