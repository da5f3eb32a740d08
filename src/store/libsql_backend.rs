//! libSQL store backend — async implementation of the message and
//! conversation contracts. Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Value, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{
    Conversation, ConversationId, ConversationStore, Message, MessageId, MessageKind,
    MessageStore, ThreadId,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create store directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Message store opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn ensure_conversation_row(&self, thread_id: ThreadId) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO conversations (thread_id) VALUES (?1)",
                params![thread_id.0],
            )
            .await
            .map_err(|e| StoreError::Query(format!("ensure_conversation: {e}")))?;
        Ok(())
    }

    async fn refresh_last_message(&self, thread_id: ThreadId) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations SET last_message_id = (
                    SELECT id FROM messages WHERE thread_id = ?1
                    ORDER BY sent_at_ms DESC, id DESC LIMIT 1
                ) WHERE thread_id = ?1",
                params![thread_id.0],
            )
            .await
            .map_err(|e| StoreError::Query(format!("refresh_last_message: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Render ids as a SQL IN-list. Safe to inline — ids are integers.
fn id_list<I: IntoIterator<Item = i64>>(ids: I) -> String {
    ids.into_iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn str_to_kind(s: &str) -> MessageKind {
    match s {
        "mms" => MessageKind::Mms,
        _ => MessageKind::Sms,
    }
}

/// Map a libsql row to a Message.
///
/// Column order: 0:id, 1:thread_id, 2:address, 3:body, 4:kind, 5:read,
/// 6:seen, 7:sent_at_ms
fn row_to_message(row: &libsql::Row) -> Result<Message, libsql::Error> {
    let kind: String = row.get(4)?;
    let sent_at_ms: i64 = row.get(7)?;
    Ok(Message {
        id: MessageId(row.get(0)?),
        thread_id: ThreadId(row.get(1)?),
        address: row.get(2)?,
        body: row.get(3)?,
        kind: str_to_kind(&kind),
        read: row.get::<i64>(5)? != 0,
        seen: row.get::<i64>(6)? != 0,
        sent_at: DateTime::from_timestamp_millis(sent_at_ms).unwrap_or(DateTime::<Utc>::MIN_UTC),
    })
}

/// Map a libsql row to a Conversation.
///
/// Column order: 0:thread_id, 1:blocked, 2:archived, 3:blocking_manager,
/// 4:block_reason, 5:last_message_id
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, libsql::Error> {
    let thread_id: i64 = row.get(0)?;
    Ok(Conversation {
        id: ConversationId(thread_id),
        thread_id: ThreadId(thread_id),
        blocked: row.get::<i64>(1)? != 0,
        archived: row.get::<i64>(2)? != 0,
        blocking_manager: row.get::<i64>(3).ok().map(|m| m as i32),
        block_reason: row.get::<String>(4).ok(),
        last_message_id: row.get::<i64>(5).ok().map(MessageId),
    })
}

#[async_trait]
impl MessageStore for LibSqlBackend {
    async fn insert_received_sms(
        &self,
        subscription_id: i32,
        address: &str,
        body: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<MessageId, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO threads (address) VALUES (?1)",
            params![address],
        )
        .await
        .map_err(|e| StoreError::Query(format!("insert_received_sms thread: {e}")))?;

        let mut rows = conn
            .query("SELECT id FROM threads WHERE address = ?1", params![address])
            .await
            .map_err(|e| StoreError::Query(format!("insert_received_sms thread lookup: {e}")))?;
        let thread_id: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| StoreError::Query(format!("thread row parse: {e}")))?,
            Ok(None) => {
                return Err(StoreError::Query(
                    "thread for address not resolved after insert".to_string(),
                ));
            }
            Err(e) => return Err(StoreError::Query(format!("thread lookup: {e}"))),
        };

        conn.execute(
            "INSERT INTO messages (thread_id, address, body, kind, read, seen, subscription_id, sent_at_ms)
             VALUES (?1, ?2, ?3, 'sms', 0, 0, ?4, ?5)",
            params![
                thread_id,
                address,
                body,
                subscription_id as i64,
                sent_at.timestamp_millis(),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("insert_received_sms: {e}")))?;

        let id = MessageId(conn.last_insert_rowid());
        debug!(message_id = %id, thread_id, "Inbound sms inserted");
        Ok(id)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, thread_id, address, body, kind, read, seen, sent_at_ms
                 FROM messages WHERE id = ?1",
                params![id.0],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let message = row_to_message(&row)
                    .map_err(|e| StoreError::Query(format!("get_message row parse: {e}")))?;
                Ok(Some(message))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_message: {e}"))),
        }
    }

    async fn delete_messages(&self, ids: &[MessageId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "DELETE FROM messages WHERE id IN ({})",
            id_list(ids.iter().map(|id| id.0))
        );
        self.conn()
            .execute(&sql, ())
            .await
            .map_err(|e| StoreError::Query(format!("delete_messages: {e}")))?;
        Ok(())
    }

    async fn mark_read(&self, thread_ids: &[ThreadId]) -> Result<(), StoreError> {
        if thread_ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE messages SET read = 1 WHERE read = 0 AND thread_id IN ({})",
            id_list(thread_ids.iter().map(|id| id.0))
        );
        self.conn()
            .execute(&sql, ())
            .await
            .map_err(|e| StoreError::Query(format!("mark_read: {e}")))?;
        Ok(())
    }

    async fn unread_count(&self) -> Result<u64, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM messages WHERE read = 0", ())
            .await
            .map_err(|e| StoreError::Query(format!("unread_count: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("unread_count row parse: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Query(format!("unread_count: {e}"))),
        }
    }

    async fn message_thread_ids(&self) -> Result<Vec<ThreadId>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT thread_id FROM messages ORDER BY thread_id",
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("message_thread_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: i64 = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("thread id row parse: {e}")))?;
            ids.push(ThreadId(id));
        }
        Ok(ids)
    }

    async fn find_unread_unseen(&self, limit: usize) -> Result<Vec<MessageId>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM messages
                 WHERE kind = 'sms' AND read = 0 AND seen = 0
                 ORDER BY sent_at_ms DESC, id DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("find_unread_unseen: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: i64 = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("message id row parse: {e}")))?;
            ids.push(MessageId(id));
        }
        Ok(ids)
    }
}

#[async_trait]
impl ConversationStore for LibSqlBackend {
    async fn update_conversations(&self, thread_ids: &[ThreadId]) -> Result<(), StoreError> {
        for thread_id in thread_ids {
            self.ensure_conversation_row(*thread_id).await?;
            self.refresh_last_message(*thread_id).await?;
        }
        Ok(())
    }

    async fn get_or_create_conversation(
        &self,
        thread_id: ThreadId,
    ) -> Result<Option<Conversation>, StoreError> {
        self.ensure_conversation_row(thread_id).await?;
        self.refresh_last_message(thread_id).await?;

        let mut rows = self
            .conn()
            .query(
                "SELECT thread_id, blocked, archived, blocking_manager, block_reason, last_message_id
                 FROM conversations WHERE thread_id = ?1",
                params![thread_id.0],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_or_create_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let conversation = row_to_conversation(&row)
                    .map_err(|e| StoreError::Query(format!("conversation row parse: {e}")))?;
                Ok(Some(conversation))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_or_create_conversation: {e}"))),
        }
    }

    async fn mark_blocked(
        &self,
        thread_ids: &[ThreadId],
        blocking_manager: i32,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        if thread_ids.is_empty() {
            return Ok(());
        }
        for thread_id in thread_ids {
            self.ensure_conversation_row(*thread_id).await?;
        }
        let sql = format!(
            "UPDATE conversations SET blocked = 1, blocking_manager = ?1, block_reason = ?2
             WHERE thread_id IN ({})",
            id_list(thread_ids.iter().map(|id| id.0))
        );
        let reason_value = match reason {
            Some(reason) => Value::Text(reason.to_string()),
            None => Value::Null,
        };
        self.conn()
            .execute(&sql, vec![Value::Integer(blocking_manager as i64), reason_value])
            .await
            .map_err(|e| StoreError::Query(format!("mark_blocked: {e}")))?;
        Ok(())
    }

    async fn mark_unblocked(&self, thread_id: ThreadId) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE conversations
                 SET blocked = 0, blocking_manager = NULL, block_reason = NULL
                 WHERE thread_id = ?1",
                params![thread_id.0],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_unblocked: {e}")))?;
        Ok(())
    }

    async fn mark_unarchived(
        &self,
        conversation_ids: &[ConversationId],
    ) -> Result<(), StoreError> {
        if conversation_ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE conversations SET archived = 0 WHERE thread_id IN ({})",
            id_list(conversation_ids.iter().map(|id| id.0))
        );
        self.conn()
            .execute(&sql, ())
            .await
            .map_err(|e| StoreError::Query(format!("mark_unarchived: {e}")))?;
        Ok(())
    }

    async fn conversations_snapshot(
        &self,
        unread_at_top: bool,
    ) -> Result<Vec<Conversation>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT c.thread_id, c.blocked, c.archived, c.blocking_manager,
                        c.block_reason, c.last_message_id
                 FROM conversations c
                 LEFT JOIN (
                     SELECT thread_id,
                            SUM(CASE WHEN read = 0 THEN 1 ELSE 0 END) AS unread,
                            MAX(sent_at_ms) AS last_ms
                     FROM messages GROUP BY thread_id
                 ) m ON m.thread_id = c.thread_id
                 ORDER BY
                     CASE WHEN ?1 != 0 AND COALESCE(m.unread, 0) > 0 THEN 1 ELSE 0 END DESC,
                     COALESCE(m.last_ms, 0) DESC,
                     c.thread_id ASC",
                params![unread_at_top as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("conversations_snapshot: {e}")))?;

        let mut conversations = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let conversation = row_to_conversation(&row)
                .map_err(|e| StoreError::Query(format!("conversation row parse: {e}")))?;
            conversations.push(conversation);
        }
        Ok(conversations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let id = store
            .insert_received_sms(1, "+15551234567", "Hi there", ts(1_700_000_000_000))
            .await
            .unwrap();

        let message = store.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.address, "+15551234567");
        assert_eq!(message.body, "Hi there");
        assert_eq!(message.kind, MessageKind::Sms);
        assert!(!message.read);
        assert!(!message.seen);
        assert_eq!(message.sent_at, ts(1_700_000_000_000));
    }

    #[tokio::test]
    async fn same_address_reuses_thread() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let a = store
            .insert_received_sms(1, "+15550001111", "one", ts(1_000))
            .await
            .unwrap();
        let b = store
            .insert_received_sms(1, "+15550001111", "two", ts(2_000))
            .await
            .unwrap();

        let first = store.get_message(a).await.unwrap().unwrap();
        let second = store.get_message(b).await.unwrap().unwrap();
        assert_eq!(first.thread_id, second.thread_id);
        assert_eq!(store.message_thread_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_then_get_returns_none() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let id = store
            .insert_received_sms(1, "+15550001111", "gone", ts(1_000))
            .await
            .unwrap();
        store.delete_messages(&[id]).await.unwrap();
        assert!(store.get_message(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_read_and_unread_count() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let a = store
            .insert_received_sms(1, "+15550001111", "x", ts(1_000))
            .await
            .unwrap();
        store
            .insert_received_sms(1, "+15550002222", "y", ts(2_000))
            .await
            .unwrap();
        assert_eq!(store.unread_count().await.unwrap(), 2);

        let thread = store.get_message(a).await.unwrap().unwrap().thread_id;
        store.mark_read(&[thread]).await.unwrap();
        assert_eq!(store.unread_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn find_unread_unseen_most_recent_first_with_limit() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(
                store
                    .insert_received_sms(1, "+15550001111", "m", ts(1_000 + i))
                    .await
                    .unwrap(),
            );
        }

        let found = store.find_unread_unseen(2).await.unwrap();
        assert_eq!(found, vec![ids[3], ids[2]]);
    }

    #[tokio::test]
    async fn blocked_state_roundtrips_with_reason() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let id = store
            .insert_received_sms(1, "+15550001111", "m", ts(1_000))
            .await
            .unwrap();
        let thread = store.get_message(id).await.unwrap().unwrap().thread_id;

        store
            .mark_blocked(&[thread], 3, Some("reported spam"))
            .await
            .unwrap();
        let conversation = store
            .get_or_create_conversation(thread)
            .await
            .unwrap()
            .unwrap();
        assert!(conversation.blocked);
        assert_eq!(conversation.blocking_manager, Some(3));
        assert_eq!(conversation.block_reason.as_deref(), Some("reported spam"));

        store.mark_unblocked(thread).await.unwrap();
        let conversation = store
            .get_or_create_conversation(thread)
            .await
            .unwrap()
            .unwrap();
        assert!(!conversation.blocked);
        assert!(conversation.blocking_manager.is_none());
    }

    #[tokio::test]
    async fn conversation_tracks_last_message() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let a = store
            .insert_received_sms(1, "+15550001111", "first", ts(1_000))
            .await
            .unwrap();
        let thread = store.get_message(a).await.unwrap().unwrap().thread_id;
        let conversation = store
            .get_or_create_conversation(thread)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.last_message_id, Some(a));

        let b = store
            .insert_received_sms(1, "+15550001111", "second", ts(2_000))
            .await
            .unwrap();
        store.update_conversations(&[thread]).await.unwrap();
        let conversation = store
            .get_or_create_conversation(thread)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.last_message_id, Some(b));
    }

    #[tokio::test]
    async fn snapshot_orders_unread_first_when_asked() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let a = store
            .insert_received_sms(1, "+15550001111", "old unread", ts(1_000))
            .await
            .unwrap();
        let b = store
            .insert_received_sms(1, "+15550002222", "new read", ts(2_000))
            .await
            .unwrap();
        let unread_thread = store.get_message(a).await.unwrap().unwrap().thread_id;
        let read_thread = store.get_message(b).await.unwrap().unwrap().thread_id;
        store
            .update_conversations(&[unread_thread, read_thread])
            .await
            .unwrap();
        store.mark_read(&[read_thread]).await.unwrap();

        let plain = store.conversations_snapshot(false).await.unwrap();
        assert_eq!(plain[0].thread_id, read_thread);

        let unread_first = store.conversations_snapshot(true).await.unwrap();
        assert_eq!(unread_first[0].thread_id, unread_thread);
    }

    #[tokio::test]
    async fn local_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sms.db");

        let id = {
            let store = LibSqlBackend::new_local(&path).await.unwrap();
            store
                .insert_received_sms(1, "+15550001111", "durable", ts(1_000))
                .await
                .unwrap()
        };

        let store = LibSqlBackend::new_local(&path).await.unwrap();
        let message = store.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.body, "durable");
    }
}
