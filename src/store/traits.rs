//! Store contracts — the narrow message/conversation persistence surface the
//! pipeline consumes.
//!
//! The pipeline never talks to a backend directly; every stage receives these
//! traits as `Arc<dyn ...>` collaborators. Backends serialize conflicting
//! writes internally — callers get per-message/per-conversation consistency
//! and nothing more.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Store-assigned message identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the thread grouping all messages for one address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ThreadId(pub i64);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversation identity. Currently one conversation per thread, so the
/// numeric value matches the thread id, but callers must not rely on that.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ConversationId(pub i64);

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message channel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Sms,
    Mms,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Mms => "mms",
        }
    }
}

/// A persisted inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub address: String,
    pub body: String,
    pub kind: MessageKind,
    /// Cleared by the user (or by blocking policy) reading the thread.
    pub read: bool,
    /// Set once a notification for this message has been surfaced.
    pub seen: bool,
    pub sent_at: DateTime<Utc>,
}

/// Aggregate state for one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub thread_id: ThreadId,
    pub blocked: bool,
    pub archived: bool,
    /// Identifier of the blocking-policy source that blocked this
    /// conversation, if any.
    pub blocking_manager: Option<i32>,
    pub block_reason: Option<String>,
    pub last_message_id: Option<MessageId>,
}

/// Message persistence contract.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a received SMS as unread/unseen, resolving (or creating) the
    /// thread for its address. Returns the new message's identity.
    async fn insert_received_sms(
        &self,
        subscription_id: i32,
        address: &str,
        body: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<MessageId, StoreError>;

    /// Load a message by id. `None` when it does not (or no longer) exists.
    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Delete the given messages. Missing ids are ignored.
    async fn delete_messages(&self, ids: &[MessageId]) -> Result<(), StoreError>;

    /// Mark every message in the given threads as read.
    async fn mark_read(&self, thread_ids: &[ThreadId]) -> Result<(), StoreError>;

    /// Global count of unread messages.
    async fn unread_count(&self) -> Result<u64, StoreError>;

    /// Distinct thread ids that currently have messages.
    async fn message_thread_ids(&self) -> Result<Vec<ThreadId>, StoreError>;

    /// Ids of unread and unseen SMS messages, most recent first, capped at
    /// `limit`.
    async fn find_unread_unseen(&self, limit: usize) -> Result<Vec<MessageId>, StoreError>;
}

/// Conversation-aggregate persistence contract.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Recompute the aggregates (last-message pointer) for the given threads,
    /// creating conversation rows that don't exist yet.
    async fn update_conversations(&self, thread_ids: &[ThreadId]) -> Result<(), StoreError>;

    /// Fetch the conversation for a thread, creating it if missing. `None`
    /// when the thread cannot be resolved to a conversation at all.
    async fn get_or_create_conversation(
        &self,
        thread_id: ThreadId,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Mark the given threads' conversations blocked, recording which policy
    /// source decided it and why.
    async fn mark_blocked(
        &self,
        thread_ids: &[ThreadId],
        blocking_manager: i32,
        reason: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Clear the blocked state (and recorded policy/reason) for one thread.
    async fn mark_unblocked(&self, thread_id: ThreadId) -> Result<(), StoreError>;

    /// Clear the archived flag on the given conversations.
    async fn mark_unarchived(
        &self,
        conversation_ids: &[ConversationId],
    ) -> Result<(), StoreError>;

    /// All conversations, ordered by recency — with unread conversations
    /// first when `unread_at_top` is set.
    async fn conversations_snapshot(
        &self,
        unread_at_top: bool,
    ) -> Result<Vec<Conversation>, StoreError>;
}
