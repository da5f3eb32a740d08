//! In-memory store backend — for tests and ephemeral runs.
//!
//! Keeps the same thread-resolution and aggregate-refresh semantics as the
//! libSQL backend so pipeline tests exercise realistic store behavior
//! without touching disk.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::traits::{
    Conversation, ConversationId, ConversationStore, Message, MessageId, MessageKind,
    MessageStore, ThreadId,
};

#[derive(Default)]
struct State {
    next_message_id: i64,
    next_thread_id: i64,
    /// address → thread.
    threads: HashMap<String, ThreadId>,
    messages: BTreeMap<i64, Message>,
    /// keyed by thread id.
    conversations: HashMap<i64, Conversation>,
}

impl State {
    fn thread_for(&mut self, address: &str) -> ThreadId {
        if let Some(id) = self.threads.get(address) {
            return *id;
        }
        self.next_thread_id += 1;
        let id = ThreadId(self.next_thread_id);
        self.threads.insert(address.to_string(), id);
        id
    }

    fn last_message_in(&self, thread_id: ThreadId) -> Option<MessageId> {
        self.messages
            .values()
            .filter(|m| m.thread_id == thread_id)
            .max_by_key(|m| (m.sent_at, m.id))
            .map(|m| m.id)
    }

    fn ensure_conversation(&mut self, thread_id: ThreadId) -> &mut Conversation {
        self.conversations
            .entry(thread_id.0)
            .or_insert_with(|| Conversation {
                id: ConversationId(thread_id.0),
                thread_id,
                blocked: false,
                archived: false,
                blocking_manager: None,
                block_reason: None,
                last_message_id: None,
            })
    }

    fn refresh_conversation(&mut self, thread_id: ThreadId) {
        let last = self.last_message_in(thread_id);
        self.ensure_conversation(thread_id).last_message_id = last;
    }
}

/// In-memory message/conversation store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archive the given conversations. Test/seeding helper — the pipeline
    /// itself only ever unarchives.
    pub async fn mark_archived(&self, conversation_ids: &[ConversationId]) {
        let mut state = self.inner.write().await;
        for id in conversation_ids {
            state.ensure_conversation(ThreadId(id.0)).archived = true;
        }
    }

    /// Mark every message in a thread as seen, as a notification surface
    /// would after displaying them.
    pub async fn mark_seen(&self, thread_id: ThreadId) {
        let mut state = self.inner.write().await;
        for message in state.messages.values_mut() {
            if message.thread_id == thread_id {
                message.seen = true;
            }
        }
    }

    /// Number of stored messages.
    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_received_sms(
        &self,
        _subscription_id: i32,
        address: &str,
        body: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<MessageId, StoreError> {
        let mut state = self.inner.write().await;
        let thread_id = state.thread_for(address);
        state.next_message_id += 1;
        let id = MessageId(state.next_message_id);
        state.messages.insert(
            id.0,
            Message {
                id,
                thread_id,
                address: address.to_string(),
                body: body.to_string(),
                kind: MessageKind::Sms,
                read: false,
                seen: false,
                sent_at,
            },
        );
        Ok(id)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.inner.read().await.messages.get(&id.0).cloned())
    }

    async fn delete_messages(&self, ids: &[MessageId]) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        for id in ids {
            state.messages.remove(&id.0);
        }
        Ok(())
    }

    async fn mark_read(&self, thread_ids: &[ThreadId]) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        for message in state.messages.values_mut() {
            if thread_ids.contains(&message.thread_id) {
                message.read = true;
            }
        }
        Ok(())
    }

    async fn unread_count(&self) -> Result<u64, StoreError> {
        let state = self.inner.read().await;
        Ok(state.messages.values().filter(|m| !m.read).count() as u64)
    }

    async fn message_thread_ids(&self) -> Result<Vec<ThreadId>, StoreError> {
        let state = self.inner.read().await;
        let mut ids: Vec<ThreadId> = state.messages.values().map(|m| m.thread_id).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn find_unread_unseen(&self, limit: usize) -> Result<Vec<MessageId>, StoreError> {
        let state = self.inner.read().await;
        let mut unseen: Vec<&Message> = state
            .messages
            .values()
            .filter(|m| m.kind == MessageKind::Sms && !m.read && !m.seen)
            .collect();
        unseen.sort_by_key(|m| std::cmp::Reverse((m.sent_at, m.id)));
        Ok(unseen.into_iter().take(limit).map(|m| m.id).collect())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn update_conversations(&self, thread_ids: &[ThreadId]) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        for thread_id in thread_ids {
            state.refresh_conversation(*thread_id);
        }
        Ok(())
    }

    async fn get_or_create_conversation(
        &self,
        thread_id: ThreadId,
    ) -> Result<Option<Conversation>, StoreError> {
        let mut state = self.inner.write().await;
        state.refresh_conversation(thread_id);
        Ok(state.conversations.get(&thread_id.0).cloned())
    }

    async fn mark_blocked(
        &self,
        thread_ids: &[ThreadId],
        blocking_manager: i32,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        for thread_id in thread_ids {
            let conversation = state.ensure_conversation(*thread_id);
            conversation.blocked = true;
            conversation.blocking_manager = Some(blocking_manager);
            conversation.block_reason = reason.map(str::to_string);
        }
        Ok(())
    }

    async fn mark_unblocked(&self, thread_id: ThreadId) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        if let Some(conversation) = state.conversations.get_mut(&thread_id.0) {
            conversation.blocked = false;
            conversation.blocking_manager = None;
            conversation.block_reason = None;
        }
        Ok(())
    }

    async fn mark_unarchived(
        &self,
        conversation_ids: &[ConversationId],
    ) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        for id in conversation_ids {
            if let Some(conversation) = state.conversations.get_mut(&id.0) {
                conversation.archived = false;
            }
        }
        Ok(())
    }

    async fn conversations_snapshot(
        &self,
        unread_at_top: bool,
    ) -> Result<Vec<Conversation>, StoreError> {
        let state = self.inner.read().await;
        let mut entries: Vec<(bool, DateTime<Utc>, Conversation)> = state
            .conversations
            .values()
            .map(|c| {
                let unread = state
                    .messages
                    .values()
                    .any(|m| m.thread_id == c.thread_id && !m.read);
                let last_sent = state
                    .messages
                    .values()
                    .filter(|m| m.thread_id == c.thread_id)
                    .map(|m| m.sent_at)
                    .max()
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                (unread, last_sent, c.clone())
            })
            .collect();
        if unread_at_top {
            entries.sort_by_key(|(unread, last, c)| {
                (std::cmp::Reverse(*unread), std::cmp::Reverse(*last), c.id)
            });
        } else {
            entries.sort_by_key(|(_, last, c)| (std::cmp::Reverse(*last), c.id));
        }
        Ok(entries.into_iter().map(|(_, _, c)| c).collect())
    }
}
