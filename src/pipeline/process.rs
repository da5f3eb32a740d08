//! Process stage — the decision state machine for one persisted message.
//!
//! Flow:
//! 1. Blocking evaluation (may delete or mark the conversation)
//! 2. Content filter (may delete)
//! 3. Conversation refresh + get-or-create
//! 4. Blocked-conversation gate
//! 5. Unarchive
//! 6. Side effects (notification, shortcuts, badge) — success path only
//!
//! Every run terminates in exactly one [`ExitReason`]; no collaborator error
//! escapes this stage.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Preferences;
use crate::effects::{BadgeUpdater, NotificationManager, ShortcutManager};
use crate::error::Error;
use crate::policy::{BlockingAction, BlockingEvaluator, ContactsLookup, ContentFilter};
use crate::scheduler::JobVerdict;
use crate::store::{ConversationStore, MessageId, MessageStore};

/// Coarse outcome class, for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCategory {
    Success,
    Filtered,
    Blocked,
    TransientError,
    PermanentError,
}

impl ExitCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Filtered => "filtered",
            Self::Blocked => "blocked",
            Self::TransientError => "transient_error",
            Self::PermanentError => "permanent_error",
        }
    }
}

/// Terminal classification of one process-stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Success,
    /// The job input itself was not a valid message id.
    MissingMessageId,
    /// No message with the given id exists (deleted, or never persisted).
    MissingMessage,
    /// Blocked address with the drop preference on; message deleted.
    BlockedDropEnabled,
    /// Dropped by the content filter; message deleted.
    ContentFiltered,
    /// The thread could not be resolved to a conversation.
    MissingConversation,
    /// Conversation is blocked; message kept, no side effects.
    ConversationBlocked,
    /// I/O-class failure against the store or an evaluator.
    IoException,
    /// Anything else; treated as permanent to avoid retry storms.
    UnexpectedException,
}

impl ExitReason {
    /// Fine-grained reason code emitted in logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::MissingMessageId => "missing_message_id",
            Self::MissingMessage => "missing_message",
            Self::BlockedDropEnabled => "blocked_drop_enabled",
            Self::ContentFiltered => "content_filtered",
            Self::MissingConversation => "missing_conversation",
            Self::ConversationBlocked => "conversation_blocked",
            Self::IoException => "io_exception",
            Self::UnexpectedException => "unexpected_exception",
        }
    }

    pub fn category(&self) -> ExitCategory {
        match self {
            Self::Success => ExitCategory::Success,
            Self::ContentFiltered => ExitCategory::Filtered,
            Self::BlockedDropEnabled | Self::ConversationBlocked => ExitCategory::Blocked,
            Self::IoException => ExitCategory::TransientError,
            Self::MissingMessageId
            | Self::MissingMessage
            | Self::MissingConversation
            | Self::UnexpectedException => ExitCategory::PermanentError,
        }
    }

    /// How the scheduler should treat this exit.
    pub fn verdict(&self) -> JobVerdict {
        match self.category() {
            ExitCategory::Success => JobVerdict::Success(None),
            ExitCategory::TransientError => JobVerdict::Retry,
            _ => JobVerdict::Failure,
        }
    }
}

/// Collaborators for the process stage.
pub struct ProcessDeps {
    pub messages: Arc<dyn MessageStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub blocking: Arc<dyn BlockingEvaluator>,
    pub filter: Arc<dyn ContentFilter>,
    pub contacts: Arc<dyn ContactsLookup>,
    pub notifications: Arc<dyn NotificationManager>,
    pub shortcuts: Arc<dyn ShortcutManager>,
    pub badge: Arc<dyn BadgeUpdater>,
    pub prefs: Arc<dyn Preferences>,
}

/// Runs the processing state machine for one message.
pub struct ProcessStage {
    deps: ProcessDeps,
}

impl ProcessStage {
    pub fn new(deps: ProcessDeps) -> Self {
        Self { deps }
    }

    /// Process one message to a terminal exit reason. Re-running on an
    /// already-deleted message is safe and resolves to `missing_message`.
    pub async fn run(&self, message_id: MessageId) -> ExitReason {
        let started = Instant::now();
        debug!(message_id = %message_id, "Process stage started");

        let reason = match self.evaluate(message_id).await {
            Ok(reason) => reason,
            Err(e) if e.is_transient() => {
                warn!(message_id = %message_id, error = %e, "Transient failure, will retry");
                ExitReason::IoException
            }
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Unexpected failure, not retrying");
                ExitReason::UnexpectedException
            }
        };

        info!(
            message_id = %message_id,
            duration_ms = started.elapsed().as_millis() as u64,
            exit_reason = reason.code(),
            category = reason.category().as_str(),
            "Process stage finished"
        );
        reason
    }

    async fn evaluate(&self, message_id: MessageId) -> Result<ExitReason, Error> {
        if message_id.0 < 0 {
            debug!(message_id = %message_id, "Rejecting invalid message id");
            return Ok(ExitReason::MissingMessageId);
        }

        let Some(message) = self.deps.messages.get_message(message_id).await? else {
            debug!(message_id = %message_id, "Message not found");
            return Ok(ExitReason::MissingMessage);
        };

        let prefs = self.deps.prefs.snapshot();

        match self.deps.blocking.should_block(&message.address).await? {
            BlockingAction::Block { .. } if prefs.drop_blocked => {
                debug!("Address blocked and drop enabled, deleting message");
                self.deps.messages.delete_messages(&[message.id]).await?;
                return Ok(ExitReason::BlockedDropEnabled);
            }
            BlockingAction::Block { reason } => {
                debug!("Address blocked, marking conversation");
                self.deps.messages.mark_read(&[message.thread_id]).await?;
                self.deps
                    .conversations
                    .mark_blocked(&[message.thread_id], prefs.blocking_manager, reason.as_deref())
                    .await?;
            }
            BlockingAction::Unblock => {
                debug!("Unblocking conversation if blocked");
                self.deps
                    .conversations
                    .mark_unblocked(message.thread_id)
                    .await?;
            }
            BlockingAction::NoAction => {}
        }

        if self
            .deps
            .filter
            .is_blocked(&message.body, &message.address, self.deps.contacts.as_ref())
            .await?
        {
            debug!("Message dropped by content filters");
            self.deps.messages.delete_messages(&[message.id]).await?;
            return Ok(ExitReason::ContentFiltered);
        }

        self.deps
            .conversations
            .update_conversations(&[message.thread_id])
            .await?;
        let Some(conversation) = self
            .deps
            .conversations
            .get_or_create_conversation(message.thread_id)
            .await?
        else {
            debug!(thread_id = %message.thread_id, "No conversation resolved for thread");
            return Ok(ExitReason::MissingConversation);
        };

        // Blocked conversations keep the message but stay silent.
        if conversation.blocked {
            debug!("No notifications for blocked conversation");
            return Ok(ExitReason::ConversationBlocked);
        }

        if conversation.archived {
            debug!("Conversation unarchived");
            self.deps
                .conversations
                .mark_unarchived(&[conversation.id])
                .await?;
        }

        debug!("Updating notification");
        self.deps.notifications.update(conversation.id).await;

        debug!("Updating shortcuts");
        self.deps.shortcuts.update_shortcuts().await;
        self.deps.shortcuts.report_shortcut_used(conversation.id).await;

        debug!("Updating badge and widget");
        self.deps.badge.refresh().await;

        Ok(ExitReason::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use crate::config::{PrefsSnapshot, StaticPrefs};
    use crate::error::{EvaluatorError, StoreError};
    use crate::policy::NoContacts;
    use crate::store::memory::MemoryStore;
    use crate::store::traits::{Conversation, ConversationId, Message, ThreadId};

    /// Side-effect managers that count invocations.
    #[derive(Default)]
    struct CountingEffects {
        notifications: AtomicUsize,
        shortcut_updates: AtomicUsize,
        shortcut_reports: AtomicUsize,
        badge_refreshes: AtomicUsize,
        last_conversation: std::sync::Mutex<Option<ConversationId>>,
    }

    #[async_trait]
    impl NotificationManager for CountingEffects {
        async fn update(&self, conversation_id: ConversationId) {
            self.notifications.fetch_add(1, Ordering::SeqCst);
            *self.last_conversation.lock().unwrap() = Some(conversation_id);
        }
    }

    #[async_trait]
    impl ShortcutManager for CountingEffects {
        async fn update_shortcuts(&self) {
            self.shortcut_updates.fetch_add(1, Ordering::SeqCst);
        }

        async fn report_shortcut_used(&self, _conversation_id: ConversationId) {
            self.shortcut_reports.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BadgeUpdater for CountingEffects {
        async fn refresh(&self) {
            self.badge_refreshes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingEffects {
        fn total(&self) -> usize {
            self.notifications.load(Ordering::SeqCst)
                + self.shortcut_updates.load(Ordering::SeqCst)
                + self.shortcut_reports.load(Ordering::SeqCst)
                + self.badge_refreshes.load(Ordering::SeqCst)
        }
    }

    /// Blocking evaluator with a fixed answer.
    struct FixedBlocking(BlockingAction);

    #[async_trait]
    impl BlockingEvaluator for FixedBlocking {
        async fn should_block(&self, _address: &str) -> Result<BlockingAction, EvaluatorError> {
            Ok(self.0.clone())
        }
    }

    /// Blocking evaluator that always fails as unavailable.
    struct DownBlocking;

    #[async_trait]
    impl BlockingEvaluator for DownBlocking {
        async fn should_block(&self, _address: &str) -> Result<BlockingAction, EvaluatorError> {
            Err(EvaluatorError::Unavailable {
                name: "blocking".into(),
                reason: "socket closed".into(),
            })
        }
    }

    /// Content filter with a fixed answer.
    struct FixedFilter(bool);

    #[async_trait]
    impl ContentFilter for FixedFilter {
        async fn is_blocked(
            &self,
            _body: &str,
            _address: &str,
            _contacts: &dyn ContactsLookup,
        ) -> Result<bool, EvaluatorError> {
            Ok(self.0)
        }
    }

    /// Conversation store that never resolves a conversation.
    struct NoConversations;

    #[async_trait]
    impl ConversationStore for NoConversations {
        async fn update_conversations(&self, _thread_ids: &[ThreadId]) -> Result<(), StoreError> {
            Ok(())
        }

        async fn get_or_create_conversation(
            &self,
            _thread_id: ThreadId,
        ) -> Result<Option<Conversation>, StoreError> {
            Ok(None)
        }

        async fn mark_blocked(
            &self,
            _thread_ids: &[ThreadId],
            _blocking_manager: i32,
            _reason: Option<&str>,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn mark_unblocked(&self, _thread_id: ThreadId) -> Result<(), StoreError> {
            Ok(())
        }

        async fn mark_unarchived(
            &self,
            _conversation_ids: &[ConversationId],
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn conversations_snapshot(
            &self,
            _unread_at_top: bool,
        ) -> Result<Vec<Conversation>, StoreError> {
            Ok(Vec::new())
        }
    }

    /// Message store whose reads fail at the I/O level.
    struct FlakyMessages;

    #[async_trait]
    impl MessageStore for FlakyMessages {
        async fn insert_received_sms(
            &self,
            _subscription_id: i32,
            _address: &str,
            _body: &str,
            _sent_at: DateTime<Utc>,
        ) -> Result<MessageId, StoreError> {
            unimplemented!()
        }

        async fn get_message(&self, _id: MessageId) -> Result<Option<Message>, StoreError> {
            Err(StoreError::Query("connection reset".into()))
        }

        async fn delete_messages(&self, _ids: &[MessageId]) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn mark_read(&self, _thread_ids: &[ThreadId]) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn unread_count(&self) -> Result<u64, StoreError> {
            unimplemented!()
        }

        async fn message_thread_ids(&self) -> Result<Vec<ThreadId>, StoreError> {
            unimplemented!()
        }

        async fn find_unread_unseen(&self, _limit: usize) -> Result<Vec<MessageId>, StoreError> {
            unimplemented!()
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        effects: Arc<CountingEffects>,
        stage: ProcessStage,
    }

    fn fixture(blocking: BlockingAction, filtered: bool, prefs: PrefsSnapshot) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let effects = Arc::new(CountingEffects::default());
        let stage = ProcessStage::new(ProcessDeps {
            messages: store.clone(),
            conversations: store.clone(),
            blocking: Arc::new(FixedBlocking(blocking)),
            filter: Arc::new(FixedFilter(filtered)),
            contacts: Arc::new(NoContacts),
            notifications: effects.clone(),
            shortcuts: effects.clone(),
            badge: effects.clone(),
            prefs: Arc::new(StaticPrefs::new(prefs)),
        });
        Fixture {
            store,
            effects,
            stage,
        }
    }

    async fn seed_message(store: &MemoryStore) -> Message {
        let id = store
            .insert_received_sms(
                1,
                "+15551234567",
                "Hi there",
                DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            )
            .await
            .unwrap();
        store.get_message(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn negative_id_exits_missing_message_id() {
        let f = fixture(BlockingAction::NoAction, false, PrefsSnapshot::default());
        let reason = f.stage.run(MessageId(-1)).await;
        assert_eq!(reason, ExitReason::MissingMessageId);
        assert_eq!(reason.category(), ExitCategory::PermanentError);
    }

    #[tokio::test]
    async fn unknown_id_exits_missing_message() {
        let f = fixture(BlockingAction::NoAction, false, PrefsSnapshot::default());
        assert_eq!(f.stage.run(MessageId(9999)).await, ExitReason::MissingMessage);
    }

    #[tokio::test]
    async fn success_path_fires_each_side_effect_once() {
        let f = fixture(BlockingAction::NoAction, false, PrefsSnapshot::default());
        let message = seed_message(&f.store).await;

        let reason = f.stage.run(message.id).await;

        assert_eq!(reason, ExitReason::Success);
        assert_eq!(reason.verdict(), JobVerdict::Success(None));
        assert_eq!(f.effects.notifications.load(Ordering::SeqCst), 1);
        assert_eq!(f.effects.shortcut_updates.load(Ordering::SeqCst), 1);
        assert_eq!(f.effects.shortcut_reports.load(Ordering::SeqCst), 1);
        assert_eq!(f.effects.badge_refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            *f.effects.last_conversation.lock().unwrap(),
            Some(ConversationId(message.thread_id.0))
        );
        // Message is retained, still unread.
        let stored = f.store.get_message(message.id).await.unwrap().unwrap();
        assert!(!stored.read);
    }

    #[tokio::test]
    async fn blocked_with_drop_deletes_and_stays_silent() {
        let f = fixture(
            BlockingAction::Block {
                reason: Some("spam".into()),
            },
            false,
            PrefsSnapshot {
                drop_blocked: true,
                ..Default::default()
            },
        );
        let message = seed_message(&f.store).await;

        let reason = f.stage.run(message.id).await;

        assert_eq!(reason, ExitReason::BlockedDropEnabled);
        assert_eq!(reason.category(), ExitCategory::Blocked);
        assert!(f.store.get_message(message.id).await.unwrap().is_none());
        // No conversation was created or mutated, no side effects fired.
        assert!(
            f.store
                .conversations_snapshot(false)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(f.effects.total(), 0);
    }

    #[tokio::test]
    async fn blocked_without_drop_marks_and_gates() {
        let f = fixture(
            BlockingAction::Block {
                reason: Some("reported spam".into()),
            },
            false,
            PrefsSnapshot {
                drop_blocked: false,
                blocking_manager: 2,
                ..Default::default()
            },
        );
        let message = seed_message(&f.store).await;

        let reason = f.stage.run(message.id).await;

        assert_eq!(reason, ExitReason::ConversationBlocked);
        // Message kept, thread read, conversation blocked with reason.
        let stored = f.store.get_message(message.id).await.unwrap().unwrap();
        assert!(stored.read);
        let conversation = f
            .store
            .get_or_create_conversation(message.thread_id)
            .await
            .unwrap()
            .unwrap();
        assert!(conversation.blocked);
        assert_eq!(conversation.blocking_manager, Some(2));
        assert_eq!(conversation.block_reason.as_deref(), Some("reported spam"));
        assert_eq!(f.effects.total(), 0);
    }

    #[tokio::test]
    async fn unblock_action_clears_block_and_continues() {
        let f = fixture(BlockingAction::Unblock, false, PrefsSnapshot::default());
        let message = seed_message(&f.store).await;
        f.store
            .mark_blocked(&[message.thread_id], 1, Some("old block"))
            .await
            .unwrap();

        let reason = f.stage.run(message.id).await;

        assert_eq!(reason, ExitReason::Success);
        let conversation = f
            .store
            .get_or_create_conversation(message.thread_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!conversation.blocked);
        assert_eq!(f.effects.notifications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn filtered_message_is_deleted_without_side_effects() {
        let f = fixture(BlockingAction::NoAction, true, PrefsSnapshot::default());
        let message = seed_message(&f.store).await;

        let reason = f.stage.run(message.id).await;

        assert_eq!(reason, ExitReason::ContentFiltered);
        assert_eq!(reason.category(), ExitCategory::Filtered);
        assert!(f.store.get_message(message.id).await.unwrap().is_none());
        assert_eq!(f.effects.total(), 0);
    }

    #[tokio::test]
    async fn archived_conversation_is_unarchived_on_success() {
        let f = fixture(BlockingAction::NoAction, false, PrefsSnapshot::default());
        let message = seed_message(&f.store).await;
        f.store
            .mark_archived(&[ConversationId(message.thread_id.0)])
            .await;

        let reason = f.stage.run(message.id).await;

        assert_eq!(reason, ExitReason::Success);
        let conversation = f
            .store
            .get_or_create_conversation(message.thread_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!conversation.archived);
    }

    #[tokio::test]
    async fn rerun_after_delete_resolves_missing_message_both_times() {
        let f = fixture(BlockingAction::NoAction, true, PrefsSnapshot::default());
        let message = seed_message(&f.store).await;

        assert_eq!(f.stage.run(message.id).await, ExitReason::ContentFiltered);
        assert_eq!(f.stage.run(message.id).await, ExitReason::MissingMessage);
        assert_eq!(f.stage.run(message.id).await, ExitReason::MissingMessage);
    }

    #[tokio::test]
    async fn unresolved_conversation_is_permanent() {
        let store = Arc::new(MemoryStore::new());
        let effects = Arc::new(CountingEffects::default());
        let stage = ProcessStage::new(ProcessDeps {
            messages: store.clone(),
            conversations: Arc::new(NoConversations),
            blocking: Arc::new(FixedBlocking(BlockingAction::NoAction)),
            filter: Arc::new(FixedFilter(false)),
            contacts: Arc::new(NoContacts),
            notifications: effects.clone(),
            shortcuts: effects.clone(),
            badge: effects.clone(),
            prefs: Arc::new(StaticPrefs::default()),
        });
        let message = seed_message(&store).await;

        let reason = stage.run(message.id).await;

        assert_eq!(reason, ExitReason::MissingConversation);
        assert_eq!(reason.verdict(), JobVerdict::Failure);
        assert_eq!(effects.total(), 0);
    }

    #[tokio::test]
    async fn store_io_failure_is_transient() {
        let effects = Arc::new(CountingEffects::default());
        let stage = ProcessStage::new(ProcessDeps {
            messages: Arc::new(FlakyMessages),
            conversations: Arc::new(NoConversations),
            blocking: Arc::new(FixedBlocking(BlockingAction::NoAction)),
            filter: Arc::new(FixedFilter(false)),
            contacts: Arc::new(NoContacts),
            notifications: effects.clone(),
            shortcuts: effects.clone(),
            badge: effects.clone(),
            prefs: Arc::new(StaticPrefs::default()),
        });

        let reason = stage.run(MessageId(1)).await;

        assert_eq!(reason, ExitReason::IoException);
        assert_eq!(reason.verdict(), JobVerdict::Retry);
    }

    #[tokio::test]
    async fn evaluator_outage_is_transient() {
        let store = Arc::new(MemoryStore::new());
        let effects = Arc::new(CountingEffects::default());
        let stage = ProcessStage::new(ProcessDeps {
            messages: store.clone(),
            conversations: store.clone(),
            blocking: Arc::new(DownBlocking),
            filter: Arc::new(FixedFilter(false)),
            contacts: Arc::new(NoContacts),
            notifications: effects.clone(),
            shortcuts: effects.clone(),
            badge: effects.clone(),
            prefs: Arc::new(StaticPrefs::default()),
        });
        let message = seed_message(&store).await;

        assert_eq!(stage.run(message.id).await, ExitReason::IoException);
    }

    #[test]
    fn exit_reason_codes_are_stable() {
        assert_eq!(ExitReason::Success.code(), "success");
        assert_eq!(ExitReason::MissingMessageId.code(), "missing_message_id");
        assert_eq!(ExitReason::BlockedDropEnabled.code(), "blocked_drop_enabled");
        assert_eq!(ExitReason::ContentFiltered.code(), "content_filtered");
        assert_eq!(ExitReason::MissingConversation.code(), "missing_conversation");
        assert_eq!(ExitReason::ConversationBlocked.code(), "conversation_blocked");
        assert_eq!(ExitReason::IoException.code(), "io_exception");
        assert_eq!(ExitReason::UnexpectedException.code(), "unexpected_exception");
    }
}
