//! Persist stage — validates one inbound message and writes it to the store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::scheduler::{JobOutput, JobVerdict};
use crate::store::MessageStore;

/// Input for one persist job, assembled by the transport boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistInput {
    pub address: String,
    pub body: String,
    pub subscription_id: i32,
    /// Sent timestamp in milliseconds since epoch. Must be positive.
    pub sent_at_ms: i64,
}

/// Writes one inbound SMS and hands the new message id to the chained
/// process job.
pub struct PersistStage {
    messages: Arc<dyn MessageStore>,
}

impl PersistStage {
    pub fn new(messages: Arc<dyn MessageStore>) -> Self {
        Self { messages }
    }

    /// Malformed input is a permanent failure; store errors are transient
    /// and retried.
    pub async fn run(&self, input: &PersistInput) -> JobVerdict {
        if input.address.trim().is_empty() {
            warn!("Persist rejected: blank address");
            return JobVerdict::Failure;
        }
        if input.body.trim().is_empty() {
            warn!("Persist rejected: blank body");
            return JobVerdict::Failure;
        }
        let sent_at = match valid_sent_at(input.sent_at_ms) {
            Some(sent_at) => sent_at,
            None => {
                warn!(sent_at_ms = input.sent_at_ms, "Persist rejected: bad sent timestamp");
                return JobVerdict::Failure;
            }
        };

        match self
            .messages
            .insert_received_sms(input.subscription_id, &input.address, &input.body, sent_at)
            .await
        {
            Ok(id) => {
                debug!(message_id = %id, "Inbound sms persisted");
                JobVerdict::Success(Some(JobOutput::MessageId(id)))
            }
            Err(e) => {
                error!(error = %e, "Persist write failed, scheduling retry");
                JobVerdict::Retry
            }
        }
    }
}

fn valid_sent_at(sent_at_ms: i64) -> Option<DateTime<Utc>> {
    if sent_at_ms <= 0 {
        return None;
    }
    DateTime::from_timestamp_millis(sent_at_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::error::StoreError;
    use crate::store::memory::MemoryStore;
    use crate::store::traits::{Message, MessageId, ThreadId};

    fn input(address: &str, body: &str, sent_at_ms: i64) -> PersistInput {
        PersistInput {
            address: address.to_string(),
            body: body.to_string(),
            subscription_id: 1,
            sent_at_ms,
        }
    }

    #[tokio::test]
    async fn valid_input_writes_message_and_outputs_id() {
        let store = Arc::new(MemoryStore::new());
        let stage = PersistStage::new(store.clone());

        let verdict = stage
            .run(&input("+15551234567", "Hi there", 1_700_000_000_000))
            .await;

        let JobVerdict::Success(Some(JobOutput::MessageId(id))) = verdict else {
            panic!("expected success with message id, got {verdict:?}");
        };
        let message = store.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.body, "Hi there");
        assert!(!message.read);
        assert!(!message.seen);
    }

    #[tokio::test]
    async fn blank_address_fails_without_writing() {
        let store = Arc::new(MemoryStore::new());
        let stage = PersistStage::new(store.clone());

        assert_eq!(stage.run(&input("   ", "hello", 1_000)).await, JobVerdict::Failure);
        assert_eq!(store.message_count().await, 0);
    }

    #[tokio::test]
    async fn blank_body_fails_without_writing() {
        let store = Arc::new(MemoryStore::new());
        let stage = PersistStage::new(store.clone());

        assert_eq!(
            stage.run(&input("+15550001111", "  ", 1_000)).await,
            JobVerdict::Failure
        );
        assert_eq!(store.message_count().await, 0);
    }

    #[tokio::test]
    async fn non_positive_timestamp_fails_without_writing() {
        let store = Arc::new(MemoryStore::new());
        let stage = PersistStage::new(store.clone());

        assert_eq!(
            stage.run(&input("+15550001111", "hello", 0)).await,
            JobVerdict::Failure
        );
        assert_eq!(
            stage.run(&input("+15550001111", "hello", -5)).await,
            JobVerdict::Failure
        );
        assert_eq!(store.message_count().await, 0);
    }

    /// Store that always fails writes.
    struct BrokenStore;

    #[async_trait]
    impl MessageStore for BrokenStore {
        async fn insert_received_sms(
            &self,
            _subscription_id: i32,
            _address: &str,
            _body: &str,
            _sent_at: chrono::DateTime<Utc>,
        ) -> Result<MessageId, StoreError> {
            Err(StoreError::Query("disk unhappy".into()))
        }

        async fn get_message(&self, _id: MessageId) -> Result<Option<Message>, StoreError> {
            unimplemented!()
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

    #[tokio::test]
    async fn store_error_requests_retry() {
        let stage = PersistStage::new(Arc::new(BrokenStore));
        assert_eq!(
            stage.run(&input("+15550001111", "hello", 1_000)).await,
            JobVerdict::Retry
        );
    }
}
