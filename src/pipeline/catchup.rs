//! Catch-up job — reconciles aggregate state and re-drives missed messages.
//!
//! Connectivity gaps, crashes, and scheduler starvation can leave messages
//! persisted but never processed. This job forces a store resync, diffs
//! aggregate snapshots taken before and after, and enqueues a process job
//! for every unread+unseen SMS it finds (bounded per run). The job itself
//! is deduped by name, so overlapping triggers collapse into a single run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{PipelineConfig, Preferences};
use crate::effects::BadgeUpdater;
use crate::error::Error;
use crate::scheduler::{BackoffPolicy, JobRequest, JobScheduler, JobSpec, JobVerdict};
use crate::store::{ConversationId, ConversationStore, MessageId, MessageStore};
use crate::sync::SyncService;

/// Dedup name under which the catch-up job is scheduled.
pub const CATCH_UP_JOB_NAME: &str = "catch-up-messages";

/// Aggregate state captured before and after a resync.
#[derive(Debug, PartialEq)]
struct Snapshot {
    unread_count: u64,
    /// conversation → its last message, in snapshot order.
    conversations: HashMap<ConversationId, Option<MessageId>>,
}

/// Collaborators for the catch-up job.
pub struct CatchUpDeps {
    pub messages: Arc<dyn MessageStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub sync: Arc<dyn SyncService>,
    pub badge: Arc<dyn BadgeUpdater>,
    pub prefs: Arc<dyn Preferences>,
}

/// Reconciliation pass over the message store.
pub struct CatchUpJob {
    deps: CatchUpDeps,
    config: PipelineConfig,
}

impl CatchUpJob {
    pub fn new(deps: CatchUpDeps, config: PipelineConfig) -> Self {
        Self { deps, config }
    }

    /// Run one reconciliation pass. Snapshot-diff failures are reported and
    /// skipped past; the backfill enqueue still runs. Any failure makes the
    /// whole job retry — re-running is safe because the process stage's own
    /// checks absorb re-driven messages.
    pub async fn run(&self, scheduler: &JobScheduler) -> JobVerdict {
        debug!("Catch-up job started");

        let mut diff_failed = false;
        match self.resync_and_diff().await {
            Ok(updated) => {
                info!(updated, "Reconciliation snapshot diff complete");
                self.deps.badge.refresh().await;
            }
            Err(e) => {
                warn!(error = %e, "Reconciliation snapshot diff failed");
                diff_failed = true;
            }
        }

        match self.enqueue_unread(scheduler).await {
            Ok(0) => debug!("Catch-up found no unread sms to enqueue"),
            Ok(count) => info!(count, "Catch-up enqueued process jobs"),
            Err(e) => {
                error!(error = %e, "Catch-up enqueue failed, scheduling retry");
                return JobVerdict::Retry;
            }
        }

        if diff_failed {
            JobVerdict::Retry
        } else {
            JobVerdict::Success(None)
        }
    }

    /// Snapshot, force a resync, refresh every thread's aggregate, snapshot
    /// again. Returns whether anything observable changed.
    pub async fn resync_and_diff(&self) -> Result<bool, Error> {
        let unread_at_top = self.deps.prefs.snapshot().unread_at_top;
        let before = self.snapshot(unread_at_top).await?;

        self.deps.sync.sync_messages().await?;
        if !self.deps.sync.signal().wait_idle(self.config.sync_wait).await {
            warn!(
                wait_secs = self.config.sync_wait.as_secs(),
                "Timed out waiting for sync to settle, continuing"
            );
        }

        let thread_ids = self.deps.messages.message_thread_ids().await?;
        if !thread_ids.is_empty() {
            self.deps.conversations.update_conversations(&thread_ids).await?;
        }

        let after = self.snapshot(unread_at_top).await?;
        Ok(before != after)
    }

    async fn snapshot(&self, unread_at_top: bool) -> Result<Snapshot, Error> {
        let unread_count = self.deps.messages.unread_count().await?;
        let conversations = self
            .deps
            .conversations
            .conversations_snapshot(unread_at_top)
            .await?
            .into_iter()
            .map(|c| (c.id, c.last_message_id))
            .collect();
        Ok(Snapshot {
            unread_count,
            conversations,
        })
    }

    async fn enqueue_unread(&self, scheduler: &JobScheduler) -> Result<usize, Error> {
        let message_ids = self
            .deps
            .messages
            .find_unread_unseen(self.config.catchup_batch_limit)
            .await?;

        let mut enqueued = 0;
        for message_id in message_ids {
            let request = JobRequest::new(
                JobSpec::Process { message_id },
                BackoffPolicy::new(self.config.process_backoff_base),
            )
            .with_unique_name(format!("catch-up-process-{message_id}"));
            if scheduler.enqueue(request).await {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }
}

/// Spawn the periodic catch-up trigger.
///
/// The first tick fires immediately; each tick enqueues the catch-up job
/// under its dedup name, so a still-running pass swallows the new trigger.
pub fn spawn_catchup_loop(
    scheduler: JobScheduler,
    interval: Duration,
    backoff_base: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Catch-up loop started");

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let request = JobRequest::new(JobSpec::CatchUp, BackoffPolicy::new(backoff_base))
                .with_unique_name(CATCH_UP_JOB_NAME);
            if !scheduler.enqueue(request).await {
                debug!("Catch-up already scheduled, keeping existing run");
            }
        }
    })
}
