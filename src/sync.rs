//! Store resync progress signaling.
//!
//! A full resync is an external, asynchronous operation; the catch-up job
//! needs to know when one it just triggered has settled. `SyncSignal` holds
//! the current progress state behind a watch channel and exposes a single
//! bounded-wait call rather than a stream for callers to filter.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::error::StoreError;

/// Progress of a store resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncProgress {
    Idle,
    Running,
    ParsingEmojis,
}

impl SyncProgress {
    /// A resync pass is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::ParsingEmojis)
    }
}

/// Shared progress state with a bounded settle-wait.
#[derive(Debug, Clone)]
pub struct SyncSignal {
    tx: watch::Sender<SyncProgress>,
}

impl SyncSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncProgress::Idle);
        Self { tx }
    }

    /// Publish a new progress state.
    pub fn set(&self, progress: SyncProgress) {
        self.tx.send_replace(progress);
    }

    /// Current progress state.
    pub fn get(&self) -> SyncProgress {
        *self.tx.borrow()
    }

    /// Wait until a sync cycle has been observed settling back to `Idle`,
    /// bounded by `timeout`.
    ///
    /// Returns `true` once an active state (`Running`/`ParsingEmojis`) has
    /// been seen followed by `Idle`; `false` when the timeout elapses first
    /// (including the case where no cycle ever starts).
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let settled = tokio::time::timeout(timeout, async {
            let mut saw_active = false;
            loop {
                let active = rx.borrow_and_update().is_active();
                if active {
                    saw_active = true;
                } else if saw_active {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender gone — nothing will ever change again.
                    return;
                }
            }
        })
        .await;
        settled.is_ok()
    }
}

impl Default for SyncSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// External resync operation consumed by the catch-up job.
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Start a full resync. Completion is reported through the progress
    /// signal, not the return value.
    async fn sync_messages(&self) -> Result<(), StoreError>;

    fn signal(&self) -> &SyncSignal;
}

/// Sync service for a purely local store: there is no remote source to pull
/// from, so a triggered resync completes immediately.
pub struct NullSyncService {
    signal: SyncSignal,
}

impl NullSyncService {
    pub fn new() -> Self {
        Self {
            signal: SyncSignal::new(),
        }
    }
}

impl Default for NullSyncService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncService for NullSyncService {
    async fn sync_messages(&self) -> Result<(), StoreError> {
        debug!("local store, resync is a no-op");
        self.signal.set(SyncProgress::Running);
        let signal = self.signal.clone();
        // Flip back from a task so a waiter subscribing after this call
        // still observes the Running → Idle transition.
        tokio::spawn(async move {
            signal.set(SyncProgress::Idle);
        });
        Ok(())
    }

    fn signal(&self) -> &SyncSignal {
        &self.signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_idle_sees_running_then_idle() {
        let signal = SyncSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_idle(Duration::from_secs(20)).await
        });
        // Let the waiter subscribe, and again between states so it observes
        // the transition rather than only the latest value.
        tokio::task::yield_now().await;
        signal.set(SyncProgress::Running);
        tokio::task::yield_now().await;
        signal.set(SyncProgress::ParsingEmojis);
        tokio::task::yield_now().await;
        signal.set(SyncProgress::Idle);

        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_times_out_when_no_cycle_starts() {
        let signal = SyncSignal::new();
        let start = tokio::time::Instant::now();
        assert!(!signal.wait_idle(Duration::from_secs(20)).await);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_times_out_when_sync_never_finishes() {
        let signal = SyncSignal::new();
        signal.set(SyncProgress::Running);
        assert!(!signal.wait_idle(Duration::from_secs(20)).await);
        assert_eq!(signal.get(), SyncProgress::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn null_sync_settles_for_a_later_waiter() {
        let service = NullSyncService::new();
        service.sync_messages().await.unwrap();
        assert!(service.signal().wait_idle(Duration::from_secs(20)).await);
    }
}
