//! Configuration types.

use std::time::Duration;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Base delay for persist-job retries (exponential backoff).
    pub persist_backoff_base: Duration,
    /// Base delay for process-job retries (exponential backoff).
    pub process_backoff_base: Duration,
    /// Base delay for catch-up job retries (exponential backoff).
    pub catchup_backoff_base: Duration,
    /// Maximum attempts per job before the scheduler gives up.
    pub max_attempts: u32,
    /// Upper bound on any single backoff delay.
    pub max_backoff: Duration,
    /// Maximum number of messages one catch-up run may re-enqueue.
    pub catchup_batch_limit: usize,
    /// How long catch-up waits for a triggered sync to settle.
    pub sync_wait: Duration,
    /// Interval between catch-up runs.
    pub catchup_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            persist_backoff_base: Duration::from_secs(30),
            process_backoff_base: Duration::from_secs(30),
            catchup_backoff_base: Duration::from_secs(30),
            max_attempts: 5,
            max_backoff: Duration::from_secs(15 * 60),
            catchup_batch_limit: 50,
            sync_wait: Duration::from_secs(20),
            catchup_interval: Duration::from_secs(15 * 60),
        }
    }
}

/// Read-only preference values captured once per job invocation.
///
/// Jobs never read live preferences mid-flight; they take a snapshot at the
/// start of a run so concurrent preference edits can't split one decision
/// sequence across two configurations.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefsSnapshot {
    /// Drop messages from blocked addresses instead of marking the
    /// conversation blocked.
    pub drop_blocked: bool,
    /// Identifier of the active blocking-policy source, recorded on
    /// conversations when they are marked blocked.
    pub blocking_manager: i32,
    /// Sort conversations with unread messages first in snapshots.
    pub unread_at_top: bool,
}

/// Preference source consumed by the pipeline.
pub trait Preferences: Send + Sync {
    fn snapshot(&self) -> PrefsSnapshot;
}

/// Fixed preferences, resolved once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticPrefs {
    prefs: PrefsSnapshot,
}

impl StaticPrefs {
    pub fn new(prefs: PrefsSnapshot) -> Self {
        Self { prefs }
    }
}

impl Preferences for StaticPrefs {
    fn snapshot(&self) -> PrefsSnapshot {
        self.prefs
    }
}
