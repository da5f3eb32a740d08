//! Job scheduler — retry with exponential backoff, dedup-by-name, and
//! chained jobs.
//!
//! Each enqueued job runs on its own tokio task and is tracked until it
//! reaches a terminal state. Jobs share no in-memory state; everything they
//! touch lives behind the store and collaborator traits.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::pipeline::persist::PersistInput;
use crate::store::MessageId;

/// Work item understood by the pipeline's job runner.
#[derive(Debug, Clone)]
pub enum JobSpec {
    /// Write one inbound message to the store.
    Persist(PersistInput),
    /// Run the processing state machine for one persisted message.
    Process { message_id: MessageId },
    /// Reconcile aggregates and re-drive missed messages.
    CatchUp,
}

impl JobSpec {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Persist(_) => "persist",
            Self::Process { .. } => "process",
            Self::CatchUp => "catch_up",
        }
    }
}

/// Typed output a job hands to its chained successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutput {
    MessageId(MessageId),
}

/// Terminal report of one job attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobVerdict {
    /// Done; optionally carries an output for a chained successor.
    Success(Option<JobOutput>),
    /// Transient failure — re-run the same job after backoff.
    Retry,
    /// Permanent failure — do not retry, do not run successors.
    Failure,
}

/// Exponential backoff: `base × 2^(attempt−1)`, capped by the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    fn delay_for(&self, attempt: u32, cap: Duration) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << doublings).min(cap)
    }
}

/// What to do with a second request under an already-active unique name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Keep the existing job; drop the new request.
    KeepExisting,
}

/// Unique-work key for dedup.
#[derive(Debug, Clone)]
pub struct UniqueWork {
    pub name: String,
    pub policy: DedupPolicy,
}

/// Job to run after this one succeeds, fed by its typed output.
#[derive(Debug, Clone, Copy)]
pub enum Successor {
    /// Enqueue a process job for the `MessageId` the predecessor produced.
    Process { backoff: BackoffPolicy },
}

/// A job description accepted by [`JobScheduler::enqueue`].
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub spec: JobSpec,
    pub backoff: BackoffPolicy,
    pub unique: Option<UniqueWork>,
    pub then: Option<Successor>,
}

impl JobRequest {
    pub fn new(spec: JobSpec, backoff: BackoffPolicy) -> Self {
        Self {
            spec,
            backoff,
            unique: None,
            then: None,
        }
    }

    /// Dedup this request by name, keeping any existing job under the name.
    pub fn with_unique_name(mut self, name: impl Into<String>) -> Self {
        self.unique = Some(UniqueWork {
            name: name.into(),
            policy: DedupPolicy::KeepExisting,
        });
        self
    }

    /// Chain a process job after this one succeeds.
    pub fn then_process(mut self, backoff: BackoffPolicy) -> Self {
        self.then = Some(Successor::Process { backoff });
        self
    }
}

/// Executes job specs. The pipeline implements this; the scheduler stays
/// ignorant of stage internals.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn execute(&self, spec: &JobSpec, scheduler: &JobScheduler) -> JobVerdict;
}

/// Tracked job handle.
#[derive(Debug)]
struct TrackedJob {
    handle: JoinHandle<()>,
}

struct Inner {
    runner: Arc<dyn JobRunner>,
    max_attempts: u32,
    max_backoff: Duration,
    jobs: RwLock<HashMap<Uuid, TrackedJob>>,
    active_names: RwLock<HashSet<String>>,
}

/// Schedules background jobs with retry, dedup, and chaining.
///
/// Cheap to clone — clones share one scheduler.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(runner: Arc<dyn JobRunner>, config: &PipelineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                max_attempts: config.max_attempts.max(1),
                max_backoff: config.max_backoff,
                jobs: RwLock::new(HashMap::new()),
                active_names: RwLock::new(HashSet::new()),
            }),
        }
    }

    /// Enqueue a job. Returns `false` when the request was dropped because a
    /// job with the same unique name is already pending or running.
    pub async fn enqueue(&self, request: JobRequest) -> bool {
        if let Some(unique) = &request.unique {
            let mut names = self.inner.active_names.write().await;
            match unique.policy {
                DedupPolicy::KeepExisting => {
                    if !names.insert(unique.name.clone()) {
                        debug!(
                            name = %unique.name,
                            job = request.spec.label(),
                            "Duplicate job request dropped, keeping existing"
                        );
                        return false;
                    }
                }
            }
        }

        let id = Uuid::new_v4();
        // Type-erased so a job can enqueue its successor without the task
        // future becoming self-referential. The boxing lives in `spawn` (a
        // child module) rather than here so it is outside `enqueue`'s opaque
        // defining scope — this lets the compiler close the `Send` auto-trait
        // cycle (enqueue → run_job → enqueue) instead of failing to infer it.
        let task: Pin<Box<dyn Future<Output = ()> + Send>> =
            spawn::run_job_boxed(self.clone(), id, request);
        // Hold the map lock across spawn + insert so the job's own terminal
        // cleanup (which also takes the lock) cannot run before insertion.
        let mut jobs = self.inner.jobs.write().await;
        let handle = tokio::spawn(task);
        jobs.insert(id, TrackedJob { handle });
        true
    }

    /// Number of jobs not yet terminal.
    pub async fn running_count(&self) -> usize {
        self.inner.jobs.read().await.len()
    }

    /// Await every tracked job, including successors spawned while waiting.
    pub async fn drain(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut jobs = self.inner.jobs.write().await;
                jobs.drain().map(|(_, tracked)| tracked.handle).collect()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    /// Abort everything still running.
    pub async fn abort_all(&self) {
        let mut jobs = self.inner.jobs.write().await;
        for (_, tracked) in jobs.drain() {
            if !tracked.handle.is_finished() {
                tracked.handle.abort();
            }
        }
        self.inner.active_names.write().await.clear();
    }

    async fn run_job(&self, id: Uuid, request: JobRequest) {
        let label = request.spec.label();
        let mut attempt = 1u32;
        loop {
            let verdict = self.inner.runner.execute(&request.spec, self).await;
            match verdict {
                JobVerdict::Success(output) => {
                    debug!(job = label, %id, attempt, "Job succeeded");
                    if let Some(successor) = request.then {
                        self.enqueue_successor(successor, output).await;
                    }
                    break;
                }
                JobVerdict::Failure => {
                    warn!(job = label, %id, attempt, "Job failed permanently");
                    break;
                }
                JobVerdict::Retry => {
                    if attempt >= self.inner.max_attempts {
                        error!(
                            job = label,
                            %id,
                            attempts = attempt,
                            "Job exhausted retries, giving up"
                        );
                        break;
                    }
                    let delay = request.backoff.delay_for(attempt, self.inner.max_backoff);
                    debug!(
                        job = label,
                        %id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "Job will retry after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }

        if let Some(unique) = &request.unique {
            self.inner.active_names.write().await.remove(&unique.name);
        }
        self.inner.jobs.write().await.remove(&id);
    }

    async fn enqueue_successor(&self, successor: Successor, output: Option<JobOutput>) {
        match (successor, output) {
            (Successor::Process { backoff }, Some(JobOutput::MessageId(message_id))) => {
                self.enqueue(JobRequest::new(JobSpec::Process { message_id }, backoff))
                    .await;
            }
            (Successor::Process { .. }, None) => {
                error!("Chained job skipped: predecessor produced no output");
            }
        }
    }
}

/// Boxing shim kept in its own module so the `Box::pin` coercion happens
/// outside `JobScheduler::run_job`'s opaque defining scope.
mod spawn {
    use std::future::Future;
    use std::pin::Pin;

    use uuid::Uuid;

    use super::{JobRequest, JobScheduler};

    pub(super) fn run_job_boxed(
        scheduler: JobScheduler,
        id: Uuid,
        request: JobRequest,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move { scheduler.run_job(id, request).await })
    }
}
