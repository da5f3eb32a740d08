//! Message processing pipeline — persist, process, and catch-up stages.

pub mod catchup;
pub mod persist;
pub mod process;

pub use catchup::{CATCH_UP_JOB_NAME, CatchUpDeps, CatchUpJob, spawn_catchup_loop};
pub use persist::{PersistInput, PersistStage};
pub use process::{ExitCategory, ExitReason, ProcessDeps, ProcessStage};

use async_trait::async_trait;

use crate::scheduler::{JobRunner, JobScheduler, JobSpec, JobVerdict};

/// The pipeline's stages behind the scheduler's runner contract.
pub struct Pipeline {
    persist: PersistStage,
    process: ProcessStage,
    catchup: CatchUpJob,
}

impl Pipeline {
    pub fn new(persist: PersistStage, process: ProcessStage, catchup: CatchUpJob) -> Self {
        Self {
            persist,
            process,
            catchup,
        }
    }
}

#[async_trait]
impl JobRunner for Pipeline {
    async fn execute(&self, spec: &JobSpec, scheduler: &JobScheduler) -> JobVerdict {
        match spec {
            JobSpec::Persist(input) => self.persist.run(input).await,
            JobSpec::Process { message_id } => self.process.run(*message_id).await.verdict(),
            JobSpec::CatchUp => self.catchup.run(scheduler).await,
        }
    }
}
