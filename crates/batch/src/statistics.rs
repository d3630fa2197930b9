use serde::{Deserialize, Serialize};

use forgebatch_core::BatchId;

use crate::batch::Batch;

/// Execution progress of a live batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub batch_id: BatchId,
    pub batch_type: String,
    pub suspended: bool,
    /// Work-item jobs the batch creates over its lifetime.
    pub total_jobs: u64,
    /// Work-item jobs created by the seed job so far.
    pub jobs_created: u64,
    /// Work-item jobs not yet completed successfully.
    pub remaining_jobs: u64,
    /// Work-item jobs that completed successfully.
    pub completed_jobs: u64,
    /// Live work-item jobs with no retries left.
    pub failed_jobs: u64,
}

impl BatchStatistics {
    pub fn compute(batch: &Batch, completed_jobs: u64, failed_jobs: u64) -> Self {
        let total_jobs = batch.total_jobs();
        Self {
            batch_id: batch.id,
            batch_type: batch.batch_type.clone(),
            suspended: batch.suspended,
            total_jobs,
            jobs_created: batch.jobs_created,
            remaining_jobs: total_jobs.saturating_sub(completed_jobs),
            completed_jobs,
            failed_jobs,
        }
    }
}
