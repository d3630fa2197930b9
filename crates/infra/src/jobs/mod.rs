//! Batch jobs: rows, acquisition and execution.
//!
//! ## Design
//!
//! - Jobs belong to a job definition and carry an optional payload
//! - Acquisition claims jobs with an optimistic lock on the row revision
//! - Each invocation commits its handler's writes together with the job update
//! - A failed invocation costs one retry; at zero retries a job stays parked
//!   until an operator raises its retries or deletes the batch
//!
//! ## Components
//!
//! - `Job` / `JobDefinition`: persisted rows
//! - `acquire_jobs`: claim due jobs for one lock owner
//! - `run_job`: execute a claimed job and commit its outcome
//! - `JobExecutor`: background acquisition loop feeding the worker pool

pub mod acquisition;
pub mod executor;
pub mod types;

pub use acquisition::acquire_jobs;
pub use executor::{ExecutionOutcome, ExecutorStats, JobExecutor, JobExecutorHandle, run_job};
pub use types::{
    BackoffStrategy, Job, JobDefinition, JobDefinitionKind, MONITOR_JOB_TYPE, RetryPolicy,
    SEED_JOB_TYPE, due_after,
};
