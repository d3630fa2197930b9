//! Batch engine storage.
//!
//! The store is the single source of truth: live batches, job definitions,
//! jobs and batch variables, plus the history stream feeding the audit read
//! models.
//!
//! ## Writes
//!
//! All writes go through [`BatchStore::commit`] with a [`ChangeSet`]. A change
//! set is applied atomically: either every change is visible afterwards or none
//! is. Updates and job deletions carry an [`ExpectedVersion`]; a mismatch fails
//! the whole commit with [`StoreError::Concurrency`].
//!
//! ## Lock claims
//!
//! [`BatchStore::try_lock_job`] is the only write outside a change set. It is a
//! compare-and-swap on the job revision: it succeeds only if the job is
//! unchanged since it was read.

pub mod in_memory;
pub mod postgres;
pub mod query;

use chrono::{DateTime, Utc};

use forgebatch_batch::{Batch, Variables};
use forgebatch_core::{BatchId, ExpectedVersion, JobDefinitionId, JobId};
use forgebatch_events::HistoryEvent;

use crate::jobs::{Job, JobDefinition};
use crate::projections::{HistoricBatch, HistoricJobLogEntry, OperationLogEntry};

pub use in_memory::InMemoryBatchStore;
pub use postgres::PostgresBatchStore;
pub use query::{BatchQuery, HistoricBatchQuery, HistoricJobLogQuery, JobQuery};

/// Storage error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("storage error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, StoreError::Concurrency(_))
    }
}

/// A single write inside a [`ChangeSet`].
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    InsertBatch(Batch),
    /// Replace the batch row; the stored revision is bumped.
    UpdateBatch {
        batch: Batch,
        expected: ExpectedVersion,
    },
    /// Set the execution start time if unset. Does not bump the revision.
    MarkBatchExecutionStarted {
        batch_id: BatchId,
        at: DateTime<Utc>,
    },
    DeleteBatch {
        id: BatchId,
        expected: ExpectedVersion,
    },
    InsertJobDefinition(JobDefinition),
    SetJobDefinitionSuspended {
        id: JobDefinitionId,
        suspended: bool,
    },
    DeleteJobDefinition(JobDefinitionId),
    InsertJob(Job),
    /// Replace the job row; the stored revision is bumped.
    UpdateJob {
        job: Job,
        expected: ExpectedVersion,
    },
    /// Overwrite only the retry budget; lock and payload stay as stored.
    SetJobRetries {
        id: JobId,
        retries: u32,
    },
    DeleteJob {
        id: JobId,
        expected: ExpectedVersion,
    },
    DeleteJobsByDefinition(JobDefinitionId),
    SetJobsSuspendedByDefinition {
        job_definition_id: JobDefinitionId,
        suspended: bool,
    },
    PutVariables {
        batch_id: BatchId,
        variables: Variables,
    },
    DeleteVariables(BatchId),
    /// Append to the history stream. Applied after all row changes.
    Record(HistoryEvent),
}

/// Ordered changes committed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn into_changes(self) -> Vec<Change> {
        self.changes
    }
}

impl From<Vec<Change>> for ChangeSet {
    fn from(changes: Vec<Change>) -> Self {
        Self { changes }
    }
}

/// Batch engine storage abstraction.
pub trait BatchStore: Send + Sync {
    fn find_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError>;

    /// Live batches matching `query`, ordered by id.
    fn list_batches(&self, query: &BatchQuery) -> Result<Vec<Batch>, StoreError>;

    fn find_job_definition(&self, id: JobDefinitionId) -> Result<Option<JobDefinition>, StoreError>;

    fn job_definitions_for_batch(&self, batch_id: BatchId) -> Result<Vec<JobDefinition>, StoreError>;

    fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Live jobs matching `query`, ordered by id (creation order).
    fn list_jobs(&self, query: &JobQuery, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Number of live jobs of a job definition.
    fn count_jobs(&self, job_definition_id: JobDefinitionId) -> Result<u64, StoreError>;

    /// Up to `limit` jobs acquirable at `now`, oldest due first.
    fn acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Claim a job for `owner` if its revision still equals `expected_revision`
    /// and no unexpired lock is held. Losing the race yields `Ok(None)`.
    fn try_lock_job(
        &self,
        id: JobId,
        expected_revision: u64,
        owner: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    fn batch_variables(&self, batch_id: BatchId) -> Result<Variables, StoreError>;

    fn find_historic_batch(&self, id: BatchId) -> Result<Option<HistoricBatch>, StoreError>;

    fn list_historic_batches(&self, query: &HistoricBatchQuery) -> Result<Vec<HistoricBatch>, StoreError>;

    /// Job log entries matching `query`, in occurrence order.
    fn historic_job_log(&self, query: &HistoricJobLogQuery) -> Result<Vec<HistoricJobLogEntry>, StoreError>;

    fn operation_log(&self, batch_id: BatchId) -> Result<Vec<OperationLogEntry>, StoreError>;

    /// Apply `changes` atomically.
    fn commit(&self, changes: ChangeSet) -> Result<(), StoreError>;
}

impl<S: BatchStore + ?Sized> BatchStore for std::sync::Arc<S> {
    fn find_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        (**self).find_batch(id)
    }

    fn list_batches(&self, query: &BatchQuery) -> Result<Vec<Batch>, StoreError> {
        (**self).list_batches(query)
    }

    fn find_job_definition(&self, id: JobDefinitionId) -> Result<Option<JobDefinition>, StoreError> {
        (**self).find_job_definition(id)
    }

    fn job_definitions_for_batch(&self, batch_id: BatchId) -> Result<Vec<JobDefinition>, StoreError> {
        (**self).job_definitions_for_batch(batch_id)
    }

    fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).find_job(id)
    }

    fn list_jobs(&self, query: &JobQuery, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        (**self).list_jobs(query, now)
    }

    fn count_jobs(&self, job_definition_id: JobDefinitionId) -> Result<u64, StoreError> {
        (**self).count_jobs(job_definition_id)
    }

    fn acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).acquirable_jobs(now, limit)
    }

    fn try_lock_job(
        &self,
        id: JobId,
        expected_revision: u64,
        owner: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        (**self).try_lock_job(id, expected_revision, owner, now, lock_until)
    }

    fn batch_variables(&self, batch_id: BatchId) -> Result<Variables, StoreError> {
        (**self).batch_variables(batch_id)
    }

    fn find_historic_batch(&self, id: BatchId) -> Result<Option<HistoricBatch>, StoreError> {
        (**self).find_historic_batch(id)
    }

    fn list_historic_batches(&self, query: &HistoricBatchQuery) -> Result<Vec<HistoricBatch>, StoreError> {
        (**self).list_historic_batches(query)
    }

    fn historic_job_log(&self, query: &HistoricJobLogQuery) -> Result<Vec<HistoricJobLogEntry>, StoreError> {
        (**self).historic_job_log(query)
    }

    fn operation_log(&self, batch_id: BatchId) -> Result<Vec<OperationLogEntry>, StoreError> {
        (**self).operation_log(batch_id)
    }

    fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        (**self).commit(changes)
    }
}
