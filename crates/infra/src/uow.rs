//! Unit of work: buffered changes committed as one [`ChangeSet`].
//!
//! Handlers never write to the store directly. They read through
//! [`UnitOfWork::store`] and stage writes; the executor commits on success.
//! Dropping an uncommitted unit of work discards its changes.

use chrono::{DateTime, Utc};
use tracing::debug;

use forgebatch_batch::Batch;
use forgebatch_core::ExpectedVersion;
use forgebatch_events::{HistoryEvent, JobLogKind, JobLogged};

use crate::jobs::Job;
use crate::store::{BatchStore, Change, ChangeSet, StoreError};

pub struct UnitOfWork<'s, S: BatchStore + ?Sized> {
    store: &'s S,
    now: DateTime<Utc>,
    changes: ChangeSet,
    committed: bool,
}

impl<'s, S: BatchStore + ?Sized> UnitOfWork<'s, S> {
    /// Start a unit of work; `now` is the timestamp of everything it records.
    pub fn begin(store: &'s S, now: DateTime<Utc>) -> Self {
        Self {
            store,
            now,
            changes: ChangeSet::new(),
            committed: false,
        }
    }

    /// Committed state. Staged changes are not visible here.
    pub fn store(&self) -> &'s S {
        self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn record(&mut self, event: HistoryEvent) {
        self.changes.push(Change::Record(event));
    }

    pub fn update_batch(&mut self, batch: Batch) {
        let expected = ExpectedVersion::Exact(batch.revision);
        self.push(Change::UpdateBatch { batch, expected });
    }

    /// Stage a new job together with its `creation` log entry.
    pub fn insert_job(&mut self, job: Job) {
        self.log_job(&job, JobLogKind::Creation, None);
        self.push(Change::InsertJob(job));
    }

    /// Stage a job log entry for `job` as it currently stands.
    pub fn log_job(&mut self, job: &Job, kind: JobLogKind, exception_message: Option<String>) {
        self.record(HistoryEvent::JobLogged(JobLogged {
            job_id: job.id,
            job_definition_id: job.job_definition_id,
            job_definition_type: job.job_type.clone(),
            batch_id: job.batch_id,
            kind,
            retries: job.retries,
            exception_message,
            occurred_at: self.now,
        }));
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Commit all staged changes atomically.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.committed = true;
        let changes = std::mem::take(&mut self.changes);
        self.store.commit(changes)
    }

    /// Discard all staged changes.
    pub fn rollback(self) {}
}

impl<S: BatchStore + ?Sized> Drop for UnitOfWork<'_, S> {
    fn drop(&mut self) {
        if !self.committed && !self.changes.is_empty() {
            debug!(changes = self.changes.len(), "unit of work rolled back");
        }
    }
}
