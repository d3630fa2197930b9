//! In-memory batch store for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use forgebatch_batch::{Batch, Variables};
use forgebatch_core::{BatchId, ExpectedVersion, JobDefinitionId, JobId};
use forgebatch_events::{EventEnvelope, HistoryEvent, ProjectionRunner};

use super::{
    BatchQuery, BatchStore, Change, ChangeSet, HistoricBatchQuery, HistoricJobLogQuery, JobQuery,
    StoreError,
};
use crate::jobs::{Job, JobDefinition};
use crate::projections::{HistoricBatch, HistoricJobLogEntry, HistoryProjection, OperationLogEntry};

#[derive(Debug)]
struct Tables {
    batches: BTreeMap<BatchId, Batch>,
    job_definitions: BTreeMap<JobDefinitionId, JobDefinition>,
    jobs: BTreeMap<JobId, Job>,
    variables: HashMap<BatchId, Variables>,
    history: ProjectionRunner<HistoryProjection>,
    next_sequence: u64,
}

/// Previous row state, restored when a commit fails halfway.
enum Undo {
    Batch(BatchId, Option<Batch>),
    JobDefinition(JobDefinitionId, Option<JobDefinition>),
    Job(JobId, Option<Job>),
    Variables(BatchId, Option<Variables>),
}

/// In-memory batch store.
///
/// A single `RwLock` guards every table so a commit is atomic with respect to
/// readers and to lock claims.
#[derive(Debug)]
pub struct InMemoryBatchStore {
    tables: RwLock<Tables>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                batches: BTreeMap::new(),
                job_definitions: BTreeMap::new(),
                jobs: BTreeMap::new(),
                variables: HashMap::new(),
                history: ProjectionRunner::new(HistoryProjection::new()),
                next_sequence: 1,
            }),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
    }
}

impl Default for InMemoryBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check(expected: ExpectedVersion, actual: u64, what: impl FnOnce() -> String) -> Result<(), StoreError> {
    if expected.matches(actual) {
        Ok(())
    } else {
        Err(StoreError::Concurrency(format!(
            "{}: expected {expected:?}, found revision {actual}",
            what()
        )))
    }
}

impl Tables {
    fn apply(&mut self, change: Change, undo: &mut Vec<Undo>) -> Result<(), StoreError> {
        match change {
            Change::InsertBatch(batch) => {
                if self.batches.contains_key(&batch.id) {
                    return Err(StoreError::AlreadyExists(format!("batch {}", batch.id)));
                }
                undo.push(Undo::Batch(batch.id, None));
                self.batches.insert(batch.id, batch);
            }
            Change::UpdateBatch { mut batch, expected } => {
                let current = self
                    .batches
                    .get(&batch.id)
                    .ok_or_else(|| StoreError::NotFound(format!("batch {}", batch.id)))?;
                check(expected, current.revision, || format!("batch {}", batch.id))?;
                batch.revision = current.revision + 1;
                let previous = self.batches.insert(batch.id, batch.clone());
                undo.push(Undo::Batch(batch.id, previous));
            }
            Change::MarkBatchExecutionStarted { batch_id, at } => {
                if let Some(batch) = self.batches.get_mut(&batch_id) {
                    if batch.execution_start_time.is_none() {
                        undo.push(Undo::Batch(batch_id, Some(batch.clone())));
                        batch.execution_start_time = Some(at);
                    }
                }
            }
            Change::DeleteBatch { id, expected } => {
                let current = self
                    .batches
                    .get(&id)
                    .ok_or_else(|| StoreError::NotFound(format!("batch {id}")))?;
                check(expected, current.revision, || format!("batch {id}"))?;
                let previous = self.batches.remove(&id);
                undo.push(Undo::Batch(id, previous));
            }
            Change::InsertJobDefinition(definition) => {
                if self.job_definitions.contains_key(&definition.id) {
                    return Err(StoreError::AlreadyExists(format!(
                        "job definition {}",
                        definition.id
                    )));
                }
                undo.push(Undo::JobDefinition(definition.id, None));
                self.job_definitions.insert(definition.id, definition);
            }
            Change::SetJobDefinitionSuspended { id, suspended } => {
                if let Some(definition) = self.job_definitions.get_mut(&id) {
                    undo.push(Undo::JobDefinition(id, Some(definition.clone())));
                    definition.suspended = suspended;
                }
            }
            Change::DeleteJobDefinition(id) => {
                if let Some(previous) = self.job_definitions.remove(&id) {
                    undo.push(Undo::JobDefinition(id, Some(previous)));
                }
            }
            Change::InsertJob(job) => {
                if self.jobs.contains_key(&job.id) {
                    return Err(StoreError::AlreadyExists(format!("job {}", job.id)));
                }
                undo.push(Undo::Job(job.id, None));
                self.jobs.insert(job.id, job);
            }
            Change::UpdateJob { mut job, expected } => {
                let current = self
                    .jobs
                    .get(&job.id)
                    .ok_or_else(|| StoreError::NotFound(format!("job {}", job.id)))?;
                check(expected, current.revision, || format!("job {}", job.id))?;
                job.revision = current.revision + 1;
                let previous = self.jobs.insert(job.id, job.clone());
                undo.push(Undo::Job(job.id, previous));
            }
            Change::SetJobRetries { id, retries } => {
                let job = self
                    .jobs
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
                undo.push(Undo::Job(id, Some(job.clone())));
                job.retries = retries;
                job.revision += 1;
            }
            Change::DeleteJob { id, expected } => {
                let current = self
                    .jobs
                    .get(&id)
                    .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
                check(expected, current.revision, || format!("job {id}"))?;
                let previous = self.jobs.remove(&id);
                undo.push(Undo::Job(id, previous));
            }
            Change::DeleteJobsByDefinition(definition_id) => {
                let ids: Vec<JobId> = self
                    .jobs
                    .values()
                    .filter(|j| j.job_definition_id == definition_id)
                    .map(|j| j.id)
                    .collect();
                for id in ids {
                    let previous = self.jobs.remove(&id);
                    undo.push(Undo::Job(id, previous));
                }
            }
            Change::SetJobsSuspendedByDefinition {
                job_definition_id,
                suspended,
            } => {
                for job in self
                    .jobs
                    .values_mut()
                    .filter(|j| j.job_definition_id == job_definition_id && j.suspended != suspended)
                {
                    undo.push(Undo::Job(job.id, Some(job.clone())));
                    job.suspended = suspended;
                    job.revision += 1;
                }
            }
            Change::PutVariables { batch_id, variables } => {
                let previous = self.variables.insert(batch_id, variables);
                undo.push(Undo::Variables(batch_id, previous));
            }
            Change::DeleteVariables(batch_id) => {
                if let Some(previous) = self.variables.remove(&batch_id) {
                    undo.push(Undo::Variables(batch_id, Some(previous)));
                }
            }
            // recorded after all row changes succeeded
            Change::Record(_) => {}
        }
        Ok(())
    }

    fn rollback(&mut self, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Batch(id, Some(row)) => {
                    self.batches.insert(id, row);
                }
                Undo::Batch(id, None) => {
                    self.batches.remove(&id);
                }
                Undo::JobDefinition(id, Some(row)) => {
                    self.job_definitions.insert(id, row);
                }
                Undo::JobDefinition(id, None) => {
                    self.job_definitions.remove(&id);
                }
                Undo::Job(id, Some(row)) => {
                    self.jobs.insert(id, row);
                }
                Undo::Job(id, None) => {
                    self.jobs.remove(&id);
                }
                Undo::Variables(id, Some(row)) => {
                    self.variables.insert(id, row);
                }
                Undo::Variables(id, None) => {
                    self.variables.remove(&id);
                }
            }
        }
    }

    fn record(&mut self, event: HistoryEvent) -> Result<(), StoreError> {
        let sequence_number = self.next_sequence;
        let envelope = EventEnvelope::new(Uuid::now_v7(), event.batch_id(), sequence_number, event);
        self.history
            .apply(&envelope)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.next_sequence += 1;
        Ok(())
    }
}

impl BatchStore for InMemoryBatchStore {
    fn find_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        Ok(self.read()?.batches.get(&id).cloned())
    }

    fn list_batches(&self, query: &BatchQuery) -> Result<Vec<Batch>, StoreError> {
        Ok(self
            .read()?
            .batches
            .values()
            .filter(|b| query.matches(b))
            .cloned()
            .collect())
    }

    fn find_job_definition(&self, id: JobDefinitionId) -> Result<Option<JobDefinition>, StoreError> {
        Ok(self.read()?.job_definitions.get(&id).cloned())
    }

    fn job_definitions_for_batch(&self, batch_id: BatchId) -> Result<Vec<JobDefinition>, StoreError> {
        Ok(self
            .read()?
            .job_definitions
            .values()
            .filter(|d| d.configuration == batch_id)
            .cloned()
            .collect())
    }

    fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    fn list_jobs(&self, query: &JobQuery, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .read()?
            .jobs
            .values()
            .filter(|j| query.matches(j, now))
            .cloned()
            .collect())
    }

    fn count_jobs(&self, job_definition_id: JobDefinitionId) -> Result<u64, StoreError> {
        Ok(self
            .read()?
            .jobs
            .values()
            .filter(|j| j.job_definition_id == job_definition_id)
            .count() as u64)
    }

    fn acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let tables = self.read()?;
        let mut candidates: Vec<&Job> = tables.jobs.values().filter(|j| j.is_acquirable(now)).collect();
        // Oldest due first; jobs without a due date are due since creation.
        candidates.sort_by_key(|j| (j.due_date.unwrap_or(j.created_at), j.id));
        Ok(candidates.into_iter().take(limit).cloned().collect())
    }

    fn try_lock_job(
        &self,
        id: JobId,
        expected_revision: u64,
        owner: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut tables = self.write()?;
        let Some(job) = tables.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.revision != expected_revision || job.is_locked(now) {
            debug!(job_id = %id, expected_revision, found = job.revision, "lost lock claim");
            return Ok(None);
        }
        job.lock(owner, lock_until);
        job.revision += 1;
        Ok(Some(job.clone()))
    }

    fn batch_variables(&self, batch_id: BatchId) -> Result<Variables, StoreError> {
        Ok(self
            .read()?
            .variables
            .get(&batch_id)
            .cloned()
            .unwrap_or_default())
    }

    fn find_historic_batch(&self, id: BatchId) -> Result<Option<HistoricBatch>, StoreError> {
        Ok(self.read()?.history.projection().batches.get(id).cloned())
    }

    fn list_historic_batches(&self, query: &HistoricBatchQuery) -> Result<Vec<HistoricBatch>, StoreError> {
        Ok(self.read()?.history.projection().batches.list(query))
    }

    fn historic_job_log(&self, query: &HistoricJobLogQuery) -> Result<Vec<HistoricJobLogEntry>, StoreError> {
        Ok(self.read()?.history.projection().job_log.query(query))
    }

    fn operation_log(&self, batch_id: BatchId) -> Result<Vec<OperationLogEntry>, StoreError> {
        Ok(self.read()?.history.projection().operations.for_batch(batch_id))
    }

    fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let (events, rows): (Vec<Change>, Vec<Change>) = changes
            .into_changes()
            .into_iter()
            .partition(|c| matches!(c, Change::Record(_)));

        let mut tables = self.write()?;
        // Sequence numbers are consecutive, so the first one decides for all.
        if !events.is_empty() {
            let next = tables.next_sequence;
            tables
                .history
                .check_next(next)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }

        let mut undo = Vec::new();
        for change in rows {
            if let Err(e) = tables.apply(change, &mut undo) {
                tables.rollback(undo);
                return Err(e);
            }
        }

        for change in events {
            if let Change::Record(event) = change {
                if let Err(e) = tables.record(event) {
                    tables.rollback(undo);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
