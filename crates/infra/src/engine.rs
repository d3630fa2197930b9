//! Batch engine: the management surface over a [`BatchStore`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use forgebatch_batch::{Batch, BatchStatistics, BulkOperation, NewBatch, Variables};
use forgebatch_core::{BatchId, DomainError, JobId, SharedClock, SystemClock};
use forgebatch_events::JobLogKind;

use crate::config::EngineConfig;
use crate::jobs::executor::{self, ExecutionOutcome};
use crate::jobs::{Job, JobDefinition, due_after};
use crate::lifecycle;
use crate::projections::{HistoricBatch, HistoricJobLogEntry, OperationLogEntry};
use crate::store::{
    BatchQuery, BatchStore, Change, ChangeSet, HistoricBatchQuery, HistoricJobLogQuery, JobQuery,
    StoreError,
};

/// Engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job {0} is locked by another owner")]
    JobLocked(JobId),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::Domain(DomainError::NotFound(_)) | EngineError::Store(StoreError::NotFound(_))
        )
    }
}

/// Bulk operations keyed by batch type.
#[derive(Default, Clone)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn BulkOperation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `operation` under its batch type, replacing any previous one.
    pub fn register(&mut self, operation: Arc<dyn BulkOperation>) {
        self.operations
            .insert(operation.batch_type().to_string(), operation);
    }

    pub fn get(&self, batch_type: &str) -> Option<&Arc<dyn BulkOperation>> {
        self.operations.get(batch_type)
    }

    pub fn contains(&self, batch_type: &str) -> bool {
        self.operations.contains_key(batch_type)
    }

    pub fn batch_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("batch_types", &self.batch_types())
            .finish()
    }
}

/// State shared by the engine facade, the executor and worker tasks.
#[derive(Debug)]
pub struct EngineRuntime<S> {
    pub store: S,
    pub config: EngineConfig,
    pub clock: SharedClock,
    pub operations: OperationRegistry,
}

/// Builder for [`BatchEngine`].
pub struct BatchEngineBuilder<S> {
    store: S,
    config: EngineConfig,
    clock: SharedClock,
    operations: OperationRegistry,
}

impl<S: BatchStore + 'static> BatchEngineBuilder<S> {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn operation(mut self, operation: impl BulkOperation) -> Self {
        self.operations.register(Arc::new(operation));
        self
    }

    pub fn build(self) -> BatchEngine<S> {
        BatchEngine {
            runtime: Arc::new(EngineRuntime {
                store: self.store,
                config: self.config,
                clock: self.clock,
                operations: self.operations,
            }),
        }
    }
}

/// Management surface of the batch engine.
///
/// Cheap to clone; clones share the store, clock and operations.
#[derive(Debug)]
pub struct BatchEngine<S> {
    runtime: Arc<EngineRuntime<S>>,
}

impl<S> Clone for BatchEngine<S> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
        }
    }
}

impl<S: BatchStore + 'static> BatchEngine<S> {
    pub fn builder(store: S) -> BatchEngineBuilder<S> {
        BatchEngineBuilder {
            store,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            operations: OperationRegistry::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<EngineRuntime<S>> {
        &self.runtime
    }

    pub fn store(&self) -> &S {
        &self.runtime.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.runtime.config
    }

    /// Validate and persist a new batch with its initial seed job.
    pub fn create_batch(&self, request: NewBatch) -> Result<Batch, EngineError> {
        lifecycle::create_batch(&self.runtime, request)
    }

    pub fn get_batch(&self, id: BatchId) -> Result<Batch, EngineError> {
        self.runtime
            .store
            .find_batch(id)?
            .ok_or_else(|| DomainError::not_found(format!("batch {id}")).into())
    }

    pub fn list_batches(&self, query: &BatchQuery) -> Result<Vec<Batch>, EngineError> {
        Ok(self.runtime.store.list_batches(query)?)
    }

    pub fn delete_batch(&self, id: BatchId, cascade_history: bool) -> Result<(), EngineError> {
        lifecycle::delete_batch(&self.runtime, id, cascade_history)
    }

    pub fn suspend_batch(&self, id: BatchId) -> Result<(), EngineError> {
        lifecycle::set_suspended(&self.runtime, id, true)
    }

    pub fn activate_batch(&self, id: BatchId) -> Result<(), EngineError> {
        lifecycle::set_suspended(&self.runtime, id, false)
    }

    /// Operator override of a job's retry budget.
    ///
    /// Zero parks the job as a terminal failure; a positive value makes a
    /// failed job acquirable again.
    ///
    /// Only the retry budget is written, so a lock taken by an executor in the
    /// meantime survives the override.
    pub fn set_job_retries(&self, job_id: JobId, retries: u32) -> Result<(), EngineError> {
        let changes = ChangeSet::from(vec![Change::SetJobRetries { id: job_id, retries }]);
        match self.runtime.store.commit(changes) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                return Err(DomainError::not_found(format!("job {job_id}")).into());
            }
            Err(e) => return Err(e.into()),
        }
        debug!(job_id = %job_id, retries, "job retries set");
        Ok(())
    }

    pub fn delete_job(&self, job_id: JobId) -> Result<(), EngineError> {
        lifecycle::delete_job(&self.runtime, job_id)
    }

    pub fn get_job(&self, job_id: JobId) -> Result<Job, EngineError> {
        self.runtime
            .store
            .find_job(job_id)?
            .ok_or_else(|| DomainError::not_found(format!("job {job_id}")).into())
    }

    pub fn query_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, EngineError> {
        Ok(self.runtime.store.list_jobs(query, self.runtime.clock.now())?)
    }

    pub fn job_definitions(&self, batch_id: BatchId) -> Result<Vec<JobDefinition>, EngineError> {
        Ok(self.runtime.store.job_definitions_for_batch(batch_id)?)
    }

    pub fn batch_variables(&self, batch_id: BatchId) -> Result<Variables, EngineError> {
        Ok(self.runtime.store.batch_variables(batch_id)?)
    }

    /// Execute one job on the caller's thread, through the same lock claim and
    /// commit path the background executor uses. Due date is ignored.
    pub fn execute_job(&self, job_id: JobId) -> Result<ExecutionOutcome, EngineError> {
        let rt = &self.runtime;
        let job = self.get_job(job_id)?;
        let now = rt.clock.now();
        let locked = rt
            .store
            .try_lock_job(
                job_id,
                job.revision,
                &rt.config.lock_owner,
                now,
                due_after(now, rt.config.lock_time),
            )?
            .ok_or(EngineError::JobLocked(job_id))?;
        Ok(executor::run_job(rt, locked))
    }

    pub fn query_historic_batch(&self, id: BatchId) -> Result<HistoricBatch, EngineError> {
        self.runtime
            .store
            .find_historic_batch(id)?
            .ok_or_else(|| DomainError::not_found(format!("historic batch {id}")).into())
    }

    pub fn list_historic_batches(&self, query: &HistoricBatchQuery) -> Result<Vec<HistoricBatch>, EngineError> {
        Ok(self.runtime.store.list_historic_batches(query)?)
    }

    /// Job log entries in occurrence order.
    pub fn query_historic_job_log(
        &self,
        query: &HistoricJobLogQuery,
    ) -> Result<Vec<HistoricJobLogEntry>, EngineError> {
        Ok(self.runtime.store.historic_job_log(query)?)
    }

    pub fn delete_historic_batch(&self, id: BatchId) -> Result<(), EngineError> {
        lifecycle::delete_historic_batch(&self.runtime, id)
    }

    pub fn operation_log(&self, batch_id: BatchId) -> Result<Vec<OperationLogEntry>, EngineError> {
        Ok(self.runtime.store.operation_log(batch_id)?)
    }

    /// Progress of every live batch matching `query`.
    pub fn batch_statistics(&self, query: &BatchQuery) -> Result<Vec<BatchStatistics>, EngineError> {
        let store = &self.runtime.store;
        let now = self.runtime.clock.now();
        let mut statistics = Vec::new();
        for batch in store.list_batches(query)? {
            let completed = store
                .historic_job_log(
                    &HistoricJobLogQuery::for_job_definition(batch.batch_job_definition_id)
                        .kind(JobLogKind::Success),
                )?
                .len() as u64;
            let failed = store
                .list_jobs(
                    &JobQuery::for_job_definition(batch.batch_job_definition_id).no_retries_left(),
                    now,
                )?
                .len() as u64;
            statistics.push(BatchStatistics::compute(&batch, completed, failed));
        }
        Ok(statistics)
    }
}
