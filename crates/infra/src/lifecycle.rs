//! Batch lifecycle: create, suspend/activate, delete, delete history.

use std::collections::BTreeMap;

use tracing::{debug, info};

use forgebatch_batch::{Batch, BatchConfiguration, NewBatch};
use forgebatch_core::{BatchId, DomainError, ExpectedVersion, JobId};
use forgebatch_events::{
    BatchEnded, BatchStarted, HistoryEvent, HistoryRemoved, JobLogKind, JobLogged, OperationLogged,
};

use crate::engine::{EngineError, EngineRuntime};
use crate::jobs::{Job, JobDefinition};
use crate::projections::CREATE_BATCH_OPERATION;
use crate::store::{BatchStore, Change, HistoricJobLogQuery};
use crate::uow::UnitOfWork;

/// Validate and atomically persist a batch, its three job definitions, the
/// initial seed job and its variables.
pub fn create_batch<S: BatchStore>(rt: &EngineRuntime<S>, request: NewBatch) -> Result<Batch, EngineError> {
    request.validate()?;
    if !rt.operations.contains(&request.batch_type) {
        return Err(DomainError::validation(format!(
            "no bulk operation registered for batch type '{}'",
            request.batch_type
        ))
        .into());
    }

    let now = rt.clock.now();
    let id = BatchId::new();
    let seed_definition = JobDefinition::seed(id);
    let monitor_definition = JobDefinition::monitor(id);
    let work_definition = JobDefinition::work_item(id, &request.batch_type);

    let mut batch = Batch {
        id,
        batch_type: request.batch_type.clone(),
        total_size: request.items.len() as u64,
        batch_jobs_per_seed: request
            .batch_jobs_per_seed
            .unwrap_or(rt.config.batch_jobs_per_seed),
        invocations_per_batch_job: request
            .invocations_per_batch_job
            .unwrap_or(rt.config.invocations_per_batch_job),
        seed_job_definition_id: seed_definition.id,
        monitor_job_definition_id: monitor_definition.id,
        batch_job_definition_id: work_definition.id,
        configuration_payload: Vec::new(),
        jobs_created: 0,
        suspended: false,
        start_time: now,
        execution_start_time: None,
        revision: 0,
    };
    batch.set_configuration(&BatchConfiguration::new(request.items))?;

    let mut uow = UnitOfWork::begin(&rt.store, now);
    uow.push(Change::InsertBatch(batch.clone()));
    uow.record(HistoryEvent::BatchStarted(BatchStarted {
        batch_id: id,
        batch_type: batch.batch_type.clone(),
        size: batch.total_size,
        batch_jobs_per_seed: batch.batch_jobs_per_seed,
        invocations_per_batch_job: batch.invocations_per_batch_job,
        seed_job_definition_id: seed_definition.id,
        monitor_job_definition_id: monitor_definition.id,
        batch_job_definition_id: work_definition.id,
        occurred_at: now,
    }));

    let seed = Job::new(&seed_definition, rt.config.retry.retries, now);
    for definition in [seed_definition, monitor_definition, work_definition] {
        uow.push(Change::InsertJobDefinition(definition));
    }
    uow.insert_job(seed);

    let mut properties = BTreeMap::from([
        ("type".to_string(), batch.batch_type.clone()),
        ("nr_of_instances".to_string(), batch.total_size.to_string()),
        ("async".to_string(), "true".to_string()),
    ]);
    if let Some(variables) = request.variables {
        properties.insert("nr_of_variables".to_string(), variables.len().to_string());
        uow.push(Change::PutVariables {
            batch_id: id,
            variables,
        });
    }
    uow.record(HistoryEvent::OperationLogged(OperationLogged {
        batch_id: id,
        operation: CREATE_BATCH_OPERATION.to_string(),
        properties,
        occurred_at: now,
    }));

    uow.commit()?;

    info!(
        batch_id = %id,
        batch_type = %batch.batch_type,
        size = batch.total_size,
        jobs = batch.total_jobs(),
        "batch created"
    );
    Ok(batch)
}

/// Flip the suspension state of a batch, its job definitions and live jobs.
pub fn set_suspended<S: BatchStore>(
    rt: &EngineRuntime<S>,
    id: BatchId,
    suspended: bool,
) -> Result<(), EngineError> {
    let mut batch = rt
        .store
        .find_batch(id)?
        .ok_or_else(|| DomainError::not_found(format!("batch {id}")))?;
    if batch.suspended == suspended {
        return Ok(());
    }

    let mut uow = UnitOfWork::begin(&rt.store, rt.clock.now());
    batch.suspended = suspended;
    let definition_ids = batch.job_definition_ids();
    uow.update_batch(batch);
    for job_definition_id in definition_ids {
        uow.push(Change::SetJobDefinitionSuspended {
            id: job_definition_id,
            suspended,
        });
        uow.push(Change::SetJobsSuspendedByDefinition {
            job_definition_id,
            suspended,
        });
    }
    uow.commit()?;

    info!(batch_id = %id, suspended, "batch suspension changed");
    Ok(())
}

/// Attempts `delete_batch` makes when a concurrent seed or suspension bumps the
/// batch revision between its read and its commit.
const DELETE_ATTEMPTS: usize = 3;

/// Delete a live batch.
///
/// Ends the historic batch if still running, appends one `deletion` log entry
/// per job definition with log history, then removes the batch, its job
/// definitions, pending jobs and variables. With `cascade_history` the
/// historic batch and its logs are purged as well.
///
/// The commit is guarded on the batch revision read here: a batch finalized
/// by its monitor in between is reported as not found and nothing is logged.
pub fn delete_batch<S: BatchStore>(
    rt: &EngineRuntime<S>,
    id: BatchId,
    cascade_history: bool,
) -> Result<(), EngineError> {
    let mut attempt = 1;
    loop {
        match try_delete_batch(rt, id, cascade_history) {
            Err(EngineError::Store(e)) if e.is_concurrency() && attempt < DELETE_ATTEMPTS => {
                debug!(batch_id = %id, attempt, error = %e, "batch changed during delete, retrying");
                attempt += 1;
            }
            Err(EngineError::Store(e)) if e.is_not_found() => {
                return Err(DomainError::not_found(format!("batch {id}")).into());
            }
            result => return result,
        }
    }
}

fn try_delete_batch<S: BatchStore>(
    rt: &EngineRuntime<S>,
    id: BatchId,
    cascade_history: bool,
) -> Result<(), EngineError> {
    let batch = rt
        .store
        .find_batch(id)?
        .ok_or_else(|| DomainError::not_found(format!("batch {id}")))?;

    let now = rt.clock.now();
    let mut uow = UnitOfWork::begin(&rt.store, now);

    let historic = rt.store.find_historic_batch(id)?;
    if historic.is_some_and(|h| h.end_time.is_none()) {
        uow.record(HistoryEvent::BatchEnded(BatchEnded {
            batch_id: id,
            occurred_at: now,
        }));
    }

    for job_definition_id in batch.job_definition_ids() {
        let log = rt
            .store
            .historic_job_log(&HistoricJobLogQuery::for_job_definition(job_definition_id))?;
        if let Some(last) = log.last() {
            uow.record(HistoryEvent::JobLogged(JobLogged {
                job_id: last.job_id,
                job_definition_id,
                job_definition_type: last.job_definition_type.clone(),
                batch_id: id,
                kind: JobLogKind::Deletion,
                retries: last.retries,
                exception_message: None,
                occurred_at: now,
            }));
        }
        uow.push(Change::DeleteJobsByDefinition(job_definition_id));
        uow.push(Change::DeleteJobDefinition(job_definition_id));
    }
    uow.push(Change::DeleteVariables(id));
    uow.push(Change::DeleteBatch {
        id,
        expected: ExpectedVersion::Exact(batch.revision),
    });
    if cascade_history {
        uow.record(HistoryEvent::HistoryRemoved(HistoryRemoved {
            batch_id: id,
            occurred_at: now,
        }));
    }
    uow.commit()?;

    info!(batch_id = %id, cascade_history, "batch deleted");
    Ok(())
}

/// Operator removal of a single job.
///
/// Appends a `deletion` log entry and drops the row with its payload. A job
/// locked by an executor cannot be deleted until its lock is released or
/// expires.
pub fn delete_job<S: BatchStore>(rt: &EngineRuntime<S>, id: JobId) -> Result<(), EngineError> {
    let job = rt
        .store
        .find_job(id)?
        .ok_or_else(|| DomainError::not_found(format!("job {id}")))?;
    let now = rt.clock.now();
    if job.is_locked(now) {
        return Err(DomainError::conflict(format!("job {id} is being executed")).into());
    }

    let mut uow = UnitOfWork::begin(&rt.store, now);
    uow.log_job(&job, JobLogKind::Deletion, None);
    uow.push(Change::DeleteJob {
        id,
        expected: ExpectedVersion::Exact(job.revision),
    });
    match uow.commit() {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Err(DomainError::not_found(format!("job {id}")).into()),
        Err(e) if e.is_concurrency() => {
            return Err(DomainError::conflict(format!("job {id} changed during delete")).into());
        }
        Err(e) => return Err(e.into()),
    }

    info!(job_id = %id, batch_id = %job.batch_id, job_type = %job.job_type, "job deleted");
    Ok(())
}

/// Purge a finished batch's history.
///
/// Fails with NotFound while the live batch still exists.
pub fn delete_historic_batch<S: BatchStore>(rt: &EngineRuntime<S>, id: BatchId) -> Result<(), EngineError> {
    if rt.store.find_batch(id)?.is_some() {
        return Err(DomainError::not_found(format!(
            "historic batch {id} (batch is still running)"
        ))
        .into());
    }
    if rt.store.find_historic_batch(id)?.is_none() {
        return Err(DomainError::not_found(format!("historic batch {id}")).into());
    }

    let now = rt.clock.now();
    let mut uow = UnitOfWork::begin(&rt.store, now);
    uow.record(HistoryEvent::HistoryRemoved(HistoryRemoved {
        batch_id: id,
        occurred_at: now,
    }));
    uow.commit()?;

    info!(batch_id = %id, "historic batch deleted");
    Ok(())
}
