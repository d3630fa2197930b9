//! Monitor job: polls for batch completion.
//!
//! While the seed job or any work-item job is still present the monitor
//! reschedules itself one poll interval ahead. Once both are gone it ends the
//! historic batch and removes the live batch, its job definitions and its
//! variables; the executor removes the monitor job itself.

use tracing::{debug, info};

use forgebatch_core::ExpectedVersion;
use forgebatch_events::{BatchEnded, HistoryEvent};

use super::{HandlerContext, JobError, JobOutcome};
use crate::jobs::{Job, due_after};
use crate::store::{BatchStore, Change};
use crate::uow::UnitOfWork;

pub fn execute<S: BatchStore + ?Sized>(
    job: &Job,
    uow: &mut UnitOfWork<'_, S>,
    ctx: HandlerContext<'_>,
) -> Result<JobOutcome, JobError> {
    let store = uow.store();
    let Some(batch) = store.find_batch(job.batch_id)? else {
        debug!(job_id = %job.id, batch_id = %job.batch_id, "batch gone, dropping monitor job");
        return Ok(JobOutcome::Remove);
    };

    let seed_jobs = store.count_jobs(batch.seed_job_definition_id)?;
    let work_item_jobs = store.count_jobs(batch.batch_job_definition_id)?;

    if seed_jobs > 0 || work_item_jobs > 0 {
        let due_date = due_after(uow.now(), ctx.config.batch_poll_interval);
        debug!(
            batch_id = %batch.id,
            seed_jobs,
            work_item_jobs,
            due_date = %due_date,
            "batch still running"
        );
        return Ok(JobOutcome::Keep {
            due_date: Some(due_date),
        });
    }

    uow.record(HistoryEvent::BatchEnded(BatchEnded {
        batch_id: batch.id,
        occurred_at: uow.now(),
    }));
    for definition_id in batch.job_definition_ids() {
        uow.push(Change::DeleteJobDefinition(definition_id));
    }
    uow.push(Change::DeleteVariables(batch.id));
    uow.push(Change::DeleteBatch {
        id: batch.id,
        expected: ExpectedVersion::Exact(batch.revision),
    });

    info!(batch_id = %batch.id, batch_type = %batch.batch_type, "batch completed");
    Ok(JobOutcome::Remove)
}
