//! Seed job: incrementally partitions a batch into work-item jobs.
//!
//! Each invocation creates at most `batch_jobs_per_seed` work-item jobs from
//! the configuration cursor and advances the cursor in the same unit of work,
//! so a rolled-back invocation never double-creates jobs. While items remain
//! the seed stays due immediately; the invocation that exhausts the item list
//! removes the seed and creates the monitor job.

use tracing::debug;

use forgebatch_core::DomainError;

use super::{HandlerContext, JobError, JobOutcome};
use crate::jobs::{Job, due_after};
use crate::store::BatchStore;
use crate::uow::UnitOfWork;

pub fn execute<S: BatchStore + ?Sized>(
    job: &Job,
    uow: &mut UnitOfWork<'_, S>,
    ctx: HandlerContext<'_>,
) -> Result<JobOutcome, JobError> {
    let store = uow.store();
    let Some(mut batch) = store.find_batch(job.batch_id)? else {
        debug!(job_id = %job.id, batch_id = %job.batch_id, "batch gone, dropping seed job");
        return Ok(JobOutcome::Remove);
    };

    let work_definition = store
        .find_job_definition(batch.batch_job_definition_id)?
        .ok_or_else(|| {
            DomainError::not_found(format!(
                "work item job definition {}",
                batch.batch_job_definition_id
            ))
        })?;

    let mut configuration = batch.configuration()?;
    let plan = configuration.plan_seed(batch.batch_jobs_per_seed, batch.invocations_per_batch_job);
    let now = uow.now();

    for shard in &plan.shards {
        let work_item = Job::new(&work_definition, ctx.config.retry.retries, now)
            .with_payload(shard.to_bytes()?)
            .with_suspended(batch.suspended);
        uow.insert_job(work_item);
    }

    configuration.advance_to(plan.next_cursor)?;
    batch.set_configuration(&configuration)?;
    batch.jobs_created += plan.jobs() as u64;

    debug!(
        batch_id = %batch.id,
        created = plan.jobs(),
        remaining = configuration.remaining(),
        "seed job created work item jobs"
    );

    let exhausted = configuration.is_exhausted();
    let suspended = batch.suspended;
    let monitor_definition_id = batch.monitor_job_definition_id;
    uow.update_batch(batch);

    if !exhausted {
        return Ok(JobOutcome::Keep { due_date: None });
    }

    let monitor_definition = store
        .find_job_definition(monitor_definition_id)?
        .ok_or_else(|| {
            DomainError::not_found(format!("monitor job definition {monitor_definition_id}"))
        })?;
    let monitor = Job::new(&monitor_definition, ctx.config.retry.retries, now)
        .with_due_date(due_after(now, ctx.config.batch_poll_interval))
        .with_suspended(suspended);
    uow.insert_job(monitor);

    Ok(JobOutcome::Remove)
}
