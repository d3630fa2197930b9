//! Work-item job: applies the bulk operation to one shard of items.
//!
//! Items are applied in order and each application commits on its own. The
//! first failing item fails the whole invocation; items applied before it are
//! kept, and the failure carries the not-yet-applied remainder so the retry
//! resumes at the failing item.

use tracing::{debug, warn};

use forgebatch_batch::{ItemContext, WorkItemShard};
use forgebatch_events::{BatchExecutionStarted, HistoryEvent};

use super::{HandlerContext, JobError, JobOutcome};
use crate::jobs::Job;
use crate::store::{BatchStore, Change, ChangeSet};
use crate::uow::UnitOfWork;

pub fn execute<S: BatchStore + ?Sized>(
    job: &Job,
    uow: &mut UnitOfWork<'_, S>,
    ctx: HandlerContext<'_>,
) -> Result<JobOutcome, JobError> {
    let store = uow.store();
    let Some(batch) = store.find_batch(job.batch_id)? else {
        debug!(job_id = %job.id, batch_id = %job.batch_id, "batch gone, dropping work item job");
        return Ok(JobOutcome::Remove);
    };

    let operation = ctx
        .operations
        .get(&batch.batch_type)
        .ok_or_else(|| JobError::UnknownOperation(batch.batch_type.clone()))?;

    if batch.execution_start_time.is_none() {
        // Independent of this invocation's outcome.
        let now = uow.now();
        let mut started = ChangeSet::new();
        started.push(Change::MarkBatchExecutionStarted {
            batch_id: batch.id,
            at: now,
        });
        started.push(Change::Record(HistoryEvent::BatchExecutionStarted(
            BatchExecutionStarted {
                batch_id: batch.id,
                occurred_at: now,
            },
        )));
        if let Err(e) = store.commit(started) {
            warn!(batch_id = %batch.id, error = %e, "failed to record batch execution start");
        }
    }

    let shard = WorkItemShard::from_bytes(&job.payload)?;
    let variables = store.batch_variables(batch.id)?;

    for (index, item_id) in shard.items.iter().enumerate() {
        let item = ItemContext {
            batch_id: batch.id,
            item_id,
            variables: &variables,
        };
        if let Err(error) = operation.apply_item(&item) {
            debug!(
                job_id = %job.id,
                item_id = %item_id,
                applied = index,
                error = %error,
                "work item failed"
            );
            return Err(JobError::Item {
                error,
                remaining: shard.items[index..].to_vec(),
            });
        }
    }

    Ok(JobOutcome::Remove)
}
