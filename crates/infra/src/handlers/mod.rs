//! Batch job handlers.
//!
//! Every batch owns three job definitions: one seed, one monitor and one for
//! work items. A job is dispatched on its definition kind; handlers stage
//! their writes on the caller's [`UnitOfWork`] and report whether the job row
//! should be removed or kept.

pub mod monitor;
pub mod seed;
pub mod work_item;

use chrono::{DateTime, Utc};

use forgebatch_batch::{ItemError, WorkItemShard};
use forgebatch_core::DomainError;

use crate::config::EngineConfig;
use crate::engine::OperationRegistry;
use crate::jobs::{Job, JobDefinitionKind};
use crate::store::{BatchStore, StoreError};
use crate::uow::UnitOfWork;

/// What happens to the job row after a successful execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Delete the job.
    Remove,
    /// Keep the job, unlocked, due at `due_date` (`None` = immediately).
    Keep { due_date: Option<DateTime<Utc>> },
}

/// Handler failure. Rolls back the handler's unit of work and costs one retry.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// An item of a work-item shard failed; `remaining` starts with that item.
    #[error("{error}")]
    Item {
        error: ItemError,
        remaining: Vec<String>,
    },
    #[error("no bulk operation registered for batch type '{0}'")]
    UnknownOperation(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    /// Text stored as the job's exception message.
    pub fn exception_message(&self) -> String {
        self.to_string()
    }

    /// Replacement payload for the failed job: the not-yet-applied items.
    pub fn trimmed_payload(&self) -> Option<Result<Vec<u8>, DomainError>> {
        match self {
            JobError::Item { remaining, .. } => Some(
                WorkItemShard {
                    items: remaining.clone(),
                }
                .to_bytes(),
            ),
            _ => None,
        }
    }
}

/// Engine collaborators visible to handlers.
#[derive(Clone, Copy)]
pub struct HandlerContext<'a> {
    pub config: &'a EngineConfig,
    pub operations: &'a OperationRegistry,
}

/// Run the handler for `job`'s definition kind.
pub fn dispatch<S: BatchStore + ?Sized>(
    job: &Job,
    uow: &mut UnitOfWork<'_, S>,
    ctx: HandlerContext<'_>,
) -> Result<JobOutcome, JobError> {
    match job.kind {
        JobDefinitionKind::Seed => seed::execute(job, uow, ctx),
        JobDefinitionKind::WorkItem => work_item::execute(job, uow, ctx),
        JobDefinitionKind::Monitor => monitor::execute(job, uow, ctx),
    }
}
