//! Query filters for the management surface.

use chrono::{DateTime, Utc};

use forgebatch_batch::Batch;
use forgebatch_core::{BatchId, JobDefinitionId, JobId};
use forgebatch_events::JobLogKind;

use crate::jobs::Job;

/// Filter for live batches. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchQuery {
    pub id: Option<BatchId>,
    pub batch_type: Option<String>,
    pub suspended: Option<bool>,
}

impl BatchQuery {
    pub fn id(mut self, id: BatchId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn batch_type(mut self, batch_type: impl Into<String>) -> Self {
        self.batch_type = Some(batch_type.into());
        self
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = Some(suspended);
        self
    }

    pub fn matches(&self, batch: &Batch) -> bool {
        self.id.is_none_or(|id| id == batch.id)
            && self
                .batch_type
                .as_deref()
                .is_none_or(|t| t == batch.batch_type)
            && self.suspended.is_none_or(|s| s == batch.suspended)
    }
}

/// Filter for live jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub job_definition_id: Option<JobDefinitionId>,
    pub batch_id: Option<BatchId>,
    /// Only jobs with `retries > 0`.
    pub with_retries_left: bool,
    /// Only jobs with `retries == 0`.
    pub no_retries_left: bool,
    /// Only jobs the executor could acquire right now.
    pub executable: bool,
}

impl JobQuery {
    pub fn for_job_definition(id: JobDefinitionId) -> Self {
        Self {
            job_definition_id: Some(id),
            ..Self::default()
        }
    }

    pub fn for_batch(id: BatchId) -> Self {
        Self {
            batch_id: Some(id),
            ..Self::default()
        }
    }

    pub fn with_retries_left(mut self) -> Self {
        self.with_retries_left = true;
        self
    }

    pub fn no_retries_left(mut self) -> Self {
        self.no_retries_left = true;
        self
    }

    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    pub fn matches(&self, job: &Job, now: DateTime<Utc>) -> bool {
        self.job_definition_id
            .is_none_or(|id| id == job.job_definition_id)
            && self.batch_id.is_none_or(|id| id == job.batch_id)
            && (!self.with_retries_left || job.retries > 0)
            && (!self.no_retries_left || job.retries == 0)
            && (!self.executable || job.is_acquirable(now))
    }
}

/// Filter for historic batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoricBatchQuery {
    pub batch_type: Option<String>,
    pub completed: Option<bool>,
}

impl HistoricBatchQuery {
    pub fn batch_type(mut self, batch_type: impl Into<String>) -> Self {
        self.batch_type = Some(batch_type.into());
        self
    }

    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }
}

/// Filter for the historic job log. Results are in occurrence order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoricJobLogQuery {
    pub job_definition_id: Option<JobDefinitionId>,
    pub batch_id: Option<BatchId>,
    pub job_id: Option<JobId>,
    pub kind: Option<JobLogKind>,
}

impl HistoricJobLogQuery {
    pub fn for_job_definition(id: JobDefinitionId) -> Self {
        Self {
            job_definition_id: Some(id),
            ..Self::default()
        }
    }

    pub fn for_batch(id: BatchId) -> Self {
        Self {
            batch_id: Some(id),
            ..Self::default()
        }
    }

    pub fn job_id(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }

    pub fn kind(mut self, kind: JobLogKind) -> Self {
        self.kind = Some(kind);
        self
    }
}
