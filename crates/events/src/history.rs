//! History events emitted by the batch engine.
//!
//! Each committed unit of work may carry history events; the store stamps
//! them with a sequence number and feeds them to the audit projections.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgebatch_core::{BatchId, JobDefinitionId, JobId};

use crate::Event;

/// Kind of a historic job log entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLogKind {
    Creation,
    Success,
    Failure,
    Deletion,
}

impl JobLogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobLogKind::Creation => "creation",
            JobLogKind::Success => "success",
            JobLogKind::Failure => "failure",
            JobLogKind::Deletion => "deletion",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "creation" => Some(JobLogKind::Creation),
            "success" => Some(JobLogKind::Success),
            "failure" => Some(JobLogKind::Failure),
            "deletion" => Some(JobLogKind::Deletion),
            _ => None,
        }
    }
}

/// Event: a batch was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStarted {
    pub batch_id: BatchId,
    pub batch_type: String,
    pub size: u64,
    pub batch_jobs_per_seed: u32,
    pub invocations_per_batch_job: u32,
    pub seed_job_definition_id: JobDefinitionId,
    pub monitor_job_definition_id: JobDefinitionId,
    pub batch_job_definition_id: JobDefinitionId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: the first work-item job of a batch started executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchExecutionStarted {
    pub batch_id: BatchId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a batch finished (monitor finalization or explicit deletion).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEnded {
    pub batch_id: BatchId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a job lifecycle step worth auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLogged {
    pub job_id: JobId,
    pub job_definition_id: JobDefinitionId,
    pub job_definition_type: String,
    pub batch_id: BatchId,
    pub kind: JobLogKind,
    pub retries: u32,
    pub exception_message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: an operator-level operation on a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLogged {
    pub batch_id: BatchId,
    pub operation: String,
    pub properties: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: all history of a batch was purged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRemoved {
    pub batch_id: BatchId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryEvent {
    BatchStarted(BatchStarted),
    BatchExecutionStarted(BatchExecutionStarted),
    BatchEnded(BatchEnded),
    JobLogged(JobLogged),
    OperationLogged(OperationLogged),
    HistoryRemoved(HistoryRemoved),
}

impl HistoryEvent {
    /// The batch this event belongs to.
    pub fn batch_id(&self) -> BatchId {
        match self {
            HistoryEvent::BatchStarted(e) => e.batch_id,
            HistoryEvent::BatchExecutionStarted(e) => e.batch_id,
            HistoryEvent::BatchEnded(e) => e.batch_id,
            HistoryEvent::JobLogged(e) => e.batch_id,
            HistoryEvent::OperationLogged(e) => e.batch_id,
            HistoryEvent::HistoryRemoved(e) => e.batch_id,
        }
    }
}

impl Event for HistoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            HistoryEvent::BatchStarted(_) => "batch.started",
            HistoryEvent::BatchExecutionStarted(_) => "batch.execution_started",
            HistoryEvent::BatchEnded(_) => "batch.ended",
            HistoryEvent::JobLogged(_) => "batch.job.logged",
            HistoryEvent::OperationLogged(_) => "batch.operation.logged",
            HistoryEvent::HistoryRemoved(_) => "batch.history.removed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            HistoryEvent::BatchStarted(e) => e.occurred_at,
            HistoryEvent::BatchExecutionStarted(e) => e.occurred_at,
            HistoryEvent::BatchEnded(e) => e.occurred_at,
            HistoryEvent::JobLogged(e) => e.occurred_at,
            HistoryEvent::OperationLogged(e) => e.occurred_at,
            HistoryEvent::HistoryRemoved(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_log_kind_parses_its_own_names() {
        for kind in [
            JobLogKind::Creation,
            JobLogKind::Success,
            JobLogKind::Failure,
            JobLogKind::Deletion,
        ] {
            assert_eq!(JobLogKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobLogKind::parse("bogus"), None);
    }

    #[test]
    fn job_log_kind_serializes_snake_case() {
        let json = serde_json::to_string(&JobLogKind::Deletion).unwrap();
        assert_eq!(json, "\"deletion\"");
    }
}
