use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgebatch_core::{BatchId, JobDefinitionId};
use forgebatch_events::{EventEnvelope, HistoryEvent, Projection};

use crate::store::HistoricBatchQuery;

/// Audit record of a batch, outliving the live batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricBatch {
    pub id: BatchId,
    pub batch_type: String,
    pub size: u64,
    pub batch_jobs_per_seed: u32,
    pub invocations_per_batch_job: u32,
    pub seed_job_definition_id: JobDefinitionId,
    pub monitor_job_definition_id: JobDefinitionId,
    pub batch_job_definition_id: JobDefinitionId,
    pub start_time: DateTime<Utc>,
    pub execution_start_time: Option<DateTime<Utc>>,
    /// `None` while the batch is running. Set exactly once.
    pub end_time: Option<DateTime<Utc>>,
}

impl HistoricBatch {
    pub fn is_completed(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn matches(&self, query: &HistoricBatchQuery) -> bool {
        query.batch_type.as_deref().is_none_or(|t| t == self.batch_type)
            && query.completed.is_none_or(|c| c == self.is_completed())
    }
}

/// Historic batches keyed by batch id.
#[derive(Debug, Default, Clone)]
pub struct HistoricBatchProjection {
    batches: BTreeMap<BatchId, HistoricBatch>,
}

impl HistoricBatchProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: BatchId) -> Option<&HistoricBatch> {
        self.batches.get(&id)
    }

    pub fn list(&self, query: &HistoricBatchQuery) -> Vec<HistoricBatch> {
        self.batches
            .values()
            .filter(|b| b.matches(query))
            .cloned()
            .collect()
    }
}

impl Projection for HistoricBatchProjection {
    type Ev = HistoryEvent;

    fn apply(&mut self, envelope: &EventEnvelope<HistoryEvent>) {
        match envelope.payload() {
            HistoryEvent::BatchStarted(e) => {
                self.batches.entry(e.batch_id).or_insert_with(|| HistoricBatch {
                    id: e.batch_id,
                    batch_type: e.batch_type.clone(),
                    size: e.size,
                    batch_jobs_per_seed: e.batch_jobs_per_seed,
                    invocations_per_batch_job: e.invocations_per_batch_job,
                    seed_job_definition_id: e.seed_job_definition_id,
                    monitor_job_definition_id: e.monitor_job_definition_id,
                    batch_job_definition_id: e.batch_job_definition_id,
                    start_time: e.occurred_at,
                    execution_start_time: None,
                    end_time: None,
                });
            }
            HistoryEvent::BatchExecutionStarted(e) => {
                if let Some(batch) = self.batches.get_mut(&e.batch_id) {
                    batch.execution_start_time.get_or_insert(e.occurred_at);
                }
            }
            HistoryEvent::BatchEnded(e) => {
                if let Some(batch) = self.batches.get_mut(&e.batch_id) {
                    batch.end_time.get_or_insert(e.occurred_at);
                }
            }
            HistoryEvent::HistoryRemoved(e) => {
                self.batches.remove(&e.batch_id);
            }
            HistoryEvent::JobLogged(_) | HistoryEvent::OperationLogged(_) => {}
        }
    }
}
