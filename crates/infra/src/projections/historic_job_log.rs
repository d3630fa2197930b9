use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgebatch_core::{BatchId, JobDefinitionId, JobId};
use forgebatch_events::{EventEnvelope, HistoryEvent, JobLogKind, Projection};

use crate::store::HistoricJobLogQuery;

/// One append-only job log entry.
///
/// Entries are ordered by `sequence_number` (occurrence), never by timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricJobLogEntry {
    pub sequence_number: u64,
    pub job_id: JobId,
    pub job_definition_id: JobDefinitionId,
    pub job_definition_type: String,
    pub batch_id: BatchId,
    pub kind: JobLogKind,
    pub retries: u32,
    pub exception_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HistoricJobLogEntry {
    pub fn matches(&self, query: &HistoricJobLogQuery) -> bool {
        query.job_definition_id.is_none_or(|id| id == self.job_definition_id)
            && query.batch_id.is_none_or(|id| id == self.batch_id)
            && query.job_id.is_none_or(|id| id == self.job_id)
            && query.kind.is_none_or(|kind| kind == self.kind)
    }
}

/// Historic job log in occurrence order.
#[derive(Debug, Default, Clone)]
pub struct HistoricJobLogProjection {
    entries: Vec<HistoricJobLogEntry>,
}

impl HistoricJobLogProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(&self, query: &HistoricJobLogQuery) -> Vec<HistoricJobLogEntry> {
        self.entries
            .iter()
            .filter(|e| e.matches(query))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Projection for HistoricJobLogProjection {
    type Ev = HistoryEvent;

    fn apply(&mut self, envelope: &EventEnvelope<HistoryEvent>) {
        match envelope.payload() {
            HistoryEvent::JobLogged(e) => self.entries.push(HistoricJobLogEntry {
                sequence_number: envelope.sequence_number(),
                job_id: e.job_id,
                job_definition_id: e.job_definition_id,
                job_definition_type: e.job_definition_type.clone(),
                batch_id: e.batch_id,
                kind: e.kind,
                retries: e.retries,
                exception_message: e.exception_message.clone(),
                timestamp: e.occurred_at,
            }),
            HistoryEvent::HistoryRemoved(e) => {
                self.entries.retain(|entry| entry.batch_id != e.batch_id);
            }
            _ => {}
        }
    }
}
