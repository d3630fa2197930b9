use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgebatch_core::BatchId;
use forgebatch_events::{EventEnvelope, HistoryEvent, Projection};

/// Operation name recorded when a batch is created.
pub const CREATE_BATCH_OPERATION: &str = "CreateBatch";

/// Audit entry for an operator-level operation on a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub sequence_number: u64,
    pub batch_id: BatchId,
    pub operation: String,
    pub properties: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct OperationLogProjection {
    entries: Vec<OperationLogEntry>,
}

impl OperationLogProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_batch(&self, batch_id: BatchId) -> Vec<OperationLogEntry> {
        self.entries
            .iter()
            .filter(|e| e.batch_id == batch_id)
            .cloned()
            .collect()
    }
}

impl Projection for OperationLogProjection {
    type Ev = HistoryEvent;

    fn apply(&mut self, envelope: &EventEnvelope<HistoryEvent>) {
        match envelope.payload() {
            HistoryEvent::OperationLogged(e) => self.entries.push(OperationLogEntry {
                sequence_number: envelope.sequence_number(),
                batch_id: e.batch_id,
                operation: e.operation.clone(),
                properties: e.properties.clone(),
                timestamp: e.occurred_at,
            }),
            HistoryEvent::HistoryRemoved(e) => {
                self.entries.retain(|entry| entry.batch_id != e.batch_id);
            }
            _ => {}
        }
    }
}
