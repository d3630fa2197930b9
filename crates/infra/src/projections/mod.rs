//! Audit read models built from the history stream.
//!
//! All projections are:
//! - **Rebuildable**: can be reconstructed from the history stream
//! - **Append-only**: entries are never rewritten, only purged per batch
//! - **Ordered**: fed by the store in sequence order

pub mod historic_batch;
pub mod historic_job_log;
pub mod operation_log;

use forgebatch_events::{EventEnvelope, HistoryEvent, Projection};

pub use historic_batch::{HistoricBatch, HistoricBatchProjection};
pub use historic_job_log::{HistoricJobLogEntry, HistoricJobLogProjection};
pub use operation_log::{CREATE_BATCH_OPERATION, OperationLogEntry, OperationLogProjection};

/// All audit read models, fed together.
#[derive(Debug, Default, Clone)]
pub struct HistoryProjection {
    pub batches: HistoricBatchProjection,
    pub job_log: HistoricJobLogProjection,
    pub operations: OperationLogProjection,
}

impl HistoryProjection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Projection for HistoryProjection {
    type Ev = HistoryEvent;

    fn apply(&mut self, envelope: &EventEnvelope<HistoryEvent>) {
        self.batches.apply(envelope);
        self.job_log.apply(envelope);
        self.operations.apply(envelope);
    }
}
