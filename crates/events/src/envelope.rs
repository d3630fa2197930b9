use serde::{Deserialize, Serialize};
use uuid::Uuid;

use forgebatch_core::BatchId;

/// Envelope for a history event, carrying the batch it belongs to and its
/// position in the store's history stream.
///
/// Notes:
/// - `sequence_number` is assigned by the store at commit time and is strictly
///   increasing across the whole store. It is the occurrence order; timestamps
///   are not, since several entries can share one clock value.
/// - **Append-only**: envelopes are never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    batch_id: BatchId,

    /// Monotonically increasing position in the history stream.
    sequence_number: u64,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(event_id: Uuid, batch_id: BatchId, sequence_number: u64, payload: E) -> Self {
        Self {
            event_id,
            batch_id,
            sequence_number,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
