use crate::{Event, EventEnvelope};

/// A projection builds an audit read model from the append-only history stream.
///
/// The live tables (batches, jobs, job definitions) are the write side; the
/// historic batch, historic job log and operation log are read models that
/// outlive them. Projections only ever see committed events, in sequence order.
///
/// ## Idempotency
///
/// Projections must be **idempotent**: applying the same envelope twice must not
/// produce a duplicate entry. The `ProjectionRunner` rejects envelopes whose
/// sequence number is not beyond its cursor, which covers redelivery.
///
/// ## Persistence
///
/// This trait doesn't define how read models are stored. The in-memory store
/// keeps projections in process; the Postgres store writes the same rows
/// directly inside the commit transaction.
pub trait Projection {
    type Ev: Event;

    /// Apply a single committed event to the read model.
    ///
    /// Events that are not relevant to this projection are ignored.
    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>);
}
