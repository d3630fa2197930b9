//! History events and the projection machinery that turns them into the
//! audit read models (historic batches, historic job log, operation log).

pub mod envelope;
pub mod event;
pub mod history;
pub mod projection;
pub mod runner;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use history::{
    BatchEnded, BatchExecutionStarted, BatchStarted, HistoryEvent, HistoryRemoved, JobLogKind,
    JobLogged, OperationLogged,
};
pub use projection::Projection;
pub use runner::{ProjectionCursor, ProjectionError, ProjectionRunner};
