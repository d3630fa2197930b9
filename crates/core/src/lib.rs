//! `forgebatch-core`: shared building blocks for the batch engine.
//!
//! This crate contains **pure** primitives (identifiers, errors, optimistic
//! concurrency expectations, time sources). No storage or threading concerns.

pub mod clock;
pub mod error;
pub mod id;
pub mod version;

pub use clock::{Clock, FrozenClock, SharedClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{BatchId, JobDefinitionId, JobId};
pub use version::ExpectedVersion;
