//! Batch domain module.
//!
//! A batch is a bulk operation over a fixed item list, split into work-item
//! jobs by a seed job and finalized by a monitor job. This crate holds the
//! pure rules (validation, partitioning, statistics) and the contract of the
//! injected per-item operation; it does no IO.

pub mod batch;
pub mod configuration;
pub mod operation;
pub mod statistics;
pub mod variables;

pub use batch::{Batch, NewBatch};
pub use configuration::{BatchConfiguration, SeedPlan, WorkItemShard};
pub use operation::{BulkOperation, ItemContext, ItemError, OperationFn};
pub use statistics::BatchStatistics;
pub use variables::{TypedValue, Variables};
