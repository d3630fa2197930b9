//! Batch engine runtime: storage, job execution, lifecycle and history.

pub mod config;
pub mod engine;
pub mod handlers;
pub mod jobs;
pub mod lifecycle;
pub mod projections;
pub mod store;
pub mod uow;
pub mod workers;

mod integration_tests;

pub use config::EngineConfig;
pub use engine::{BatchEngine, BatchEngineBuilder, EngineError, EngineRuntime, OperationRegistry};
pub use jobs::{ExecutionOutcome, ExecutorStats, JobExecutor, JobExecutorHandle};
pub use store::{BatchStore, InMemoryBatchStore, PostgresBatchStore, StoreError};
