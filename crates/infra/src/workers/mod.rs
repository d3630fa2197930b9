//! Background workers.

pub mod worker_pool;

pub use worker_pool::{ThrottledWarning, Work, WorkerPool, WorkerPoolConfig};
