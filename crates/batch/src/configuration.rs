//! Batch configuration payload and partition arithmetic.
//!
//! The configuration is the ordered item list plus a cursor marking how many
//! items have already been handed to work-item jobs. It is stored as opaque
//! bytes on the batch row and only the seed job advances the cursor.

use serde::{Deserialize, Serialize};

use forgebatch_core::{DomainError, DomainResult};

/// Ordered item list with a partition cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfiguration {
    items: Vec<String>,
    cursor: usize,
}

/// Items bound to a single work-item job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemShard {
    pub items: Vec<String>,
}

/// Outcome of planning one seed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPlan {
    /// One entry per work-item job to create.
    pub shards: Vec<WorkItemShard>,
    /// Cursor after this invocation commits.
    pub next_cursor: usize,
}

impl SeedPlan {
    pub fn jobs(&self) -> usize {
        self.shards.len()
    }
}

impl BatchConfiguration {
    pub fn new(items: Vec<String>) -> Self {
        Self { items, cursor: 0 }
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn remaining(&self) -> usize {
        self.items.len().saturating_sub(self.cursor)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Plan the next seed invocation without mutating the cursor.
    ///
    /// Creates `min(batch_jobs_per_seed, ceil(remaining / invocations_per_batch_job))`
    /// shards of at most `invocations_per_batch_job` items each, taken in order
    /// from the cursor.
    pub fn plan_seed(&self, batch_jobs_per_seed: u32, invocations_per_batch_job: u32) -> SeedPlan {
        let per_job = invocations_per_batch_job.max(1) as usize;
        let max_jobs = batch_jobs_per_seed.max(1) as usize;

        let jobs = self.remaining().div_ceil(per_job).min(max_jobs);

        let mut shards = Vec::with_capacity(jobs);
        let mut cursor = self.cursor;
        for _ in 0..jobs {
            let end = (cursor + per_job).min(self.items.len());
            shards.push(WorkItemShard {
                items: self.items[cursor..end].to_vec(),
            });
            cursor = end;
        }

        SeedPlan {
            shards,
            next_cursor: cursor,
        }
    }

    /// Move the cursor forward to `next_cursor` (from a committed [`SeedPlan`]).
    pub fn advance_to(&mut self, next_cursor: usize) -> DomainResult<()> {
        if next_cursor < self.cursor || next_cursor > self.items.len() {
            return Err(DomainError::invariant(format!(
                "cursor {next_cursor} outside [{}, {}]",
                self.cursor,
                self.items.len()
            )));
        }
        self.cursor = next_cursor;
        Ok(())
    }

    pub fn to_bytes(&self) -> DomainResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DomainError::invariant(format!("batch configuration encode: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> DomainResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| DomainError::invariant(format!("batch configuration decode: {e}")))
    }
}

impl WorkItemShard {
    pub fn to_bytes(&self) -> DomainResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DomainError::invariant(format!("work item shard encode: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> DomainResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| DomainError::invariant(format!("work item shard decode: {e}")))
    }
}
