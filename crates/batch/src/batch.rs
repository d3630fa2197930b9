//! Batch orchestration record and creation request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgebatch_core::{BatchId, DomainError, DomainResult, JobDefinitionId};

use crate::configuration::BatchConfiguration;
use crate::variables::Variables;

/// A live batch.
///
/// Created atomically with its three job definitions and the initial seed
/// job; mutated only by the seed job (cursor advance) and by suspension;
/// destroyed by the monitor job or by explicit deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub batch_type: String,
    /// Item count, fixed at creation.
    pub total_size: u64,
    pub batch_jobs_per_seed: u32,
    pub invocations_per_batch_job: u32,
    pub seed_job_definition_id: JobDefinitionId,
    pub monitor_job_definition_id: JobDefinitionId,
    pub batch_job_definition_id: JobDefinitionId,
    /// Encoded [`BatchConfiguration`] (item list + cursor).
    pub configuration_payload: Vec<u8>,
    /// Work-item jobs created so far.
    pub jobs_created: u64,
    pub suspended: bool,
    pub start_time: DateTime<Utc>,
    pub execution_start_time: Option<DateTime<Utc>>,
    /// Optimistic concurrency revision, bumped by every committed update.
    pub revision: u64,
}

impl Batch {
    /// Total number of work-item jobs this batch creates over its lifetime.
    pub fn total_jobs(&self) -> u64 {
        self.total_size
            .div_ceil(u64::from(self.invocations_per_batch_job.max(1)))
    }

    pub fn configuration(&self) -> DomainResult<BatchConfiguration> {
        BatchConfiguration::from_bytes(&self.configuration_payload)
    }

    pub fn set_configuration(&mut self, configuration: &BatchConfiguration) -> DomainResult<()> {
        self.configuration_payload = configuration.to_bytes()?;
        Ok(())
    }

    pub fn job_definition_ids(&self) -> [JobDefinitionId; 3] {
        [
            self.seed_job_definition_id,
            self.monitor_job_definition_id,
            self.batch_job_definition_id,
        ]
    }
}

/// Request to create a batch.
///
/// Partitioning parameters left unset fall back to engine defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBatch {
    pub batch_type: String,
    pub items: Vec<String>,
    pub batch_jobs_per_seed: Option<u32>,
    pub invocations_per_batch_job: Option<u32>,
    pub variables: Option<Variables>,
}

impl NewBatch {
    pub fn new(batch_type: impl Into<String>, items: Vec<String>) -> Self {
        Self {
            batch_type: batch_type.into(),
            items,
            batch_jobs_per_seed: None,
            invocations_per_batch_job: None,
            variables: None,
        }
    }

    pub fn with_batch_jobs_per_seed(mut self, n: u32) -> Self {
        self.batch_jobs_per_seed = Some(n);
        self
    }

    pub fn with_invocations_per_batch_job(mut self, n: u32) -> Self {
        self.invocations_per_batch_job = Some(n);
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Synchronous, fail-fast validation. Nothing is persisted when this fails.
    pub fn validate(&self) -> DomainResult<()> {
        if self.batch_type.trim().is_empty() {
            return Err(DomainError::validation("batch type is empty"));
        }
        if self.items.is_empty() {
            return Err(DomainError::validation("item ids is empty"));
        }
        if self.items.iter().any(|item| item.trim().is_empty()) {
            return Err(DomainError::validation("item ids contains empty value"));
        }
        if self.batch_jobs_per_seed == Some(0) {
            return Err(DomainError::validation("batch jobs per seed must be positive"));
        }
        if self.invocations_per_batch_job == Some(0) {
            return Err(DomainError::validation(
                "invocations per batch job must be positive",
            ));
        }
        if let Some(variables) = &self.variables {
            if variables.keys().any(|name| name.trim().is_empty()) {
                return Err(DomainError::validation("variable name is empty"));
            }
        }
        Ok(())
    }
}
