//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgebatch_core::{BatchId, DomainError, JobDefinitionId, JobId};

/// Job type of seed jobs.
pub const SEED_JOB_TYPE: &str = "batch-seed-job";
/// Job type of monitor jobs.
pub const MONITOR_JOB_TYPE: &str = "batch-monitor-job";

/// Handler a job is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobDefinitionKind {
    /// Partitions the batch item list into work-item jobs.
    Seed,
    /// Applies the bulk operation to one shard of items.
    WorkItem,
    /// Polls for batch completion and finalizes the batch.
    Monitor,
}

impl JobDefinitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobDefinitionKind::Seed => "seed",
            JobDefinitionKind::WorkItem => "work_item",
            JobDefinitionKind::Monitor => "monitor",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "seed" => Ok(JobDefinitionKind::Seed),
            "work_item" => Ok(JobDefinitionKind::WorkItem),
            "monitor" => Ok(JobDefinitionKind::Monitor),
            other => Err(DomainError::validation(format!(
                "unknown job definition kind '{other}'"
            ))),
        }
    }
}

/// Groups the jobs of one handler kind within one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobDefinitionId,
    pub kind: JobDefinitionKind,
    /// `batch-seed-job`, `batch-monitor-job`, or the batch type for work items.
    pub job_type: String,
    /// Owning batch.
    pub configuration: BatchId,
    pub suspended: bool,
}

impl JobDefinition {
    pub fn seed(batch_id: BatchId) -> Self {
        Self::new(JobDefinitionKind::Seed, SEED_JOB_TYPE, batch_id)
    }

    pub fn monitor(batch_id: BatchId) -> Self {
        Self::new(JobDefinitionKind::Monitor, MONITOR_JOB_TYPE, batch_id)
    }

    pub fn work_item(batch_id: BatchId, batch_type: &str) -> Self {
        Self::new(JobDefinitionKind::WorkItem, batch_type, batch_id)
    }

    fn new(kind: JobDefinitionKind, job_type: &str, batch_id: BatchId) -> Self {
        Self {
            id: JobDefinitionId::new(),
            kind,
            job_type: job_type.to_string(),
            configuration: batch_id,
            suspended: false,
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Fixed
    }
}

/// Retry budget and backoff applied to failed jobs.
///
/// The default is three retries with no delay: a failed job is due again
/// immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry budget given to newly created jobs
    pub retries: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            strategy: BackoffStrategy::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Calculate delay for a given failed attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Due date of a job that just failed with `retries_left` remaining.
    ///
    /// `None` keeps the job due immediately.
    pub fn next_due_date(&self, retries_left: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let attempt = self.retries.saturating_sub(retries_left).max(1);
        let delay = self.delay_for_attempt(attempt);
        if delay.is_zero() {
            return None;
        }
        Some(due_after(now, delay))
    }
}

/// `now + delay`, saturating at the latest representable instant.
pub fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A job row.
///
/// `revision` is the optimistic lock column: every committed update bumps it,
/// and lock claims only succeed against the revision that was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_definition_id: JobDefinitionId,
    pub batch_id: BatchId,
    /// Handler dispatch
    pub kind: JobDefinitionKind,
    /// Copied from the job definition for log entries
    pub job_type: String,
    /// `None` means due immediately
    pub due_date: Option<DateTime<Utc>>,
    /// Remaining attempt budget; zero is a terminal failure
    pub retries: u32,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    /// Last failure
    pub exception_message: Option<String>,
    /// Handler input (encoded work-item shard; empty for seed and monitor)
    pub payload: Vec<u8>,
    pub suspended: bool,
    pub created_at: DateTime<Utc>,
    pub revision: u64,
}

impl Job {
    /// Create a job for `definition`, due immediately.
    pub fn new(definition: &JobDefinition, retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_definition_id: definition.id,
            batch_id: definition.configuration,
            kind: definition.kind,
            job_type: definition.job_type.clone(),
            due_date: None,
            retries,
            lock_owner: None,
            lock_expiration_time: None,
            exception_message: None,
            payload: Vec::new(),
            suspended: definition.suspended,
            created_at: now,
            revision: 0,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    /// Held by an owner whose lock has not expired.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration_time.is_some_and(|until| until > now)
    }

    /// Eligible for acquisition by the executor.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        !self.suspended && self.retries > 0 && self.is_due(now) && !self.is_locked(now)
    }

    /// Retry budget exhausted.
    pub fn is_failed(&self) -> bool {
        self.retries == 0
    }

    pub fn lock(&mut self, owner: &str, until: DateTime<Utc>) {
        self.lock_owner = Some(owner.to_string());
        self.lock_expiration_time = Some(until);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> JobDefinition {
        JobDefinition::work_item(BatchId::new(), "instance-migration")
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn default_policy_retries_immediately() {
        let now = Utc::now();
        assert_eq!(RetryPolicy::default().next_due_date(2, now), None);

        let policy = RetryPolicy::fixed(3, Duration::from_secs(10));
        assert_eq!(
            policy.next_due_date(2, now),
            Some(now + chrono::Duration::seconds(10))
        );
    }

    #[test]
    fn acquirable_requires_due_unlocked_and_retries() {
        let now = Utc::now();
        let mut job = Job::new(&definition(), 3, now);
        assert!(job.is_acquirable(now));

        job.due_date = Some(now + chrono::Duration::seconds(30));
        assert!(!job.is_acquirable(now));
        assert!(job.is_acquirable(now + chrono::Duration::seconds(30)));

        job.due_date = None;
        job.lock("owner", now + chrono::Duration::minutes(5));
        assert!(!job.is_acquirable(now));
        // expired locks do not block acquisition
        assert!(job.is_acquirable(now + chrono::Duration::minutes(6)));

        job.unlock();
        job.retries = 0;
        assert!(job.is_failed());
        assert!(!job.is_acquirable(now));

        job.retries = 1;
        job.suspended = true;
        assert!(!job.is_acquirable(now));
    }

    #[test]
    fn job_inherits_definition() {
        let def = definition();
        let job = Job::new(&def, 3, Utc::now());
        assert_eq!(job.job_definition_id, def.id);
        assert_eq!(job.batch_id, def.configuration);
        assert_eq!(job.kind, JobDefinitionKind::WorkItem);
        assert_eq!(job.job_type, "instance-migration");
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            JobDefinitionKind::Seed,
            JobDefinitionKind::WorkItem,
            JobDefinitionKind::Monitor,
        ] {
            assert_eq!(JobDefinitionKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(JobDefinitionKind::parse("timer").is_err());
    }
}
