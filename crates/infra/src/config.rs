//! Engine configuration.
//!
//! Plain struct with defaults and `with_*` setters. `from_env` overlays
//! `FORGEBATCH_*` environment variables; unparsable values keep the default.

use std::time::Duration;

use tracing::warn;

use crate::jobs::RetryPolicy;
use crate::workers::WorkerPoolConfig;

/// Batch engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Work-item jobs created per seed invocation, unless the batch overrides it.
    pub batch_jobs_per_seed: u32,
    /// Items per work-item job, unless the batch overrides it.
    pub invocations_per_batch_job: u32,
    /// Delay between monitor job executions while work is outstanding.
    pub batch_poll_interval: Duration,
    /// Retry budget and backoff applied to every job.
    pub retry: RetryPolicy,
    /// How long an acquired job stays locked to its owner.
    pub lock_time: Duration,
    /// Upper bound of jobs locked per acquisition cycle.
    pub max_jobs_per_acquisition: usize,
    /// Wait between acquisition cycles that found nothing to do.
    pub acquisition_idle_wait: Duration,
    /// Identifies this engine instance as lock owner.
    pub lock_owner: String,
    pub worker_pool: WorkerPoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_jobs_per_seed: 100,
            invocations_per_batch_job: 1,
            batch_poll_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            lock_time: Duration::from_secs(5 * 60),
            max_jobs_per_acquisition: 3,
            acquisition_idle_wait: Duration::from_secs(5),
            lock_owner: format!("forgebatch-{}", uuid::Uuid::now_v7()),
            worker_pool: WorkerPoolConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_batch_jobs_per_seed(mut self, n: u32) -> Self {
        self.batch_jobs_per_seed = n;
        self
    }

    pub fn with_invocations_per_batch_job(mut self, n: u32) -> Self {
        self.invocations_per_batch_job = n;
        self
    }

    pub fn with_batch_poll_interval(mut self, interval: Duration) -> Self {
        self.batch_poll_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lock_time(mut self, lock_time: Duration) -> Self {
        self.lock_time = lock_time;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, n: usize) -> Self {
        self.max_jobs_per_acquisition = n;
        self
    }

    pub fn with_acquisition_idle_wait(mut self, wait: Duration) -> Self {
        self.acquisition_idle_wait = wait;
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    pub fn with_worker_pool(mut self, worker_pool: WorkerPoolConfig) -> Self {
        self.worker_pool = worker_pool;
        self
    }

    /// Defaults overlaid with `FORGEBATCH_*` environment variables.
    ///
    /// Durations are given in milliseconds.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let read = |key: &str| lookup(key);

        if let Some(v) = parse(&read, "FORGEBATCH_BATCH_JOBS_PER_SEED") {
            config.batch_jobs_per_seed = v;
        }
        if let Some(v) = parse(&read, "FORGEBATCH_INVOCATIONS_PER_BATCH_JOB") {
            config.invocations_per_batch_job = v;
        }
        if let Some(ms) = parse(&read, "FORGEBATCH_BATCH_POLL_INTERVAL_MS") {
            config.batch_poll_interval = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&read, "FORGEBATCH_DEFAULT_RETRIES") {
            config.retry.retries = v;
        }
        if let Some(ms) = parse(&read, "FORGEBATCH_LOCK_TIME_MS") {
            config.lock_time = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&read, "FORGEBATCH_MAX_JOBS_PER_ACQUISITION") {
            config.max_jobs_per_acquisition = v;
        }
        if let Some(ms) = parse(&read, "FORGEBATCH_ACQUISITION_IDLE_WAIT_MS") {
            config.acquisition_idle_wait = Duration::from_millis(ms);
        }
        if let Some(owner) = read("FORGEBATCH_LOCK_OWNER").filter(|s| !s.trim().is_empty()) {
            config.lock_owner = owner;
        }
        if let Some(v) = parse(&read, "FORGEBATCH_WORKER_THREADS") {
            config.worker_pool.core_threads = v;
        }
        if let Some(v) = parse(&read, "FORGEBATCH_WORKER_QUEUE_CAPACITY") {
            config.worker_pool.queue_capacity = v;
        }
        if let Some(ms) = parse(&read, "FORGEBATCH_LONG_RUNNING_WAIT_MS") {
            config.worker_pool.long_running_wait = Duration::from_millis(ms);
        }

        config
    }
}

fn parse<T>(read: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let raw = read(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => Some(v),
        _ => {
            warn!(key, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}
