//! Bounded worker pool shared by every job type.
//!
//! A fixed set of threads drains a bounded queue. Submissions never grow the
//! queue past its capacity: short-running work is rejected immediately when
//! the queue is full, long-running work waits a bounded time for a slot.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

/// Unit of work submitted to the pool.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Worker threads
    pub core_threads: usize,
    /// Queued submissions waiting for a free thread
    pub queue_capacity: usize,
    /// Bounded wait for long-running submissions
    pub long_running_wait: Duration,
    /// Minimum gap between two rejection warnings
    pub rejection_log_interval: Duration,
    /// Thread name prefix
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core_threads: 3,
            queue_capacity: 3,
            long_running_wait: Duration::from_secs(2),
            rejection_log_interval: Duration::from_secs(60),
            name: "batch-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_core_threads(mut self, n: usize) -> Self {
        self.core_threads = n;
        self
    }

    pub fn with_queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    pub fn with_long_running_wait(mut self, wait: Duration) -> Self {
        self.long_running_wait = wait;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Warning logger that emits at most once per interval.
#[derive(Debug)]
pub struct ThrottledWarning {
    interval: Duration,
    last: Mutex<Option<Instant>>,
    emitted: AtomicU64,
    suppressed: AtomicU64,
}

impl ThrottledWarning {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
            emitted: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Warnings logged so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Warnings swallowed by the interval.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// Whether a warning may be emitted now; claims the slot if so.
    pub fn try_acquire(&self, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    pub fn warn(&self, pool: &str, reason: &str) {
        if self.try_acquire(Instant::now()) {
            self.emitted.fetch_add(1, Ordering::Relaxed);
            warn!(pool, reason, "worker pool rejected work");
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Work>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    space_available: Condvar,
}

impl Shared {
    fn lock(&self) -> Option<MutexGuard<'_, PoolState>> {
        self.state.lock().ok()
    }
}

/// Bounded worker pool.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    rejections: ThrottledWarning,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Start the worker threads.
    pub fn start(config: WorkerPoolConfig) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState::default()),
            work_available: Condvar::new(),
            space_available: Condvar::new(),
        });

        let threads = config.core_threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{i}", config.name))
                .spawn(move || worker_loop(shared))?;
            workers.push(handle);
        }

        info!(pool = %config.name, threads, capacity = config.queue_capacity, "worker pool started");

        Ok(Self {
            rejections: ThrottledWarning::new(config.rejection_log_interval),
            config,
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Submit work.
    ///
    /// Short-running work is enqueued only if a slot is free right now.
    /// Long-running work waits up to `long_running_wait` for a slot. Returns
    /// `false` when the work was not scheduled; the caller retries later.
    pub fn schedule(&self, work: Work, long_running: bool) -> bool {
        let Some(mut state) = self.shared.lock() else {
            self.rejections.warn(&self.config.name, "pool state poisoned");
            return false;
        };

        let capacity = self.config.queue_capacity.max(1);
        if state.shutdown {
            self.rejections.warn(&self.config.name, "pool is shut down");
            return false;
        }
        if state.queue.len() < capacity {
            state.queue.push_back(work);
            self.shared.work_available.notify_one();
            return true;
        }
        if !long_running {
            debug!(pool = %self.config.name, "queue full, short-running work not scheduled");
            return false;
        }

        let deadline = Instant::now() + self.config.long_running_wait;
        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!(pool = %self.config.name, "timed out waiting for a worker slot");
                return false;
            }
            state = match self.shared.space_available.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => {
                    self.rejections.warn(&self.config.name, "pool state poisoned");
                    return false;
                }
            };
            if state.shutdown {
                self.rejections.warn(&self.config.name, "pool is shut down");
                return false;
            }
            if state.queue.len() < capacity {
                state.queue.push_back(work);
                self.shared.work_available.notify_one();
                return true;
            }
        }
    }

    /// Submissions waiting for a thread.
    pub fn queued(&self) -> usize {
        self.shared.lock().map_or(0, |s| s.queue.len())
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Throttle for rejection warnings of this pool.
    pub fn rejections(&self) -> &ThrottledWarning {
        &self.rejections
    }

    /// Stop accepting work, drain the queue and join all workers.
    pub fn shutdown(&self) {
        if let Some(mut state) = self.shared.lock() {
            state.shutdown = true;
        }
        self.shared.work_available.notify_all();
        self.shared.space_available.notify_all();

        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        if workers.is_empty() {
            return;
        }
        for handle in workers {
            let _ = handle.join();
        }
        info!(pool = %self.config.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let work = {
            let Some(mut state) = shared.lock() else {
                return;
            };
            loop {
                if let Some(work) = state.queue.pop_front() {
                    break work;
                }
                if state.shutdown {
                    return;
                }
                state = match shared.work_available.wait(state) {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
            }
        };
        shared.space_available.notify_one();

        if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
            error!("worker task panicked");
        }
    }
}
