//! Job executor: acquisition loop, execution and retry handling.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use forgebatch_core::{ExpectedVersion, JobId};
use forgebatch_events::JobLogKind;

use super::acquisition::acquire_jobs;
use super::types::{Job, JobDefinitionKind};
use crate::engine::{BatchEngine, EngineRuntime};
use crate::handlers::{self, HandlerContext, JobError, JobOutcome};
use crate::store::{BatchStore, Change, ChangeSet};
use crate::uow::UnitOfWork;
use crate::workers::WorkerPool;

/// Result of one job invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The handler's writes and the job update were committed.
    Succeeded,
    /// The invocation was rolled back and one retry was consumed.
    Failed { retries_left: u32, message: String },
    /// The job was deleted or claimed by another owner while running.
    Orphaned,
}

/// Run a locked job through its handler and commit the outcome.
///
/// On success the handler's staged writes, a `success` log entry and the job
/// removal (or unlock) commit together. On failure everything the handler
/// staged is discarded and the job is unlocked with one retry fewer.
pub fn run_job<S: BatchStore>(rt: &EngineRuntime<S>, job: Job) -> ExecutionOutcome {
    let now = rt.clock.now();
    let ctx = HandlerContext {
        config: &rt.config,
        operations: &rt.operations,
    };

    let mut uow = UnitOfWork::begin(&rt.store, now);
    let outcome = match handlers::dispatch(&job, &mut uow, ctx) {
        Ok(outcome) => outcome,
        Err(err) => {
            uow.rollback();
            return fail(rt, &job, &err, now);
        }
    };

    uow.log_job(&job, JobLogKind::Success, None);
    let expected = ExpectedVersion::Exact(job.revision);
    match outcome {
        JobOutcome::Remove => uow.push(Change::DeleteJob { id: job.id, expected }),
        JobOutcome::Keep { due_date } => {
            let mut kept = job.clone();
            kept.unlock();
            kept.due_date = due_date;
            kept.exception_message = None;
            uow.push(Change::UpdateJob { job: kept, expected });
        }
    }

    match uow.commit() {
        Ok(()) => {
            debug!(job_id = %job.id, job_type = %job.job_type, ?outcome, "job succeeded");
            ExecutionOutcome::Succeeded
        }
        Err(e) if e.is_not_found() => {
            debug!(job_id = %job.id, error = %e, "job vanished while running");
            ExecutionOutcome::Orphaned
        }
        Err(e) => fail(rt, &job, &JobError::Store(e), now),
    }
}

/// Record a failed invocation: decrement retries, store the exception, unlock,
/// reschedule per the retry policy and log a `failure` entry.
fn fail<S: BatchStore>(
    rt: &EngineRuntime<S>,
    job: &Job,
    err: &JobError,
    now: DateTime<Utc>,
) -> ExecutionOutcome {
    let message = err.exception_message();
    let current = match rt.store.find_job(job.id) {
        Ok(Some(current)) => current,
        Ok(None) => {
            debug!(job_id = %job.id, error = %message, "failed job no longer exists");
            return ExecutionOutcome::Orphaned;
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "failed to load job after failure");
            return ExecutionOutcome::Failed {
                retries_left: job.retries,
                message,
            };
        }
    };
    if current.lock_owner != job.lock_owner {
        warn!(
            job_id = %job.id,
            owner = ?current.lock_owner,
            "lock lost while running, leaving job to its new owner"
        );
        return ExecutionOutcome::Orphaned;
    }

    let mut failed = current.clone();
    failed.retries = current.retries.saturating_sub(1);
    failed.exception_message = Some(message.clone());
    failed.unlock();
    if let Some(due_date) = rt.config.retry.next_due_date(failed.retries, now) {
        failed.due_date = Some(due_date);
    }
    match err.trimmed_payload() {
        Some(Ok(payload)) => failed.payload = payload,
        Some(Err(e)) => warn!(job_id = %job.id, error = %e, "failed to encode remaining items"),
        None => {}
    }
    let retries_left = failed.retries;

    let mut uow = UnitOfWork::begin(&rt.store, now);
    uow.log_job(&failed, JobLogKind::Failure, Some(message.clone()));
    uow.push(Change::UpdateJob {
        job: failed,
        expected: ExpectedVersion::Exact(current.revision),
    });
    match uow.commit() {
        Ok(()) if retries_left == 0 => {
            warn!(job_id = %job.id, job_type = %job.job_type, error = %message, "job failed, no retries left");
        }
        Ok(()) => {
            debug!(job_id = %job.id, retries_left, error = %message, "job failed, will retry");
        }
        Err(e) if e.is_not_found() => return ExecutionOutcome::Orphaned,
        Err(e) => {
            error!(job_id = %job.id, error = %e, "failed to record job failure");
            return ExecutionOutcome::Failed {
                retries_left: current.retries,
                message,
            };
        }
    }

    ExecutionOutcome::Failed {
        retries_left,
        message,
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub acquisition_cycles: u64,
    pub jobs_acquired: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_exhausted: u64,
    pub jobs_orphaned: u64,
    pub jobs_rejected: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

type SharedStats = Arc<Mutex<ExecutorStats>>;

fn update_stats(stats: &SharedStats, f: impl FnOnce(&mut ExecutorStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: SharedStats,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for in-flight jobs.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Background job executor.
///
/// One acquisition thread claims due jobs and hands them to a bounded
/// [`WorkerPool`]. Work-item jobs are submitted as long-running; a job the
/// pool rejects is unlocked again for a later cycle.
pub struct JobExecutor;

impl JobExecutor {
    pub fn spawn<S: BatchStore + 'static>(engine: &BatchEngine<S>) -> io::Result<JobExecutorHandle> {
        let rt = engine.runtime().clone();
        let pool = WorkerPool::start(rt.config.worker_pool.clone())?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = SharedStats::default();
        let loop_stats = stats.clone();

        let join = thread::Builder::new()
            .name(format!("{}-acquisition", rt.config.worker_pool.name))
            .spawn(move || executor_loop(rt, pool, shutdown_rx, loop_stats))?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn executor_loop<S: BatchStore + 'static>(
    rt: Arc<EngineRuntime<S>>,
    pool: WorkerPool,
    shutdown_rx: mpsc::Receiver<()>,
    stats: SharedStats,
) {
    let owner = rt.config.lock_owner.clone();
    info!(owner = %owner, "job executor started");
    let start_time = Instant::now();

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        update_stats(&stats, |s| {
            s.acquisition_cycles += 1;
            s.uptime_secs = start_time.elapsed().as_secs();
        });

        let now = rt.clock.now();
        let acquired = match acquire_jobs(
            &rt.store,
            now,
            &owner,
            rt.config.lock_time,
            rt.config.max_jobs_per_acquisition,
        ) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(owner = %owner, error = %e, "job acquisition failed");
                Vec::new()
            }
        };

        let mut scheduled = 0usize;
        for job in acquired {
            update_stats(&stats, |s| s.jobs_acquired += 1);
            let job_id = job.id;
            let revision = job.revision;
            let long_running = job.kind == JobDefinitionKind::WorkItem;

            let task_rt = rt.clone();
            let task_stats = stats.clone();
            let work = Box::new(move || {
                update_stats(&task_stats, |s| s.current_running += 1);
                let outcome = run_job(&task_rt, job);
                update_stats(&task_stats, |s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    match &outcome {
                        ExecutionOutcome::Succeeded => s.jobs_succeeded += 1,
                        ExecutionOutcome::Failed { retries_left: 0, .. } => {
                            s.jobs_failed += 1;
                            s.jobs_exhausted += 1;
                        }
                        ExecutionOutcome::Failed { .. } => s.jobs_failed += 1,
                        ExecutionOutcome::Orphaned => s.jobs_orphaned += 1,
                    }
                });
            });

            if pool.schedule(work, long_running) {
                scheduled += 1;
            } else {
                update_stats(&stats, |s| s.jobs_rejected += 1);
                release_lock(&rt.store, job_id, revision);
            }
        }

        if scheduled == 0 {
            match shutdown_rx.recv_timeout(rt.config.acquisition_idle_wait) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    pool.shutdown();
    info!(owner = %owner, "job executor stopped");
}

/// Unlock a job the pool rejected, if nobody touched it since it was claimed.
fn release_lock<S: BatchStore + ?Sized>(store: &S, job_id: JobId, revision: u64) {
    let job = match store.find_job(job_id) {
        Ok(Some(job)) if job.revision == revision => job,
        Ok(_) => return,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "failed to load rejected job");
            return;
        }
    };
    let mut released = job;
    released.unlock();
    let mut changes = ChangeSet::new();
    changes.push(Change::UpdateJob {
        job: released,
        expected: ExpectedVersion::Exact(revision),
    });
    if let Err(e) = store.commit(changes) {
        debug!(job_id = %job_id, error = %e, "rejected job lock left to expire");
    }
}
