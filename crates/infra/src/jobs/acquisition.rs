//! Job acquisition: claim due jobs by optimistic lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::types::{Job, due_after};
use crate::store::{BatchStore, StoreError};

/// Claim up to `max_jobs` acquirable jobs for `owner`.
///
/// Candidates are read first and then claimed one by one with a
/// compare-and-swap on their revision. A candidate claimed by another
/// acquirer in between is skipped, never double-claimed.
pub fn acquire_jobs<S: BatchStore + ?Sized>(
    store: &S,
    now: DateTime<Utc>,
    owner: &str,
    lock_time: Duration,
    max_jobs: usize,
) -> Result<Vec<Job>, StoreError> {
    if max_jobs == 0 {
        return Ok(Vec::new());
    }

    let lock_until = due_after(now, lock_time);
    let mut acquired = Vec::new();
    for candidate in store.acquirable_jobs(now, max_jobs)? {
        match store.try_lock_job(candidate.id, candidate.revision, owner, now, lock_until)? {
            Some(job) => acquired.push(job),
            None => debug!(job_id = %candidate.id, "job claimed by another acquirer"),
        }
    }
    Ok(acquired)
}
