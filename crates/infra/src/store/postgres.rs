//! Postgres-backed batch store.
//!
//! Every [`ChangeSet`] runs in one transaction. Revision-checked changes lock
//! the target row (`SELECT ... FOR UPDATE`) before comparing revisions, so two
//! transactions racing on the same row serialize and the loser observes the
//! bumped revision. History events are applied to the history tables in the
//! same transaction; their sequence numbers come from `history_sequence`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) on insert | `23505` | `AlreadyExists` |
//! | Database (unique violation) elsewhere | `23505` | `Concurrency` |
//! | Database (serialization failure) | `40001` | `Concurrency` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / network / decode | N/A | `Backend` |
//!
//! ## Threading
//!
//! [`BatchStore`] is synchronous. The store owns a small tokio runtime and
//! blocks on it, so it must be called from plain threads (the executor's worker
//! threads), never from inside an async context.

use std::future::Future;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use forgebatch_batch::{Batch, Variables};
use forgebatch_core::{BatchId, ExpectedVersion, JobDefinitionId, JobId};
use forgebatch_events::{HistoryEvent, JobLogKind};

use super::query::{BatchQuery, HistoricBatchQuery, HistoricJobLogQuery, JobQuery};
use super::{BatchStore, Change, ChangeSet, StoreError};
use crate::jobs::{Job, JobDefinition, JobDefinitionKind};
use crate::projections::{HistoricBatch, HistoricJobLogEntry, OperationLogEntry};

const SCHEMA: &str = include_str!("../../migrations/0001_batch_schema.sql");

/// Postgres implementation of [`BatchStore`].
#[derive(Debug)]
pub struct PostgresBatchStore {
    pool: PgPool,
    runtime: tokio::runtime::Runtime,
}

impl PostgresBatchStore {
    /// Connect to `database_url` with a pool of at most `max_connections`.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("forgebatch-pg")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Backend(format!("failed to start store runtime: {e}")))?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool, runtime })
    }

    /// Create the batch tables if they do not exist.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.block_on(async {
            sqlx::raw_sql(SCHEMA)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
            Ok(())
        })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    async fn apply_changes(&self, changes: ChangeSet) -> Result<(), StoreError> {
        let (events, rows): (Vec<Change>, Vec<Change>) = changes
            .into_changes()
            .into_iter()
            .partition(|c| matches!(c, Change::Record(_)));

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // An early return drops `tx`, which rolls it back.
        for change in rows {
            apply_change(&mut tx, change).await?;
        }
        for change in events {
            if let Change::Record(event) = change {
                record_event(&mut tx, event).await?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

impl BatchStore for PostgresBatchStore {
    fn find_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        self.block_on(async {
            let row = sqlx::query("SELECT * FROM batch WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("find_batch", e))?;
            row.as_ref()
                .map(batch_from_row)
                .transpose()
                .map_err(|e| map_sqlx_error("find_batch", e))
        })
    }

    fn list_batches(&self, query: &BatchQuery) -> Result<Vec<Batch>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT * FROM batch
                WHERE ($1::uuid IS NULL OR id = $1)
                    AND ($2::text IS NULL OR batch_type = $2)
                    AND ($3::boolean IS NULL OR suspended = $3)
                ORDER BY id
                "#,
            )
            .bind(query.id.map(|id| *id.as_uuid()))
            .bind(query.batch_type.as_deref())
            .bind(query.suspended)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_batches", e))?;
            rows.iter()
                .map(batch_from_row)
                .collect::<Result<_, _>>()
                .map_err(|e| map_sqlx_error("list_batches", e))
        })
    }

    fn find_job_definition(&self, id: JobDefinitionId) -> Result<Option<JobDefinition>, StoreError> {
        self.block_on(async {
            let row = sqlx::query("SELECT * FROM job_definition WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("find_job_definition", e))?;
            row.as_ref()
                .map(job_definition_from_row)
                .transpose()
                .map_err(|e| map_sqlx_error("find_job_definition", e))
        })
    }

    fn job_definitions_for_batch(&self, batch_id: BatchId) -> Result<Vec<JobDefinition>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query("SELECT * FROM job_definition WHERE configuration = $1 ORDER BY id")
                .bind(batch_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("job_definitions_for_batch", e))?;
            rows.iter()
                .map(job_definition_from_row)
                .collect::<Result<_, _>>()
                .map_err(|e| map_sqlx_error("job_definitions_for_batch", e))
        })
    }

    fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.block_on(async {
            let row = sqlx::query("SELECT * FROM job WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("find_job", e))?;
            row.as_ref()
                .map(job_from_row)
                .transpose()
                .map_err(|e| map_sqlx_error("find_job", e))
        })
    }

    fn list_jobs(&self, query: &JobQuery, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT * FROM job
                WHERE ($1::uuid IS NULL OR job_definition_id = $1)
                    AND ($2::uuid IS NULL OR batch_id = $2)
                ORDER BY id
                "#,
            )
            .bind(query.job_definition_id.map(|id| *id.as_uuid()))
            .bind(query.batch_id.map(|id| *id.as_uuid()))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;
            let jobs: Vec<Job> = rows
                .iter()
                .map(job_from_row)
                .collect::<Result<_, _>>()
                .map_err(|e| map_sqlx_error("list_jobs", e))?;
            Ok(jobs.into_iter().filter(|j| query.matches(j, now)).collect())
        })
    }

    fn count_jobs(&self, job_definition_id: JobDefinitionId) -> Result<u64, StoreError> {
        self.block_on(async {
            let row = sqlx::query("SELECT COUNT(*) AS total FROM job WHERE job_definition_id = $1")
                .bind(job_definition_id.as_uuid())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_jobs", e))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| map_sqlx_error("count_jobs", e))?;
            Ok(total as u64)
        })
    }

    fn acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT * FROM job
                WHERE suspended = FALSE
                    AND retries > 0
                    AND (due_date IS NULL OR due_date <= $1)
                    AND (lock_owner IS NULL OR lock_expiration_time IS NULL OR lock_expiration_time <= $1)
                ORDER BY COALESCE(due_date, created_at), id
                LIMIT $2
                "#,
            )
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("acquirable_jobs", e))?;
            rows.iter()
                .map(job_from_row)
                .collect::<Result<_, _>>()
                .map_err(|e| map_sqlx_error("acquirable_jobs", e))
        })
    }

    #[instrument(skip(self, now, lock_until), fields(job_id = %id), err)]
    fn try_lock_job(
        &self,
        id: JobId,
        expected_revision: u64,
        owner: &str,
        now: DateTime<Utc>,
        lock_until: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        self.block_on(async {
            let row = sqlx::query(
                r#"
                UPDATE job
                SET lock_owner = $3, lock_expiration_time = $4, revision = revision + 1
                WHERE id = $1
                    AND revision = $2
                    AND (lock_owner IS NULL OR lock_expiration_time IS NULL OR lock_expiration_time <= $5)
                RETURNING *
                "#,
            )
            .bind(id.as_uuid())
            .bind(expected_revision as i64)
            .bind(owner)
            .bind(lock_until)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("try_lock_job", e))?;
            if row.is_none() {
                debug!(job_id = %id, expected_revision, "lost lock claim");
            }
            row.as_ref()
                .map(job_from_row)
                .transpose()
                .map_err(|e| map_sqlx_error("try_lock_job", e))
        })
    }

    fn batch_variables(&self, batch_id: BatchId) -> Result<Variables, StoreError> {
        self.block_on(async {
            let row = sqlx::query("SELECT variables FROM batch_variables WHERE batch_id = $1")
                .bind(batch_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("batch_variables", e))?;
            match row {
                Some(row) => {
                    let Json(variables): Json<Variables> = row
                        .try_get("variables")
                        .map_err(|e| map_sqlx_error("batch_variables", e))?;
                    Ok(variables)
                }
                None => Ok(Variables::new()),
            }
        })
    }

    fn find_historic_batch(&self, id: BatchId) -> Result<Option<HistoricBatch>, StoreError> {
        self.block_on(async {
            let row = sqlx::query("SELECT * FROM historic_batch WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("find_historic_batch", e))?;
            row.as_ref()
                .map(historic_batch_from_row)
                .transpose()
                .map_err(|e| map_sqlx_error("find_historic_batch", e))
        })
    }

    fn list_historic_batches(&self, query: &HistoricBatchQuery) -> Result<Vec<HistoricBatch>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                "SELECT * FROM historic_batch WHERE ($1::text IS NULL OR batch_type = $1) ORDER BY id",
            )
            .bind(query.batch_type.as_deref())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_historic_batches", e))?;
            let batches: Vec<HistoricBatch> = rows
                .iter()
                .map(historic_batch_from_row)
                .collect::<Result<_, _>>()
                .map_err(|e| map_sqlx_error("list_historic_batches", e))?;
            Ok(batches.into_iter().filter(|b| b.matches(query)).collect())
        })
    }

    fn historic_job_log(&self, query: &HistoricJobLogQuery) -> Result<Vec<HistoricJobLogEntry>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(
                r#"
                SELECT * FROM historic_job_log
                WHERE ($1::uuid IS NULL OR job_definition_id = $1)
                    AND ($2::uuid IS NULL OR batch_id = $2)
                    AND ($3::uuid IS NULL OR job_id = $3)
                    AND ($4::text IS NULL OR kind = $4)
                ORDER BY sequence_number
                "#,
            )
            .bind(query.job_definition_id.map(|id| *id.as_uuid()))
            .bind(query.batch_id.map(|id| *id.as_uuid()))
            .bind(query.job_id.map(|id| *id.as_uuid()))
            .bind(query.kind.map(|k| k.as_str()))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("historic_job_log", e))?;
            rows.iter()
                .map(job_log_entry_from_row)
                .collect::<Result<_, _>>()
                .map_err(|e| map_sqlx_error("historic_job_log", e))
        })
    }

    fn operation_log(&self, batch_id: BatchId) -> Result<Vec<OperationLogEntry>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query("SELECT * FROM operation_log WHERE batch_id = $1 ORDER BY sequence_number")
                .bind(batch_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("operation_log", e))?;
            rows.iter()
                .map(operation_log_entry_from_row)
                .collect::<Result<_, _>>()
                .map_err(|e| map_sqlx_error("operation_log", e))
        })
    }

    #[instrument(skip(self, changes), fields(changes = changes.len()), err)]
    fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.block_on(self.apply_changes(changes))
    }
}

/// Lock a row and check its revision. Returns the current revision.
async fn lock_revision(
    tx: &mut Transaction<'_, Postgres>,
    table: &'static str,
    id: Uuid,
    expected: ExpectedVersion,
) -> Result<u64, StoreError> {
    let row = sqlx::query(&format!("SELECT revision FROM {table} WHERE id = $1 FOR UPDATE"))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_revision", e))?;
    let Some(row) = row else {
        return Err(StoreError::NotFound(format!("{table} {id}")));
    };
    let revision = row
        .try_get::<i64, _>("revision")
        .map_err(|e| map_sqlx_error("lock_revision", e))? as u64;
    if !expected.matches(revision) {
        return Err(StoreError::Concurrency(format!(
            "{table} {id}: expected {expected:?}, found {revision}"
        )));
    }
    Ok(revision)
}

async fn apply_change(tx: &mut Transaction<'_, Postgres>, change: Change) -> Result<(), StoreError> {
    match change {
        Change::InsertBatch(batch) => {
            sqlx::query(
                r#"
                INSERT INTO batch (
                    id, batch_type, total_size, batch_jobs_per_seed, invocations_per_batch_job,
                    seed_job_definition_id, monitor_job_definition_id, batch_job_definition_id,
                    configuration, jobs_created, suspended, start_time, execution_start_time, revision
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(batch.id.as_uuid())
            .bind(&batch.batch_type)
            .bind(batch.total_size as i64)
            .bind(batch.batch_jobs_per_seed as i32)
            .bind(batch.invocations_per_batch_job as i32)
            .bind(batch.seed_job_definition_id.as_uuid())
            .bind(batch.monitor_job_definition_id.as_uuid())
            .bind(batch.batch_job_definition_id.as_uuid())
            .bind(&batch.configuration_payload)
            .bind(batch.jobs_created as i64)
            .bind(batch.suspended)
            .bind(batch.start_time)
            .bind(batch.execution_start_time)
            .bind(batch.revision as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_insert_error("insert_batch", &format!("batch {}", batch.id), e))?;
        }
        Change::UpdateBatch { batch, expected } => {
            let revision = lock_revision(tx, "batch", *batch.id.as_uuid(), expected).await?;
            sqlx::query(
                r#"
                UPDATE batch
                SET configuration = $2, jobs_created = $3, suspended = $4,
                    execution_start_time = $5, revision = $6
                WHERE id = $1
                "#,
            )
            .bind(batch.id.as_uuid())
            .bind(&batch.configuration_payload)
            .bind(batch.jobs_created as i64)
            .bind(batch.suspended)
            .bind(batch.execution_start_time)
            .bind((revision + 1) as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("update_batch", e))?;
        }
        Change::MarkBatchExecutionStarted { batch_id, at } => {
            sqlx::query(
                "UPDATE batch SET execution_start_time = COALESCE(execution_start_time, $2) WHERE id = $1",
            )
            .bind(batch_id.as_uuid())
            .bind(at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("mark_batch_execution_started", e))?;
        }
        Change::DeleteBatch { id, expected } => {
            lock_revision(tx, "batch", *id.as_uuid(), expected).await?;
            sqlx::query("DELETE FROM batch WHERE id = $1")
                .bind(id.as_uuid())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("delete_batch", e))?;
        }
        Change::InsertJobDefinition(definition) => {
            sqlx::query(
                r#"
                INSERT INTO job_definition (id, kind, job_type, configuration, suspended)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(definition.id.as_uuid())
            .bind(definition.kind.as_str())
            .bind(&definition.job_type)
            .bind(definition.configuration.as_uuid())
            .bind(definition.suspended)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                map_insert_error("insert_job_definition", &format!("job definition {}", definition.id), e)
            })?;
        }
        Change::SetJobDefinitionSuspended { id, suspended } => {
            sqlx::query("UPDATE job_definition SET suspended = $2 WHERE id = $1")
                .bind(id.as_uuid())
                .bind(suspended)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("set_job_definition_suspended", e))?;
        }
        Change::DeleteJobDefinition(id) => {
            sqlx::query("DELETE FROM job_definition WHERE id = $1")
                .bind(id.as_uuid())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("delete_job_definition", e))?;
        }
        Change::InsertJob(job) => {
            sqlx::query(
                r#"
                INSERT INTO job (
                    id, job_definition_id, batch_id, kind, job_type, due_date, retries,
                    lock_owner, lock_expiration_time, exception_message, payload, suspended,
                    created_at, revision
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.job_definition_id.as_uuid())
            .bind(job.batch_id.as_uuid())
            .bind(job.kind.as_str())
            .bind(&job.job_type)
            .bind(job.due_date)
            .bind(job.retries as i32)
            .bind(job.lock_owner.as_deref())
            .bind(job.lock_expiration_time)
            .bind(job.exception_message.as_deref())
            .bind(&job.payload)
            .bind(job.suspended)
            .bind(job.created_at)
            .bind(job.revision as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_insert_error("insert_job", &format!("job {}", job.id), e))?;
        }
        Change::UpdateJob { job, expected } => {
            let revision = lock_revision(tx, "job", *job.id.as_uuid(), expected).await?;
            sqlx::query(
                r#"
                UPDATE job
                SET due_date = $2, retries = $3, lock_owner = $4, lock_expiration_time = $5,
                    exception_message = $6, payload = $7, suspended = $8, revision = $9
                WHERE id = $1
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.due_date)
            .bind(job.retries as i32)
            .bind(job.lock_owner.as_deref())
            .bind(job.lock_expiration_time)
            .bind(job.exception_message.as_deref())
            .bind(&job.payload)
            .bind(job.suspended)
            .bind((revision + 1) as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("update_job", e))?;
        }
        Change::SetJobRetries { id, retries } => {
            let updated = sqlx::query("UPDATE job SET retries = $2, revision = revision + 1 WHERE id = $1")
                .bind(id.as_uuid())
                .bind(retries as i32)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("set_job_retries", e))?;
            if updated.rows_affected() == 0 {
                return Err(StoreError::NotFound(format!("job {id}")));
            }
        }
        Change::DeleteJob { id, expected } => {
            lock_revision(tx, "job", *id.as_uuid(), expected).await?;
            sqlx::query("DELETE FROM job WHERE id = $1")
                .bind(id.as_uuid())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("delete_job", e))?;
        }
        Change::DeleteJobsByDefinition(job_definition_id) => {
            sqlx::query("DELETE FROM job WHERE job_definition_id = $1")
                .bind(job_definition_id.as_uuid())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("delete_jobs_by_definition", e))?;
        }
        Change::SetJobsSuspendedByDefinition {
            job_definition_id,
            suspended,
        } => {
            sqlx::query(
                r#"
                UPDATE job SET suspended = $2, revision = revision + 1
                WHERE job_definition_id = $1 AND suspended <> $2
                "#,
            )
            .bind(job_definition_id.as_uuid())
            .bind(suspended)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("set_jobs_suspended", e))?;
        }
        Change::PutVariables { batch_id, variables } => {
            sqlx::query(
                r#"
                INSERT INTO batch_variables (batch_id, variables) VALUES ($1, $2)
                ON CONFLICT (batch_id) DO UPDATE SET variables = EXCLUDED.variables
                "#,
            )
            .bind(batch_id.as_uuid())
            .bind(Json(&variables))
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("put_variables", e))?;
        }
        Change::DeleteVariables(batch_id) => {
            sqlx::query("DELETE FROM batch_variables WHERE batch_id = $1")
                .bind(batch_id.as_uuid())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("delete_variables", e))?;
        }
        // Partitioned out by the caller.
        Change::Record(_) => {}
    }
    Ok(())
}

async fn record_event(tx: &mut Transaction<'_, Postgres>, event: HistoryEvent) -> Result<(), StoreError> {
    match event {
        HistoryEvent::BatchStarted(e) => {
            sqlx::query(
                r#"
                INSERT INTO historic_batch (
                    id, batch_type, size, batch_jobs_per_seed, invocations_per_batch_job,
                    seed_job_definition_id, monitor_job_definition_id, batch_job_definition_id,
                    start_time
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(e.batch_id.as_uuid())
            .bind(&e.batch_type)
            .bind(e.size as i64)
            .bind(e.batch_jobs_per_seed as i32)
            .bind(e.invocations_per_batch_job as i32)
            .bind(e.seed_job_definition_id.as_uuid())
            .bind(e.monitor_job_definition_id.as_uuid())
            .bind(e.batch_job_definition_id.as_uuid())
            .bind(e.occurred_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("record_batch_started", e))?;
        }
        HistoryEvent::BatchExecutionStarted(e) => {
            sqlx::query(
                "UPDATE historic_batch SET execution_start_time = COALESCE(execution_start_time, $2) WHERE id = $1",
            )
            .bind(e.batch_id.as_uuid())
            .bind(e.occurred_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("record_batch_execution_started", e))?;
        }
        HistoryEvent::BatchEnded(e) => {
            sqlx::query("UPDATE historic_batch SET end_time = COALESCE(end_time, $2) WHERE id = $1")
                .bind(e.batch_id.as_uuid())
                .bind(e.occurred_at)
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("record_batch_ended", e))?;
        }
        HistoryEvent::JobLogged(e) => {
            sqlx::query(
                r#"
                INSERT INTO historic_job_log (
                    sequence_number, job_id, job_definition_id, job_definition_type, batch_id,
                    kind, retries, exception_message, timestamp
                )
                VALUES (nextval('history_sequence'), $1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(e.job_id.as_uuid())
            .bind(e.job_definition_id.as_uuid())
            .bind(&e.job_definition_type)
            .bind(e.batch_id.as_uuid())
            .bind(e.kind.as_str())
            .bind(e.retries as i32)
            .bind(e.exception_message.as_deref())
            .bind(e.occurred_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("record_job_logged", e))?;
        }
        HistoryEvent::OperationLogged(e) => {
            sqlx::query(
                r#"
                INSERT INTO operation_log (sequence_number, batch_id, operation, properties, timestamp)
                VALUES (nextval('history_sequence'), $1, $2, $3, $4)
                "#,
            )
            .bind(e.batch_id.as_uuid())
            .bind(&e.operation)
            .bind(Json(&e.properties))
            .bind(e.occurred_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("record_operation_logged", e))?;
        }
        HistoryEvent::HistoryRemoved(e) => {
            for sql in [
                "DELETE FROM historic_job_log WHERE batch_id = $1",
                "DELETE FROM operation_log WHERE batch_id = $1",
                "DELETE FROM historic_batch WHERE id = $1",
            ] {
                sqlx::query(sql)
                    .bind(e.batch_id.as_uuid())
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| map_sqlx_error("record_history_removed", e))?;
            }
        }
    }
    Ok(())
}

// Row decoding

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

fn batch_from_row(row: &PgRow) -> Result<Batch, sqlx::Error> {
    Ok(Batch {
        id: BatchId::from_uuid(row.try_get("id")?),
        batch_type: row.try_get("batch_type")?,
        total_size: row.try_get::<i64, _>("total_size")? as u64,
        batch_jobs_per_seed: row.try_get::<i32, _>("batch_jobs_per_seed")? as u32,
        invocations_per_batch_job: row.try_get::<i32, _>("invocations_per_batch_job")? as u32,
        seed_job_definition_id: JobDefinitionId::from_uuid(row.try_get("seed_job_definition_id")?),
        monitor_job_definition_id: JobDefinitionId::from_uuid(row.try_get("monitor_job_definition_id")?),
        batch_job_definition_id: JobDefinitionId::from_uuid(row.try_get("batch_job_definition_id")?),
        configuration_payload: row.try_get("configuration")?,
        jobs_created: row.try_get::<i64, _>("jobs_created")? as u64,
        suspended: row.try_get("suspended")?,
        start_time: row.try_get("start_time")?,
        execution_start_time: row.try_get("execution_start_time")?,
        revision: row.try_get::<i64, _>("revision")? as u64,
    })
}

fn job_definition_kind(value: &str) -> Result<JobDefinitionKind, sqlx::Error> {
    JobDefinitionKind::parse(value).map_err(|e| decode_error(e.to_string()))
}

fn job_definition_from_row(row: &PgRow) -> Result<JobDefinition, sqlx::Error> {
    Ok(JobDefinition {
        id: JobDefinitionId::from_uuid(row.try_get("id")?),
        kind: job_definition_kind(row.try_get("kind")?)?,
        job_type: row.try_get("job_type")?,
        configuration: BatchId::from_uuid(row.try_get("configuration")?),
        suspended: row.try_get("suspended")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    Ok(Job {
        id: JobId::from_uuid(row.try_get("id")?),
        job_definition_id: JobDefinitionId::from_uuid(row.try_get("job_definition_id")?),
        batch_id: BatchId::from_uuid(row.try_get("batch_id")?),
        kind: job_definition_kind(row.try_get("kind")?)?,
        job_type: row.try_get("job_type")?,
        due_date: row.try_get("due_date")?,
        retries: row.try_get::<i32, _>("retries")? as u32,
        lock_owner: row.try_get("lock_owner")?,
        lock_expiration_time: row.try_get("lock_expiration_time")?,
        exception_message: row.try_get("exception_message")?,
        payload: row.try_get("payload")?,
        suspended: row.try_get("suspended")?,
        created_at: row.try_get("created_at")?,
        revision: row.try_get::<i64, _>("revision")? as u64,
    })
}

fn historic_batch_from_row(row: &PgRow) -> Result<HistoricBatch, sqlx::Error> {
    Ok(HistoricBatch {
        id: BatchId::from_uuid(row.try_get("id")?),
        batch_type: row.try_get("batch_type")?,
        size: row.try_get::<i64, _>("size")? as u64,
        batch_jobs_per_seed: row.try_get::<i32, _>("batch_jobs_per_seed")? as u32,
        invocations_per_batch_job: row.try_get::<i32, _>("invocations_per_batch_job")? as u32,
        seed_job_definition_id: JobDefinitionId::from_uuid(row.try_get("seed_job_definition_id")?),
        monitor_job_definition_id: JobDefinitionId::from_uuid(row.try_get("monitor_job_definition_id")?),
        batch_job_definition_id: JobDefinitionId::from_uuid(row.try_get("batch_job_definition_id")?),
        start_time: row.try_get("start_time")?,
        execution_start_time: row.try_get("execution_start_time")?,
        end_time: row.try_get("end_time")?,
    })
}

fn job_log_entry_from_row(row: &PgRow) -> Result<HistoricJobLogEntry, sqlx::Error> {
    let kind: &str = row.try_get("kind")?;
    Ok(HistoricJobLogEntry {
        sequence_number: row.try_get::<i64, _>("sequence_number")? as u64,
        job_id: JobId::from_uuid(row.try_get("job_id")?),
        job_definition_id: JobDefinitionId::from_uuid(row.try_get("job_definition_id")?),
        job_definition_type: row.try_get("job_definition_type")?,
        batch_id: BatchId::from_uuid(row.try_get("batch_id")?),
        kind: JobLogKind::parse(kind).ok_or_else(|| decode_error(format!("unknown job log kind '{kind}'")))?,
        retries: row.try_get::<i32, _>("retries")? as u32,
        exception_message: row.try_get("exception_message")?,
        timestamp: row.try_get("timestamp")?,
    })
}

fn operation_log_entry_from_row(row: &PgRow) -> Result<OperationLogEntry, sqlx::Error> {
    let Json(properties) = row.try_get("properties")?;
    Ok(OperationLogEntry {
        sequence_number: row.try_get::<i64, _>("sequence_number")? as u64,
        batch_id: BatchId::from_uuid(row.try_get("batch_id")?),
        operation: row.try_get("operation")?,
        properties,
        timestamp: row.try_get("timestamp")?,
    })
}

// Error mapping

fn map_insert_error(operation: &str, what: &str, err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::AlreadyExists(what.to_string())
    } else {
        map_sqlx_error(operation, err)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") => StoreError::Concurrency(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
