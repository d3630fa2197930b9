//! Integration tests for the batch lifecycle.
//!
//! Tests: create → seed → work items → monitor → finalize / delete
//!
//! Verifies:
//! - Partitioning creates exactly one work-item job per shard
//! - Retry bookkeeping and terminal failures
//! - Historic batch, job log and operation log contents
//! - The background executor drives a batch to completion

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, Utc};
    use proptest::prelude::*;

    use forgebatch_batch::{
        Batch, ItemContext, ItemError, NewBatch, OperationFn, TypedValue, Variables, WorkItemShard,
    };
    use forgebatch_core::{BatchId, Clock, DomainError, FrozenClock, JobDefinitionId, JobId};
    use forgebatch_events::JobLogKind;

    use crate::config::EngineConfig;
    use crate::engine::{BatchEngine, EngineError};
    use crate::jobs::{ExecutionOutcome, Job, JobDefinition, JobExecutor, acquire_jobs, run_job};
    use crate::projections::{HistoricBatch, HistoricJobLogEntry, OperationLogEntry};
    use crate::store::{
        BatchQuery, BatchStore, ChangeSet, HistoricBatchQuery, HistoricJobLogQuery, InMemoryBatchStore, JobQuery,
        StoreError,
    };
    use crate::workers::WorkerPoolConfig;

    const BATCH_TYPE: &str = "instance-migration";

    type Engine = BatchEngine<Arc<InMemoryBatchStore>>;

    struct Fixture {
        engine: Engine,
        clock: Arc<FrozenClock>,
        /// Items the operation refuses, as if the entity was deleted.
        deleted: Arc<Mutex<HashSet<String>>>,
        /// Every successful item application, in order.
        applied: Arc<Mutex<Vec<String>>>,
    }

    fn fixture() -> Fixture {
        fixture_with(EngineConfig::default())
    }

    fn fixture_with(config: EngineConfig) -> Fixture {
        let clock = Arc::new(FrozenClock::now_truncated());
        let deleted = Arc::new(Mutex::new(HashSet::<String>::new()));
        let applied = Arc::new(Mutex::new(Vec::<String>::new()));

        let (op_deleted, op_applied) = (deleted.clone(), applied.clone());
        let engine = BatchEngine::builder(InMemoryBatchStore::arc())
            .config(config)
            .clock(clock.clone())
            .operation(OperationFn::new(BATCH_TYPE, move |item: &ItemContext<'_>| {
                if op_deleted.lock().unwrap().contains(item.item_id) {
                    return Err(ItemError::new(
                        "ENGINE-23004",
                        format!("Process instance '{}' cannot be migrated", item.item_id),
                    ));
                }
                op_applied.lock().unwrap().push(item.item_id.to_string());
                Ok(())
            }))
            .build();

        Fixture {
            engine,
            clock,
            deleted,
            applied,
        }
    }

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("instance-{i}")).collect()
    }

    fn jobs(f: &Fixture, job_definition_id: JobDefinitionId) -> Vec<Job> {
        f.engine
            .query_jobs(&JobQuery::for_job_definition(job_definition_id))
            .unwrap()
    }

    fn seed_job(f: &Fixture, batch: &Batch) -> Option<Job> {
        jobs(f, batch.seed_job_definition_id).into_iter().next()
    }

    fn monitor_job(f: &Fixture, batch: &Batch) -> Option<Job> {
        jobs(f, batch.monitor_job_definition_id).into_iter().next()
    }

    fn job_for_item(f: &Fixture, batch: &Batch, item_id: &str) -> Job {
        jobs(f, batch.batch_job_definition_id)
            .into_iter()
            .find(|j| WorkItemShard::from_bytes(&j.payload).unwrap().items.iter().any(|i| i == item_id))
            .expect("job for item")
    }

    fn execute(f: &Fixture, job: &Job) -> ExecutionOutcome {
        f.engine.execute_job(job.id).unwrap()
    }

    fn execute_seed_job(f: &Fixture, batch: &Batch) {
        let seed = seed_job(f, batch).expect("seed job");
        assert_eq!(execute(f, &seed), ExecutionOutcome::Succeeded);
    }

    fn execute_seed_jobs(f: &Fixture, batch: &Batch) {
        while let Some(seed) = seed_job(f, batch) {
            assert_eq!(execute(f, &seed), ExecutionOutcome::Succeeded);
        }
    }

    fn execute_work_item_jobs(f: &Fixture, batch: &Batch) {
        for job in jobs(f, batch.batch_job_definition_id) {
            execute(f, &job);
        }
    }

    fn execute_monitor_job(f: &Fixture, batch: &Batch) -> ExecutionOutcome {
        execute(f, &monitor_job(f, batch).expect("monitor job"))
    }

    fn log(f: &Fixture, job_definition_id: JobDefinitionId) -> Vec<(JobLogKind, u32)> {
        f.engine
            .query_historic_job_log(&HistoricJobLogQuery::for_job_definition(job_definition_id))
            .unwrap()
            .iter()
            .map(|e| (e.kind, e.retries))
            .collect()
    }

    fn create(f: &Fixture, size: usize, per_seed: u32, invocations: u32) -> Batch {
        f.engine
            .create_batch(
                NewBatch::new(BATCH_TYPE, items(size))
                    .with_batch_jobs_per_seed(per_seed)
                    .with_invocations_per_batch_job(invocations),
            )
            .unwrap()
    }

    #[test]
    fn create_batch_persists_definitions_and_seed_job() {
        let f = fixture();
        let batch = create(&f, 20, 10, 1);

        let definitions = f.engine.job_definitions(batch.id).unwrap();
        assert_eq!(definitions.len(), 3);
        let ids: HashSet<JobDefinitionId> = definitions.iter().map(|d| d.id).collect();
        assert_eq!(ids, HashSet::from(batch.job_definition_ids()));

        let seed = seed_job(&f, &batch).unwrap();
        assert_eq!(seed.retries, 3);
        assert!(seed.due_date.is_none());
        assert!(monitor_job(&f, &batch).is_none());
        assert!(jobs(&f, batch.batch_job_definition_id).is_empty());

        let historic = f.engine.query_historic_batch(batch.id).unwrap();
        assert_eq!(historic.size, 20);
        assert_eq!(historic.start_time, f.clock.now());
        assert!(historic.end_time.is_none());
        assert_eq!(log(&f, batch.seed_job_definition_id), vec![(JobLogKind::Creation, 3)]);
    }

    #[test]
    fn seed_job_creates_bounded_number_of_jobs_per_invocation() {
        let f = fixture();
        let batch = create(&f, 20, 10, 1);

        execute_seed_job(&f, &batch);
        assert_eq!(jobs(&f, batch.batch_job_definition_id).len(), 10);
        assert!(seed_job(&f, &batch).is_some());
        assert!(monitor_job(&f, &batch).is_none());

        execute_seed_job(&f, &batch);
        assert_eq!(jobs(&f, batch.batch_job_definition_id).len(), 20);
        assert!(seed_job(&f, &batch).is_none());

        let batch = f.engine.get_batch(batch.id).unwrap();
        assert_eq!(batch.jobs_created, 20);
        assert_eq!(batch.configuration().unwrap().remaining(), 0);
        assert_eq!(
            log(&f, batch.seed_job_definition_id),
            vec![
                (JobLogKind::Creation, 3),
                (JobLogKind::Success, 3),
                (JobLogKind::Success, 3),
            ]
        );
    }

    #[test]
    fn shards_cover_items_in_order() {
        let f = fixture();
        let batch = create(&f, 7, 10, 3);
        execute_seed_jobs(&f, &batch);

        let mut shards: Vec<Vec<String>> = jobs(&f, batch.batch_job_definition_id)
            .iter()
            .map(|j| WorkItemShard::from_bytes(&j.payload).unwrap().items)
            .collect();
        shards.sort();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards.concat(), items(7));
        assert_eq!(shards[2], vec!["instance-6".to_string()]);
    }

    #[test]
    fn monitor_job_is_due_one_poll_interval_after_seeding_completes() {
        let f = fixture();
        let batch = create(&f, 4, 10, 1);
        let t = f.clock.now();

        execute_seed_jobs(&f, &batch);

        let monitor = monitor_job(&f, &batch).unwrap();
        assert_eq!(monitor.due_date, Some(t + Duration::seconds(30)));
        assert!(!monitor.is_acquirable(t));
        assert!(monitor.is_acquirable(t + Duration::seconds(30)));
    }

    #[test]
    fn monitor_job_reschedules_while_work_remains() {
        let f = fixture();
        let batch = create(&f, 2, 10, 1);
        execute_seed_jobs(&f, &batch);

        f.clock.advance(Duration::seconds(30));
        assert_eq!(execute_monitor_job(&f, &batch), ExecutionOutcome::Succeeded);

        let monitor = monitor_job(&f, &batch).unwrap();
        assert_eq!(monitor.due_date, Some(f.clock.now() + Duration::seconds(30)));
        assert!(monitor.lock_owner.is_none());
        assert_eq!(f.engine.list_batches(&BatchQuery::default()).unwrap().len(), 1);
    }

    #[test]
    fn batch_is_finalized_once_all_jobs_are_done() {
        let f = fixture();
        let batch = f
            .engine
            .create_batch(
                NewBatch::new(BATCH_TYPE, items(3))
                    .with_variables(Variables::from([("foo".to_string(), TypedValue::from("bar"))])),
            )
            .unwrap();

        execute_seed_jobs(&f, &batch);
        execute_work_item_jobs(&f, &batch);
        assert!(jobs(&f, batch.batch_job_definition_id).is_empty());

        f.clock.advance(Duration::seconds(30));
        assert_eq!(execute_monitor_job(&f, &batch), ExecutionOutcome::Succeeded);

        assert!(f.engine.list_batches(&BatchQuery::default()).unwrap().is_empty());
        assert!(f.engine.job_definitions(batch.id).unwrap().is_empty());
        assert!(f.engine.batch_variables(batch.id).unwrap().is_empty());
        assert!(f.engine.query_jobs(&JobQuery::for_batch(batch.id)).unwrap().is_empty());

        let historic = f.engine.query_historic_batch(batch.id).unwrap();
        assert_eq!(historic.end_time, Some(f.clock.now()));
        assert!(historic.execution_start_time.is_some());
        assert_eq!(*f.applied.lock().unwrap(), items(3));
        assert_eq!(
            log(&f, batch.monitor_job_definition_id),
            vec![(JobLogKind::Creation, 3), (JobLogKind::Success, 3)]
        );
    }

    #[test]
    fn execution_start_time_is_recorded_once() {
        let f = fixture();
        let batch = create(&f, 2, 10, 1);
        execute_seed_jobs(&f, &batch);
        assert!(f.engine.get_batch(batch.id).unwrap().execution_start_time.is_none());

        let first_start = f.clock.now() + Duration::seconds(1);
        f.clock.set(first_start);
        let work = jobs(&f, batch.batch_job_definition_id);
        execute(&f, &work[0]);
        f.clock.advance(Duration::seconds(5));
        execute(&f, &work[1]);

        let live = f.engine.get_batch(batch.id).unwrap();
        assert_eq!(live.execution_start_time, Some(first_start));
        let historic = f.engine.query_historic_batch(batch.id).unwrap();
        assert_eq!(historic.execution_start_time, Some(first_start));
    }

    #[test]
    fn deleting_batch_appends_one_deletion_entry_per_logged_definition() {
        let f = fixture();
        let batch = create(&f, 20, 10, 1);
        execute_seed_job(&f, &batch);

        f.clock.advance(Duration::seconds(5));
        let deletion_time = f.clock.now();
        f.engine.delete_batch(batch.id, false).unwrap();

        let deletions = |id| {
            f.engine
                .query_historic_job_log(&HistoricJobLogQuery::for_job_definition(id).kind(JobLogKind::Deletion))
                .unwrap()
        };
        let seed_deletions = deletions(batch.seed_job_definition_id);
        let work_deletions = deletions(batch.batch_job_definition_id);
        assert_eq!(seed_deletions.len(), 1);
        assert_eq!(work_deletions.len(), 1);
        assert!(deletions(batch.monitor_job_definition_id).is_empty());
        assert_eq!(seed_deletions[0].timestamp, deletion_time);
        assert_eq!(work_deletions[0].timestamp, deletion_time);

        let historic = f.engine.query_historic_batch(batch.id).unwrap();
        assert_eq!(historic.end_time, Some(deletion_time));
        assert!(f.engine.query_jobs(&JobQuery::for_batch(batch.id)).unwrap().is_empty());
        assert!(f.engine.job_definitions(batch.id).unwrap().is_empty());
        assert!(matches!(
            f.engine.get_batch(batch.id),
            Err(EngineError::Domain(DomainError::NotFound(_)))
        ));
    }

    #[test]
    fn deleting_batch_with_cascade_removes_history() {
        let f = fixture();
        let batch = create(&f, 5, 10, 1);
        execute_seed_jobs(&f, &batch);

        f.engine.delete_batch(batch.id, true).unwrap();

        assert!(f.engine.query_historic_batch(batch.id).unwrap_err().is_not_found());
        assert!(f
            .engine
            .query_historic_job_log(&HistoricJobLogQuery::for_batch(batch.id))
            .unwrap()
            .is_empty());
        assert!(f.engine.operation_log(batch.id).unwrap().is_empty());
    }

    #[test]
    fn deleting_unknown_batch_is_not_found() {
        let f = fixture();
        let err = f.engine.delete_batch(BatchId::new(), false).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn historic_batch_cannot_be_deleted_while_batch_is_live() {
        let f = fixture();
        let batch = create(&f, 2, 10, 1);

        let err = f.engine.delete_historic_batch(batch.id).unwrap_err();
        assert!(err.is_not_found());
        assert!(f.engine.query_historic_batch(batch.id).is_ok());

        f.engine.delete_batch(batch.id, false).unwrap();
        f.engine.delete_historic_batch(batch.id).unwrap();

        assert!(f.engine.query_historic_batch(batch.id).unwrap_err().is_not_found());
        assert!(f
            .engine
            .query_historic_job_log(&HistoricJobLogQuery::for_batch(batch.id))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn failing_item_costs_one_retry_and_names_the_item() {
        let f = fixture();
        let batch = create(&f, 3, 10, 3);
        execute_seed_jobs(&f, &batch);
        f.deleted.lock().unwrap().insert("instance-1".to_string());

        let work = jobs(&f, batch.batch_job_definition_id).remove(0);
        let outcome = execute(&f, &work);
        assert!(matches!(outcome, ExecutionOutcome::Failed { retries_left: 2, .. }));

        let failed = f.engine.get_job(work.id).unwrap();
        assert_eq!(failed.retries, 2);
        let message = failed.exception_message.clone().unwrap();
        assert!(message.starts_with("ENGINE-23004"));
        assert!(message.contains("instance-1"));
        assert!(failed.lock_owner.is_none());

        // The failure commit trims the shard to the items not yet applied.
        let shard = WorkItemShard::from_bytes(&failed.payload).unwrap();
        assert_eq!(shard.items, vec!["instance-1".to_string(), "instance-2".to_string()]);

        f.deleted.lock().unwrap().clear();
        assert_eq!(execute(&f, &failed), ExecutionOutcome::Succeeded);
        assert_eq!(*f.applied.lock().unwrap(), items(3));
        assert!(f.engine.get_job(work.id).unwrap_err().is_not_found());
        assert_eq!(
            log(&f, batch.batch_job_definition_id),
            vec![
                (JobLogKind::Creation, 3),
                (JobLogKind::Failure, 2),
                (JobLogKind::Success, 2),
            ]
        );
    }

    #[test]
    fn exhausted_job_is_never_acquired_again() {
        let f = fixture();
        let batch = create(&f, 1, 10, 1);
        execute_seed_jobs(&f, &batch);
        f.deleted.lock().unwrap().insert("instance-0".to_string());

        let work = jobs(&f, batch.batch_job_definition_id).remove(0);
        for expected in [2, 1, 0] {
            let outcome = execute(&f, &f.engine.get_job(work.id).unwrap());
            assert!(matches!(outcome, ExecutionOutcome::Failed { retries_left, .. } if retries_left == expected));
        }

        let failed = f.engine.get_job(work.id).unwrap();
        assert!(failed.is_failed());
        let store = f.engine.store();
        let acquired = acquire_jobs(store, f.clock.now(), "test", StdDuration::from_secs(60), 10).unwrap();
        assert!(acquired.iter().all(|j| j.id != work.id));

        let failed_jobs = f
            .engine
            .query_jobs(&JobQuery::for_job_definition(batch.batch_job_definition_id).no_retries_left())
            .unwrap();
        assert_eq!(failed_jobs.len(), 1);

        // Operator override makes it acquirable again.
        f.engine.set_job_retries(work.id, 1).unwrap();
        let acquired = acquire_jobs(store, f.clock.now(), "test", StdDuration::from_secs(60), 10).unwrap();
        assert!(acquired.iter().any(|j| j.id == work.id));
    }

    #[test]
    fn failure_of_unknown_operation_is_retried() {
        let f = fixture();
        let batch = create(&f, 1, 10, 1);
        execute_seed_jobs(&f, &batch);

        let mut batch_row = f.engine.get_batch(batch.id).unwrap();
        batch_row.batch_type = "unregistered".to_string();
        f.engine
            .store()
            .commit(crate::store::ChangeSet::from(vec![crate::store::Change::UpdateBatch {
                batch: batch_row,
                expected: forgebatch_core::ExpectedVersion::Any,
            }]))
            .unwrap();

        let work = jobs(&f, batch.batch_job_definition_id).remove(0);
        let ExecutionOutcome::Failed { retries_left, message } = execute(&f, &work) else {
            panic!("expected failure");
        };
        assert_eq!(retries_left, 2);
        assert_eq!(message, "no bulk operation registered for batch type 'unregistered'");
    }

    #[test]
    fn locked_job_cannot_be_executed_twice() {
        let f = fixture();
        let batch = create(&f, 1, 10, 1);
        let seed = seed_job(&f, &batch).unwrap();
        let now = f.clock.now();
        f.engine
            .store()
            .try_lock_job(seed.id, seed.revision, "someone-else", now, now + Duration::minutes(5))
            .unwrap()
            .unwrap();

        let err = f.engine.execute_job(seed.id).unwrap_err();
        assert!(matches!(err, EngineError::JobLocked(id) if id == seed.id));
    }

    #[test]
    fn concurrent_acquirers_claim_each_job_once() {
        let f = fixture();
        let batch = create(&f, 16, 16, 1);
        execute_seed_jobs(&f, &batch);
        let now = f.clock.now();

        let claimed: Vec<Job> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let store = f.engine.store().clone();
                    s.spawn(move || {
                        acquire_jobs(&store, now, &format!("worker-{i}"), StdDuration::from_secs(60), 16).unwrap()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let ids: HashSet<_> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), claimed.len());
        assert_eq!(claimed.len(), 16);
    }

    #[test]
    fn batch_statistics_track_progress() {
        let f = fixture();
        let batch = create(&f, 4, 10, 1);
        execute_seed_jobs(&f, &batch);
        f.deleted.lock().unwrap().insert("instance-3".to_string());

        execute(&f, &job_for_item(&f, &batch, "instance-0"));
        execute(&f, &job_for_item(&f, &batch, "instance-1"));
        let doomed = job_for_item(&f, &batch, "instance-3");
        f.engine.set_job_retries(doomed.id, 1).unwrap();
        execute(&f, &f.engine.get_job(doomed.id).unwrap());

        let stats = f.engine.batch_statistics(&BatchQuery::default().id(batch.id)).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total_jobs, 4);
        assert_eq!(stats[0].jobs_created, 4);
        assert_eq!(stats[0].completed_jobs, 2);
        assert_eq!(stats[0].remaining_jobs, 2);
        assert_eq!(stats[0].failed_jobs, 1);
    }

    #[test]
    fn suspended_batch_jobs_are_not_acquired() {
        let f = fixture();
        let batch = create(&f, 20, 10, 1);
        execute_seed_job(&f, &batch);

        f.engine.suspend_batch(batch.id).unwrap();
        assert!(f.engine.get_batch(batch.id).unwrap().suspended);
        assert!(f.engine.job_definitions(batch.id).unwrap().iter().all(|d| d.suspended));
        assert!(f
            .engine
            .query_jobs(&JobQuery::for_batch(batch.id))
            .unwrap()
            .iter()
            .all(|j| j.suspended));
        let store = f.engine.store();
        assert!(acquire_jobs(store, f.clock.now(), "t", StdDuration::from_secs(60), 100)
            .unwrap()
            .is_empty());

        // Jobs created while suspended are suspended too.
        execute_seed_job(&f, &batch);
        assert!(jobs(&f, batch.batch_job_definition_id).iter().all(|j| j.suspended));

        f.engine.activate_batch(batch.id).unwrap();
        assert!(!f.engine.get_batch(batch.id).unwrap().suspended);
        assert_eq!(
            acquire_jobs(store, f.clock.now(), "t", StdDuration::from_secs(60), 100)
                .unwrap()
                .len(),
            20
        );
        let active = f.engine.list_batches(&BatchQuery::default().suspended(false)).unwrap();
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn invalid_batches_are_rejected_without_rows() {
        let f = fixture();

        let err = f.engine.create_batch(NewBatch::new(BATCH_TYPE, Vec::new())).unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::Validation(ref m)) if m == "item ids is empty"));

        let err = f
            .engine
            .create_batch(NewBatch::new(BATCH_TYPE, vec!["a".to_string(), " ".to_string()]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::Validation(ref m)) if m == "item ids contains empty value"));

        let err = f.engine.create_batch(NewBatch::new("unknown", items(2))).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Domain(DomainError::Validation(ref m))
                if m == "no bulk operation registered for batch type 'unknown'"
        ));

        let err = f
            .engine
            .create_batch(NewBatch::new(BATCH_TYPE, items(2)).with_invocations_per_batch_job(0))
            .unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::Validation(_))));

        assert!(f.engine.list_batches(&BatchQuery::default()).unwrap().is_empty());
        assert!(f
            .engine
            .list_historic_batches(&HistoricBatchQuery::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn engine_defaults_apply_when_partitioning_is_not_given() {
        let f = fixture_with(EngineConfig::default().with_batch_jobs_per_seed(7).with_invocations_per_batch_job(2));
        let batch = f.engine.create_batch(NewBatch::new(BATCH_TYPE, items(5))).unwrap();
        assert_eq!(batch.batch_jobs_per_seed, 7);
        assert_eq!(batch.invocations_per_batch_job, 2);
        assert_eq!(batch.total_jobs(), 3);
    }

    #[test]
    fn create_batch_writes_operation_log_and_variables() {
        let f = fixture();
        let variables = Variables::from([
            ("foo".to_string(), TypedValue::from("bar")),
            ("answer".to_string(), TypedValue::from(42i64)),
        ]);
        let batch = f
            .engine
            .create_batch(NewBatch::new(BATCH_TYPE, items(10)).with_variables(variables.clone()))
            .unwrap();

        assert_eq!(f.engine.batch_variables(batch.id).unwrap(), variables);

        let entries = f.engine.operation_log(batch.id).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.operation, "CreateBatch");
        assert_eq!(entry.timestamp, f.clock.now());
        assert_eq!(entry.properties["type"], BATCH_TYPE);
        assert_eq!(entry.properties["nr_of_instances"], "10");
        assert_eq!(entry.properties["async"], "true");
        assert_eq!(entry.properties["nr_of_variables"], "2");

        let without = create(&f, 1, 10, 1);
        let entries = f.engine.operation_log(without.id).unwrap();
        assert!(!entries[0].properties.contains_key("nr_of_variables"));
    }

    #[test]
    fn work_items_see_batch_variables() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let clock = Arc::new(FrozenClock::now_truncated());
        let engine = BatchEngine::builder(InMemoryBatchStore::arc())
            .clock(clock)
            .operation(OperationFn::new("tagging", move |item: &ItemContext<'_>| {
                let tag = item.variables.get("tag").and_then(TypedValue::as_str).unwrap_or("none");
                captured.lock().unwrap().push(format!("{}:{tag}", item.item_id));
                Ok(())
            }))
            .build();

        let batch = engine
            .create_batch(
                NewBatch::new("tagging", vec!["x".to_string()])
                    .with_variables(Variables::from([("tag".to_string(), TypedValue::from("blue"))])),
            )
            .unwrap();
        let seed = engine
            .query_jobs(&JobQuery::for_job_definition(batch.seed_job_definition_id))
            .unwrap()
            .remove(0);
        engine.execute_job(seed.id).unwrap();
        let work = engine
            .query_jobs(&JobQuery::for_job_definition(batch.batch_job_definition_id))
            .unwrap()
            .remove(0);
        engine.execute_job(work.id).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["x:blue".to_string()]);
    }

    #[test]
    fn historic_batches_filter_by_completion() {
        let f = fixture();
        let done = create(&f, 1, 10, 1);
        let running = create(&f, 1, 10, 1);
        f.engine.delete_batch(done.id, false).unwrap();

        let completed = f
            .engine
            .list_historic_batches(&HistoricBatchQuery::default().completed(true))
            .unwrap();
        assert_eq!(completed.iter().map(|h| h.id).collect::<Vec<_>>(), vec![done.id]);

        let open = f
            .engine
            .list_historic_batches(&HistoricBatchQuery::default().completed(false))
            .unwrap();
        assert_eq!(open.iter().map(|h| h.id).collect::<Vec<_>>(), vec![running.id]);
    }

    #[test]
    fn job_finishing_after_batch_deletion_is_orphaned() {
        let f = fixture();
        let batch = create(&f, 2, 10, 1);
        execute_seed_jobs(&f, &batch);

        let work = jobs(&f, batch.batch_job_definition_id).remove(0);
        let now = f.clock.now();
        let locked = f
            .engine
            .store()
            .try_lock_job(work.id, work.revision, &f.engine.config().lock_owner, now, now + Duration::minutes(5))
            .unwrap()
            .unwrap();
        f.engine.delete_batch(batch.id, false).unwrap();

        let outcome = run_job(f.engine.runtime(), locked);
        assert_eq!(outcome, ExecutionOutcome::Orphaned);
        assert!(f.engine.query_jobs(&JobQuery::for_batch(batch.id)).unwrap().is_empty());
    }

    #[test]
    fn executor_drives_batch_to_completion() {
        forgebatch_observability::init_for_tests();
        let applied = Arc::new(Mutex::new(Vec::<String>::new()));
        let op_applied = applied.clone();
        let config = EngineConfig::default()
            .with_batch_poll_interval(StdDuration::from_millis(20))
            .with_acquisition_idle_wait(StdDuration::from_millis(10))
            .with_max_jobs_per_acquisition(4)
            .with_worker_pool(
                WorkerPoolConfig::default()
                    .with_core_threads(2)
                    .with_queue_capacity(4)
                    .with_long_running_wait(StdDuration::from_millis(200)),
            );
        let engine = BatchEngine::builder(InMemoryBatchStore::arc())
            .config(config)
            .operation(OperationFn::new(BATCH_TYPE, move |item: &ItemContext<'_>| {
                op_applied.lock().unwrap().push(item.item_id.to_string());
                Ok(())
            }))
            .build();

        let batch = engine
            .create_batch(
                NewBatch::new(BATCH_TYPE, items(25))
                    .with_batch_jobs_per_seed(4)
                    .with_invocations_per_batch_job(2),
            )
            .unwrap();

        let handle = JobExecutor::spawn(&engine).unwrap();
        let deadline = std::time::Instant::now() + StdDuration::from_secs(10);
        while engine.get_batch(batch.id).is_ok() && std::time::Instant::now() < deadline {
            std::thread::sleep(StdDuration::from_millis(10));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert!(engine.get_batch(batch.id).unwrap_err().is_not_found());
        let historic = engine.query_historic_batch(batch.id).unwrap();
        assert!(historic.end_time.is_some());

        let mut applied = applied.lock().unwrap().clone();
        applied.sort();
        applied.dedup();
        assert_eq!(applied.len(), 25);
        assert!(stats.jobs_succeeded >= 13);
    }

    #[test]
    fn retry_override_keeps_a_running_executors_lock() {
        let f = fixture();
        let batch = create(&f, 1, 10, 1);
        let seed = seed_job(&f, &batch).unwrap();
        let now = f.clock.now();
        let store = f.engine.store();

        let claimed = acquire_jobs(store, now, "executor-a", StdDuration::from_secs(300), 10).unwrap();
        assert_eq!(claimed.len(), 1);

        f.engine.set_job_retries(seed.id, 5).unwrap();

        let overridden = f.engine.get_job(seed.id).unwrap();
        assert_eq!(overridden.retries, 5);
        assert_eq!(overridden.lock_owner.as_deref(), Some("executor-a"));
        assert_eq!(overridden.lock_expiration_time, claimed[0].lock_expiration_time);
        assert!(acquire_jobs(store, now, "executor-b", StdDuration::from_secs(300), 10)
            .unwrap()
            .is_empty());

        // The claim taken before the override still commits its outcome.
        let outcome = run_job(f.engine.runtime(), f.engine.get_job(seed.id).unwrap());
        assert_eq!(outcome, ExecutionOutcome::Succeeded);
    }

    #[test]
    fn retry_override_of_unknown_job_is_not_found() {
        let f = fixture();
        let err = f.engine.set_job_retries(JobId::new(), 1).unwrap_err();
        assert!(err.is_not_found());
    }

    /// Store that runs a hook on the first historic batch lookup, letting a
    /// test slip a concurrent commit between a reader and its write.
    struct HookedStore {
        inner: Arc<InMemoryBatchStore>,
        hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl BatchStore for HookedStore {
        fn find_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
            self.inner.find_batch(id)
        }

        fn list_batches(&self, query: &BatchQuery) -> Result<Vec<Batch>, StoreError> {
            self.inner.list_batches(query)
        }

        fn find_job_definition(
            &self,
            id: JobDefinitionId,
        ) -> Result<Option<JobDefinition>, StoreError> {
            self.inner.find_job_definition(id)
        }

        fn job_definitions_for_batch(
            &self,
            batch_id: BatchId,
        ) -> Result<Vec<JobDefinition>, StoreError> {
            self.inner.job_definitions_for_batch(batch_id)
        }

        fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
            self.inner.find_job(id)
        }

        fn list_jobs(
            &self,
            query: &JobQuery,
            now: DateTime<Utc>,
        ) -> Result<Vec<Job>, StoreError> {
            self.inner.list_jobs(query, now)
        }

        fn count_jobs(&self, job_definition_id: JobDefinitionId) -> Result<u64, StoreError> {
            self.inner.count_jobs(job_definition_id)
        }

        fn acquirable_jobs(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<Job>, StoreError> {
            self.inner.acquirable_jobs(now, limit)
        }

        fn try_lock_job(
            &self,
            id: JobId,
            expected_revision: u64,
            owner: &str,
            now: DateTime<Utc>,
            lock_until: DateTime<Utc>,
        ) -> Result<Option<Job>, StoreError> {
            self.inner.try_lock_job(id, expected_revision, owner, now, lock_until)
        }

        fn batch_variables(&self, batch_id: BatchId) -> Result<Variables, StoreError> {
            self.inner.batch_variables(batch_id)
        }

        fn find_historic_batch(
            &self,
            id: BatchId,
        ) -> Result<Option<HistoricBatch>, StoreError> {
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.find_historic_batch(id)
        }

        fn list_historic_batches(
            &self,
            query: &HistoricBatchQuery,
        ) -> Result<Vec<HistoricBatch>, StoreError> {
            self.inner.list_historic_batches(query)
        }

        fn historic_job_log(
            &self,
            query: &HistoricJobLogQuery,
        ) -> Result<Vec<HistoricJobLogEntry>, StoreError> {
            self.inner.historic_job_log(query)
        }

        fn operation_log(
            &self,
            batch_id: BatchId,
        ) -> Result<Vec<OperationLogEntry>, StoreError> {
            self.inner.operation_log(batch_id)
        }

        fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
            self.inner.commit(changes)
        }
    }

    #[test]
    fn delete_racing_monitor_finalization_is_not_found() {
        let f = fixture();
        let batch = create(&f, 2, 10, 1);
        execute_seed_jobs(&f, &batch);
        execute_work_item_jobs(&f, &batch);
        let monitor = monitor_job(&f, &batch).unwrap();

        // The monitor finalizes after delete_batch has read the live batch.
        let finalizer = f.engine.clone();
        let hooked = BatchEngine::builder(HookedStore {
            inner: f.engine.store().clone(),
            hook: Mutex::new(Some(Box::new(move || {
                assert_eq!(finalizer.execute_job(monitor.id).unwrap(), ExecutionOutcome::Succeeded);
            }))),
        })
        .clock(f.clock.clone())
        .operation(OperationFn::new(BATCH_TYPE, |_: &ItemContext<'_>| Ok(())))
        .build();

        let err = hooked.delete_batch(batch.id, false).unwrap_err();
        assert!(err.is_not_found());

        let deletions = f
            .engine
            .query_historic_job_log(&HistoricJobLogQuery::for_batch(batch.id).kind(JobLogKind::Deletion))
            .unwrap();
        assert!(deletions.is_empty());
        let historic = f.engine.query_historic_batch(batch.id).unwrap();
        assert_eq!(historic.end_time, Some(f.clock.now()));
        assert!(f.engine.list_batches(&BatchQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn delete_retries_after_concurrent_seed_progress() {
        let f = fixture();
        let batch = create(&f, 20, 10, 1);
        let seed = seed_job(&f, &batch).unwrap();

        // A seed invocation bumps the batch revision between read and commit.
        let seeder = f.engine.clone();
        let hooked = BatchEngine::builder(HookedStore {
            inner: f.engine.store().clone(),
            hook: Mutex::new(Some(Box::new(move || {
                assert_eq!(seeder.execute_job(seed.id).unwrap(), ExecutionOutcome::Succeeded);
            }))),
        })
        .clock(f.clock.clone())
        .build();

        hooked.delete_batch(batch.id, false).unwrap();

        assert!(f.engine.get_batch(batch.id).unwrap_err().is_not_found());
        assert!(f.engine.query_jobs(&JobQuery::for_batch(batch.id)).unwrap().is_empty());
        let deletions = f
            .engine
            .query_historic_job_log(&HistoricJobLogQuery::for_batch(batch.id).kind(JobLogKind::Deletion))
            .unwrap();
        assert_eq!(deletions.len(), 2);
    }

    #[test]
    fn deleting_a_job_logs_deletion_and_drops_the_payload() {
        let f = fixture();
        let batch = create(&f, 2, 10, 1);
        execute_seed_jobs(&f, &batch);
        let doomed = job_for_item(&f, &batch, "instance-0");

        f.clock.advance(Duration::seconds(2));
        f.engine.delete_job(doomed.id).unwrap();

        assert!(f.engine.get_job(doomed.id).unwrap_err().is_not_found());
        let entries = f
            .engine
            .query_historic_job_log(&HistoricJobLogQuery::for_batch(batch.id).job_id(doomed.id))
            .unwrap();
        let kinds: Vec<JobLogKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![JobLogKind::Creation, JobLogKind::Deletion]);
        assert_eq!(entries[1].timestamp, f.clock.now());
        assert_eq!(entries[1].retries, 3);

        // The remaining job finishes and the monitor completes the batch.
        execute_work_item_jobs(&f, &batch);
        assert_eq!(*f.applied.lock().unwrap(), vec!["instance-1".to_string()]);
        assert_eq!(execute_monitor_job(&f, &batch), ExecutionOutcome::Succeeded);
        assert!(f.engine.get_batch(batch.id).unwrap_err().is_not_found());

        assert!(f.engine.delete_job(doomed.id).unwrap_err().is_not_found());
    }

    #[test]
    fn locked_job_cannot_be_deleted() {
        let f = fixture();
        let batch = create(&f, 1, 10, 1);
        let seed = seed_job(&f, &batch).unwrap();
        let now = f.clock.now();
        f.engine
            .store()
            .try_lock_job(seed.id, seed.revision, "executor-a", now, now + Duration::minutes(5))
            .unwrap()
            .unwrap();

        let err = f.engine.delete_job(seed.id).unwrap_err();
        assert!(matches!(err, EngineError::Domain(DomainError::Conflict(_))));
        assert!(f.engine.get_job(seed.id).is_ok());

        // Deletable once the lock has expired.
        f.clock.advance(Duration::minutes(5));
        f.engine.delete_job(seed.id).unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn seeding_creates_one_job_per_shard(size in 1usize..60, per_seed in 1u32..8, invocations in 1u32..7) {
            let f = fixture();
            let batch = create(&f, size, per_seed, invocations);

            let mut seed_runs = 0;
            while let Some(seed) = seed_job(&f, &batch) {
                seed_runs += 1;
                prop_assert!(seed_runs <= size);
                let before = jobs(&f, batch.batch_job_definition_id).len();
                let remaining_before = f.engine.get_batch(batch.id).unwrap().configuration().unwrap().remaining();
                prop_assert_eq!(execute(&f, &seed), ExecutionOutcome::Succeeded);
                let created = jobs(&f, batch.batch_job_definition_id).len() - before;
                let remaining_shards = remaining_before.div_ceil(invocations as usize);
                prop_assert_eq!(created, remaining_shards.min(per_seed as usize));
            }

            let expected = size.div_ceil(invocations as usize);
            prop_assert_eq!(jobs(&f, batch.batch_job_definition_id).len(), expected);
            prop_assert!(monitor_job(&f, &batch).is_some());
        }
    }
}
