//! End-to-end tests for the orchestration pipeline.
//!
//! Tests: submit → /job → /iterate → /namespace → /shard → /namespace/complete
//! → /job/complete, driven through the embedded task runner.
//!
//! Verifies:
//! - Every namespace and shard is counted exactly once, whatever the delivery
//!   order and however often a task is redelivered
//! - Completion is scheduled exactly once
//! - Aborted jobs stop scheduling work
//! - Failures and abandonment count as failed shards and namespaces

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use proptest::prelude::*;

use shardmap_core::{
    JobId, JobState, NamespaceId, NamespaceState, Query, RequestId, ShardId, ShardOutcome,
    ShardReport, ShardState, WorkDescriptor,
};

use crate::config::MapperConfig;
use crate::contracts::{
    NamespacePage, NamespaceSource, ProcessError, ProcessorRegistry, ShardContext, SourceError,
    StaticNamespaceSource,
};
use crate::orchestrator::{HandlerOutcome, JobSubmission, Orchestrator, Route};
use crate::queue::{InMemoryTaskQueue, Task};
use crate::runner::{DeliveryReport, DeliveryStatus, RetryPolicy, TaskRunner};
use crate::store::{InMemoryEntityStore, StoreError};

const JOB: &str = "job-1";

struct Harness {
    store: Arc<InMemoryEntityStore>,
    queue: Arc<InMemoryTaskQueue>,
    orchestrator: Orchestrator,
    runner: TaskRunner,
    calls: Arc<Mutex<Vec<String>>>,
}

fn config() -> MapperConfig {
    MapperConfig::default()
        .with_retry(RetryPolicy::fixed(10, Duration::ZERO))
        .with_iterator_page_size(100)
}

fn counting(calls: Arc<Mutex<Vec<String>>>) -> ProcessorRegistry {
    ProcessorRegistry::new().with("count", move |ctx: &ShardContext<'_>| -> Result<ShardReport, ProcessError> {
        calls.lock().unwrap().push(ctx.shard.id.to_string());
        Ok(ShardReport::counted(10).with_counter("rows", 10))
    })
}

fn harness_with(namespaces: &[&str], config: MapperConfig, processors: Option<ProcessorRegistry>) -> Harness {
    harness_over(StaticNamespaceSource::new(namespaces.iter().copied()), config, processors)
}

fn harness_over(
    source: impl NamespaceSource + 'static,
    config: MapperConfig,
    processors: Option<ProcessorRegistry>,
) -> Harness {
    let store = Arc::new(InMemoryEntityStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let retry = config.retry.clone();
    let orchestrator = Orchestrator::builder(config, store.clone(), queue.clone())
        .source(source)
        .processors(processors.unwrap_or_else(|| counting(calls.clone())))
        .build();
    let runner = TaskRunner::new(queue.clone(), orchestrator.datastore().clone(), retry).with_routes(&orchestrator);
    Harness {
        store,
        queue,
        orchestrator,
        runner,
        calls,
    }
}

fn harness(namespaces: &[&str]) -> Harness {
    harness_with(namespaces, config(), None)
}

fn submission(shards: u32) -> JobSubmission {
    JobSubmission::new(Query::new("Photo"), WorkDescriptor::new("count", Vec::new()))
        .with_id(JOB)
        .with_shards(shards)
}

impl Harness {
    fn path(&self, route: Route) -> String {
        self.orchestrator.config().path(route.relative_path())
    }

    fn job(&self) -> JobState {
        self.orchestrator.jobs().status(&JobId::new(JOB).unwrap()).unwrap()
    }

    fn namespace(&self, name: &str) -> NamespaceState {
        let id = NamespaceId::new(JobId::new(JOB).unwrap(), name);
        self.orchestrator
            .datastore()
            .get::<NamespaceState>(&id.to_string())
            .unwrap()
            .unwrap()
    }

    fn shard(&self, namespace: &str, index: u32) -> ShardState {
        let id = ShardId::new(NamespaceId::new(JobId::new(JOB).unwrap(), namespace), index);
        self.orchestrator
            .datastore()
            .get::<ShardState>(&id.to_string())
            .unwrap()
            .unwrap()
    }

    fn run(&self) -> Vec<DeliveryReport> {
        self.runner.run_until_idle(10_000)
    }

    /// Deliver tasks until none on the queue is accepted by `pred`.
    fn run_only(&self, pred: impl Fn(&Task) -> bool) -> Vec<DeliveryReport> {
        let mut reports = Vec::new();
        while let Some(report) = self.runner.run_matching(&pred) {
            reports.push(report);
        }
        reports
    }

    fn check_invariants(&self, namespaces: &[&str]) {
        let job = self.job();
        job.check_invariants().unwrap();
        for name in namespaces {
            let id = NamespaceId::new(job.id.clone(), *name);
            if let Some(ns) = self
                .orchestrator
                .datastore()
                .get::<NamespaceState>(&id.to_string())
                .unwrap()
            {
                ns.check_invariants().unwrap();
            }
        }
    }
}

fn handled(reports: &[DeliveryReport], outcome: HandlerOutcome) -> usize {
    reports
        .iter()
        .filter(|r| r.status == DeliveryStatus::Handled(outcome))
        .count()
}

#[test]
fn job_runs_to_completion_with_every_shard_counted_once() {
    let h = harness(&["alpha", "beta"]);
    h.orchestrator.jobs().submit(submission(3)).unwrap();

    h.run();

    let job = h.job();
    assert!(job.is_completed());
    assert!(!job.iterating);
    assert_eq!(job.namespaces_total, 2);
    assert_eq!(job.namespaces_successful, 2);
    assert_eq!(job.namespaces_failed, 0);
    assert_eq!(job.timing.count, 60);
    assert_eq!(job.timing.counters.get("rows"), Some(&60));

    for name in ["alpha", "beta"] {
        let ns = h.namespace(name);
        assert_eq!(ns.shards_total, Some(3));
        assert_eq!(ns.shards_successful, 3);
        assert!(ns.timing.is_completed());
        assert!(!ns.lock.is_held());
        assert_eq!(ns.timing.count, 30);
    }
    assert!(h.shard("alpha", 2).outcome.as_ref().is_some_and(ShardOutcome::is_success));

    assert_eq!(h.calls.lock().unwrap().len(), 6);
    assert_eq!(h.queue.added_for(&h.path(Route::Shard)), 6);
    assert_eq!(h.queue.added_for(&h.path(Route::NamespaceComplete)), 2);
    assert_eq!(h.queue.added_for(&h.path(Route::JobComplete)), 1);
    assert!(h.queue.is_empty());
}

#[test]
fn every_task_delivered_twice_changes_nothing() {
    let namespaces = ["alpha", "beta", "gamma"];
    let h = harness_with(&namespaces, config().with_iterator_page_size(2), None);
    h.orchestrator.jobs().submit(submission(2)).unwrap();

    while let Some(task) = h.queue.take_next() {
        let first = h.runner.deliver(task.clone());
        assert!(matches!(first.status, DeliveryStatus::Handled(_)), "{first:?}");
        h.check_invariants(&namespaces);

        let second = h.runner.deliver(task);
        assert_eq!(second.status, DeliveryStatus::Acknowledged(200), "{second:?}");
        h.check_invariants(&namespaces);
    }

    let job = h.job();
    assert!(job.is_completed());
    assert_eq!(job.namespaces_successful, 3);
    assert_eq!(job.timing.count, 60);
    assert_eq!(h.calls.lock().unwrap().len(), 6);
    assert_eq!(h.queue.added_for(&h.path(Route::JobComplete)), 1);
}

#[test]
fn redelivering_the_whole_history_after_completion_is_acknowledged() {
    let h = harness(&["alpha", "beta"]);
    h.orchestrator.jobs().submit(submission(2)).unwrap();
    h.run();
    let before = h.job();

    for task in h.queue.history() {
        let report = h.runner.deliver(task);
        assert_eq!(report.status, DeliveryStatus::Acknowledged(200), "{report:?}");
    }

    assert_eq!(h.job(), before);
    assert_eq!(h.calls.lock().unwrap().len(), 4);
}

#[test]
fn shards_finishing_before_the_split_commits_complete_the_namespace_once() {
    let h = harness(&["alpha"]);
    h.orchestrator.jobs().submit(submission(5)).unwrap();

    // Three shards report while the split's final transaction is in flight.
    let orchestrator = h.orchestrator.clone();
    h.store.on_commit(
        |batch| {
            batch
                .writes
                .iter()
                .any(|(key, body)| key.kind == "namespace" && !body["shards_total"].is_null())
        },
        move || {
            let namespace = NamespaceId::new(JobId::new(JOB).unwrap(), "alpha");
            for index in [0, 2, 4] {
                orchestrator
                    .shards()
                    .record_outcome(
                        &ShardId::new(namespace.clone(), index),
                        ShardOutcome::Succeeded,
                        &ShardReport::counted(10),
                    )
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
            Ok(())
        },
    );

    let reports = h.run();

    let ns = h.namespace("alpha");
    assert_eq!(ns.shards_total, Some(5));
    assert_eq!(ns.shards_successful, 5);
    assert_eq!(handled(&reports, HandlerOutcome::Skipped), 3);
    assert_eq!(h.calls.lock().unwrap().len(), 2);
    assert_eq!(h.queue.added_for(&h.path(Route::NamespaceComplete)), 1);

    let job = h.job();
    assert!(job.is_completed());
    assert_eq!(job.timing.count, 50);
}

#[test]
fn all_shards_reported_before_the_total_lands_is_completed_by_the_split() {
    let h = harness(&["alpha"]);
    h.orchestrator.jobs().submit(submission(2)).unwrap();

    let orchestrator = h.orchestrator.clone();
    h.store.on_commit(
        |batch| {
            batch
                .writes
                .iter()
                .any(|(key, body)| key.kind == "namespace" && !body["shards_total"].is_null())
        },
        move || {
            let namespace = NamespaceId::new(JobId::new(JOB).unwrap(), "alpha");
            for index in 0..2 {
                let done = orchestrator
                    .shards()
                    .record_outcome(
                        &ShardId::new(namespace.clone(), index),
                        ShardOutcome::Succeeded,
                        &ShardReport::default(),
                    )
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                assert!(!done, "total unknown, shards cannot complete the namespace");
            }
            Ok(())
        },
    );

    h.run();

    assert!(h.calls.lock().unwrap().is_empty());
    assert_eq!(h.queue.added_for(&h.path(Route::NamespaceComplete)), 1);
    assert!(h.job().is_completed());
}

#[test]
fn namespace_completing_before_iteration_ends_waits_for_the_iterator() {
    let h = harness_with(&["alpha", "beta"], config().with_iterator_page_size(1), None);
    h.orchestrator.jobs().submit(submission(2)).unwrap();
    let iterate = h.path(Route::Iterate);

    // /job, then the first page
    h.runner.run_once().unwrap();
    let first_page = h.runner.run_matching(|t| t.path == iterate).unwrap();
    assert_eq!(first_page.status, DeliveryStatus::Handled(HandlerOutcome::Done));

    h.run_only(|t| t.path != iterate);
    let job = h.job();
    assert!(job.iterating);
    assert_eq!(job.namespaces_total, 1);
    assert_eq!(job.namespaces_successful, 1);
    assert!(!job.is_completed());
    assert_eq!(h.queue.added_for(&h.path(Route::JobComplete)), 0);

    h.run();
    let job = h.job();
    assert!(job.is_completed());
    assert_eq!(job.namespaces_successful, 2);
    assert_eq!(h.queue.added_for(&h.path(Route::JobComplete)), 1);
}

#[test]
fn iteration_ending_before_namespaces_finish_leaves_completion_to_the_last_rollup() {
    let h = harness_with(&["alpha", "beta", "gamma"], config().with_iterator_page_size(2), None);
    h.orchestrator.jobs().submit(submission(1)).unwrap();
    let job_path = h.path(Route::Job);
    let iterate = h.path(Route::Iterate);

    h.run_only(|t| t.path == job_path || t.path == iterate);
    let job = h.job();
    assert!(!job.iterating);
    assert_eq!(job.namespaces_total, 3);
    assert!(!job.is_completed());

    h.run();
    let job = h.job();
    assert!(job.is_completed());
    assert_eq!(job.namespaces_successful, 3);
    assert_eq!(h.queue.added_for(&h.path(Route::JobComplete)), 1);
}

#[test]
fn job_over_an_empty_source_completes_immediately() {
    let h = harness(&[]);
    h.orchestrator.jobs().submit(submission(2)).unwrap();

    h.run();

    let job = h.job();
    assert!(job.is_completed());
    assert_eq!(job.namespaces_total, 0);
    assert_eq!(h.store.count_kind("namespace"), 0);
    assert_eq!(h.queue.added_for(&h.path(Route::JobComplete)), 1);
}

#[test]
fn aborted_job_stops_scheduling_work() {
    let h = harness(&["alpha", "beta"]);
    h.orchestrator.jobs().submit(submission(2)).unwrap();
    let iterate = h.path(Route::Iterate);

    h.runner.run_once().unwrap();
    h.runner.run_matching(|t| t.path == iterate).unwrap();
    h.orchestrator.jobs().abort(&JobId::new(JOB).unwrap()).unwrap();

    let reports = h.run();

    assert_eq!(handled(&reports, HandlerOutcome::Aborted), 2);
    assert_eq!(h.queue.added_for(&h.path(Route::Shard)), 0);
    assert_eq!(h.namespace("alpha").shards_total, None);
    assert_eq!(h.namespace("beta").shards_accounted(), 0);
    assert!(h.calls.lock().unwrap().is_empty());
    let job = h.job();
    assert!(job.abort);
    assert!(!job.is_completed());
    assert_eq!(job.namespaces_accounted(), 0);
    assert!(!h.namespace("alpha").lock.is_held());
}

#[test]
fn submitting_the_same_job_twice_is_rejected() {
    let h = harness(&["alpha"]);
    h.orchestrator.jobs().submit(submission(1)).unwrap();
    let err = h.orchestrator.jobs().submit(submission(1)).unwrap_err();
    assert_eq!(err.status_code(), 409);
    assert_eq!(h.queue.added_for(&h.path(Route::Job)), 1);
}

#[test]
fn permanent_shard_failure_counts_the_namespace_as_failed() {
    let processors = ProcessorRegistry::new().with("count", |ctx: &ShardContext<'_>| -> Result<ShardReport, ProcessError> {
        if ctx.namespace() == "beta" && ctx.spec().index == 0 {
            return Err(ProcessError::Permanent("corrupt input".into()));
        }
        Ok(ShardReport::counted(1))
    });
    let h = harness_with(&["alpha", "beta"], config(), Some(processors));
    h.orchestrator.jobs().submit(submission(2)).unwrap();

    h.run();

    let beta = h.namespace("beta");
    assert_eq!(beta.shards_failed, 1);
    assert_eq!(beta.shards_successful, 1);
    assert!(matches!(
        h.shard("beta", 0).outcome,
        Some(ShardOutcome::Failed { ref reason }) if reason == "corrupt input"
    ));

    let job = h.job();
    assert!(job.is_completed());
    assert_eq!(job.namespaces_successful, 1);
    assert_eq!(job.namespaces_failed, 1);
    assert_eq!(job.timing.count, 3);
}

#[test]
fn retryable_shard_failures_are_abandoned_after_the_attempt_limit() {
    let attempts = Arc::new(Mutex::new(0));
    let counter = attempts.clone();
    let processors = ProcessorRegistry::new().with("count", move |_: &ShardContext<'_>| -> Result<ShardReport, ProcessError> {
        *counter.lock().unwrap() += 1;
        Err(ProcessError::Retryable("backend flapping".into()))
    });
    let h = harness_with(&["alpha"], config().with_max_lock_retries(2), Some(processors));
    h.orchestrator.jobs().submit(submission(1)).unwrap();

    let reports = h.run();

    assert_eq!(*attempts.lock().unwrap(), 2);
    assert_eq!(handled(&reports, HandlerOutcome::Abandoned), 1);
    assert!(matches!(
        h.shard("alpha", 0).outcome,
        Some(ShardOutcome::Failed { ref reason }) if reason.contains("abandoned")
    ));

    let job = h.job();
    assert!(job.is_completed());
    assert_eq!(job.namespaces_failed, 1);
}

#[test]
fn shards_without_a_processor_are_recorded_failed() {
    let h = harness_with(&["alpha"], config(), Some(ProcessorRegistry::new()));
    h.orchestrator.jobs().submit(submission(2)).unwrap();

    h.run();

    assert_eq!(h.namespace("alpha").shards_failed, 2);
    let job = h.job();
    assert!(job.is_completed());
    assert_eq!(job.namespaces_failed, 1);
}

#[test]
fn store_failure_during_split_is_retried_without_duplicating_shards() {
    let h = harness(&["alpha"]);
    h.orchestrator.jobs().submit(submission(3)).unwrap();
    h.store.on_commit(
        |batch| {
            batch
                .writes
                .iter()
                .any(|(key, body)| key.kind == "namespace" && !body["shards_total"].is_null())
        },
        || Err(StoreError::Backend("injected".into())),
    );

    let reports = h.run();

    let split = h.path(Route::Namespace);
    let split_reports: Vec<_> = reports.iter().filter(|r| r.path == split).collect();
    assert_eq!(split_reports[0].status, DeliveryStatus::Retried(500));
    assert_eq!(split_reports[1].status, DeliveryStatus::Handled(HandlerOutcome::Done));

    assert_eq!(h.queue.added_for(&h.path(Route::Shard)), 3);
    assert_eq!(h.calls.lock().unwrap().len(), 3);
    assert_eq!(h.namespace("alpha").shards_successful, 3);
    assert!(h.job().is_completed());
}

#[test]
fn lost_task_adds_are_relayed_from_the_outbox() {
    let h = harness(&["alpha"]);
    h.orchestrator.jobs().submit(submission(1)).unwrap();
    let job_task = h.queue.take_next().unwrap();

    // the iterator task cannot be handed to the queue right after commit
    h.queue.fail_next_adds(1);
    h.runner.deliver(job_task);
    assert!(h.queue.is_empty());

    h.run();
    assert!(h.job().is_completed());
}

/// Lists one namespace, then fails every later page.
struct FirstPageOnly;

impl NamespaceSource for FirstPageOnly {
    fn list(&self, _: &Query, cursor: Option<&str>, _: usize) -> Result<NamespacePage, SourceError> {
        match cursor {
            None => Ok(NamespacePage {
                namespaces: vec!["alpha".to_string()],
                next_cursor: Some("alpha".to_string()),
            }),
            Some(_) => Err(SourceError::Unavailable("listing timed out".into())),
        }
    }
}

#[test]
fn abandoned_iteration_completes_the_job_with_the_namespaces_found() {
    let h = harness_over(FirstPageOnly, config().with_max_lock_retries(2), None);
    h.orchestrator.jobs().submit(submission(2)).unwrap();

    let reports = h.run();

    assert_eq!(handled(&reports, HandlerOutcome::Abandoned), 1);
    assert!(h.queue.is_empty());
    let job = h.job();
    assert!(!job.iterating);
    assert!(job.iteration_abandoned);
    assert!(job.is_completed());
    assert_eq!(job.namespaces_total, 1);
    assert_eq!(job.namespaces_successful, 1);
    assert_eq!(h.queue.added_for(&h.path(Route::JobComplete)), 1);
    h.check_invariants(&["alpha"]);
}

#[test]
fn abandoned_job_start_closes_the_job() {
    let h = harness_with(&["alpha"], config().with_max_lock_retries(2), None);
    h.orchestrator.jobs().submit(submission(2)).unwrap();
    for _ in 0..2 {
        h.store.on_commit(
            |batch| batch.writes.iter().any(|(key, _)| key.kind == "iterator"),
            || Err(StoreError::Backend("injected".into())),
        );
    }

    let reports = h.run();

    let job_path = h.path(Route::Job);
    let statuses: Vec<_> = reports
        .iter()
        .filter(|r| r.path == job_path)
        .map(|r| r.status.clone())
        .collect();
    assert_eq!(
        statuses,
        vec![
            DeliveryStatus::Retried(500),
            DeliveryStatus::Retried(500),
            DeliveryStatus::Handled(HandlerOutcome::Abandoned),
        ]
    );
    assert_eq!(h.store.count_kind("iterator"), 0);
    let job = h.job();
    assert!(job.iteration_abandoned);
    assert!(job.is_completed());
    assert_eq!(job.namespaces_total, 0);
    assert!(h.queue.is_empty());
}

#[test]
fn crashed_lock_holder_is_taken_over_before_default_redelivery_gives_up() {
    let config = MapperConfig::default();
    config.validate().unwrap();
    let h = harness_with(&["alpha"], config.clone(), None);
    h.orchestrator.jobs().submit(submission(1)).unwrap();
    let mut task = h.queue.take_next().unwrap();

    // a worker acquired the job step and died holding it
    let mut job = h.job();
    job.lock.acquire(1, RequestId::new(), Utc::now());
    h.orchestrator.datastore().put(&job).unwrap();

    let mut waited = Duration::ZERO;
    while waited <= config.lease_timeout {
        let report = h.runner.deliver(task);
        assert_eq!(report.status, DeliveryStatus::Retried(503), "gave up after {waited:?}");
        task = h.queue.take_next().unwrap();
        waited += config.retry.delay_for_attempt(task.attempt);
    }

    // the lease has run out by the time this redelivery is due
    let mut job = h.job();
    let lease = chrono::Duration::from_std(config.lease_timeout).unwrap();
    job.lock.acquired_at = Some(Utc::now() - lease - chrono::Duration::seconds(1));
    h.orchestrator.datastore().put(&job).unwrap();

    let report = h.runner.deliver(task);
    assert_eq!(report.status, DeliveryStatus::Handled(HandlerOutcome::Done));
    h.run();
    assert!(h.job().is_completed());
}

#[test]
fn replayed_split_of_a_finished_namespace_schedules_no_second_completion() {
    let h = harness(&["alpha"]);
    h.orchestrator.jobs().submit(submission(2)).unwrap();
    h.run();
    let split = h.path(Route::Namespace);
    let task = h.queue.history().into_iter().find(|t| t.path == split).unwrap();

    // rewind the namespace lock so the split step runs again
    let mut ns = h.namespace("alpha");
    ns.lock.sequence = 0;
    h.orchestrator.datastore().put(&ns).unwrap();

    let report = h.runner.deliver(task);

    assert_eq!(report.status, DeliveryStatus::Handled(HandlerOutcome::Done));
    assert_eq!(h.namespace("alpha").shards_total, Some(2));
    assert_eq!(h.queue.added_for(&h.path(Route::NamespaceComplete)), 1);
    assert!(h.queue.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn shard_delivery_order_and_duplicates_never_change_the_rollup(
        order in Just((0usize..4).collect::<Vec<_>>()).prop_shuffle(),
        duplicates in prop::collection::vec(0usize..4, 0..8),
    ) {
        let h = harness(&["alpha"]);
        h.orchestrator.jobs().submit(submission(4)).unwrap();
        let shard_path = h.path(Route::Shard);
        h.run_only(|t| t.path != shard_path);

        let mut shard_tasks = h.queue.drain();
        shard_tasks.sort_by(|a, b| a.lock.as_ref().map(|l| l.id.clone()).cmp(&b.lock.as_ref().map(|l| l.id.clone())));
        prop_assert_eq!(shard_tasks.len(), 4);

        for index in duplicates.iter().chain(order.iter()).chain(duplicates.iter()) {
            h.runner.deliver(shard_tasks[*index].clone());
            h.check_invariants(&["alpha"]);
        }
        h.run();

        let ns = h.namespace("alpha");
        prop_assert_eq!(ns.shards_successful, 4);
        prop_assert_eq!(ns.timing.count, 40);
        prop_assert_eq!(h.calls.lock().unwrap().len(), 4);
        prop_assert_eq!(h.queue.added_for(&h.path(Route::NamespaceComplete)), 1);
        let job = h.job();
        prop_assert!(job.is_completed());
        prop_assert_eq!(job.timing.count, 40);
    }
}
