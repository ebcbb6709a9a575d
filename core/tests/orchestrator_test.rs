//! Façade-level behavior: persistence, validation, manual runs, reconciliation and
//! the queued dispatch path end-to-end with a worker.

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use pipewright::clock::{AdvanceableClock, VirtualClock};
use pipewright::config::StorageLayout;
use pipewright::cron::CronExpression;
use pipewright::errors::OrchestratorError;
use pipewright::execution::ExecutionStatus;
use pipewright::orchestrator::Orchestrator;
use pipewright::queue::{FileTaskQueue, TaskQueue};
use pipewright::reconcile::{CatalogEntry, ScheduleCatalog};
use pipewright::registry::PipelineConfig;
use pipewright::runner::{NoopEngine, PipelineRunner};
use pipewright::schedule::{PipelineRef, ScheduleConfig, ScheduleSpec, ScheduleUpdate};
use pipewright::scheduler::ExecutionObserver;
use pipewright::store::ExecutionStore;
use pipewright::worker::Worker;
use std::sync::{Arc, Mutex};

fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
}

fn spec(pipeline: &str, cron: &str) -> ScheduleSpec {
    ScheduleSpec::builder()
        .pipeline_ref(PipelineRef::from_raw(pipeline))
        .cron_expression(CronExpression::parse(cron).unwrap())
        .build()
}

fn schedule_with_id(id: &str, cron: &str, deps: Vec<String>, now: DateTime<Local>) -> ScheduleConfig {
    let cron = CronExpression::parse(cron).unwrap();
    ScheduleConfig {
        id: id.to_string(),
        pipeline_ref: PipelineRef::Id(format!("pipeline-{id}")),
        next_run: cron.next_after(now).unwrap(),
        cron_expression: cron,
        enabled: true,
        dependencies: deps,
        max_retries: 3,
        retry_delay_seconds: 300,
        timeout_seconds: None,
        last_run_time: None,
        last_run_status: None,
        created_at: now,
        updated_at: now,
    }
}

/// Drops a catalog document in place so `pipeline-<id>` references resolve
fn register_pipeline(base: &std::path::Path, pipeline_id: &str) {
    let dir = base.join("pipelines");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(format!("{pipeline_id}.json")),
        serde_json::to_vec_pretty(&PipelineConfig::bare(pipeline_id)).unwrap(),
    )
    .unwrap();
}

fn orchestrator_at(dir: &std::path::Path, clock: Arc<VirtualClock>) -> Orchestrator {
    Orchestrator::builder()
        .layout(StorageLayout::new(dir))
        .engine(NoopEngine)
        .clock(clock)
        .build()
}

#[tokio::test]
async fn add_remove_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(VirtualClock::new(at(12, 0, 0)));
    let orchestrator = orchestrator_at(dir.path(), clock);
    orchestrator.bootstrap().await.unwrap();

    let id = orchestrator.add(spec("warehouse-load", "0 8 * * *")).await.unwrap();
    let on_disk = dir.path().join("schedules").join(format!("{id}.json"));
    assert!(on_disk.exists());

    assert!(orchestrator.remove(&id).await.unwrap());
    assert!(orchestrator.list().await.is_empty());
    assert!(!on_disk.exists());
    assert!(!orchestrator.remove(&id).await.unwrap());
}

#[tokio::test]
async fn a_fresh_orchestrator_observes_the_same_schedule_set() {
    let dir = tempfile::tempdir().unwrap();

    let first = orchestrator_at(dir.path(), Arc::new(VirtualClock::new(at(12, 0, 0))));
    first.bootstrap().await.unwrap();
    let id = orchestrator_add_full(&first).await;
    let before = first.get(&id).await.unwrap();
    drop(first);

    let second = orchestrator_at(dir.path(), Arc::new(VirtualClock::new(at(15, 0, 0))));
    second.bootstrap().await.unwrap();
    let after = second.get(&id).await.unwrap();
    assert_eq!(after, before, "persistence round-trip must be field-wise exact");
}

async fn orchestrator_add_full(orchestrator: &Orchestrator) -> String {
    let spec = ScheduleSpec::builder()
        .pipeline_ref(PipelineRef::from_raw("warehouse-load"))
        .cron_expression(CronExpression::parse("0 8 * * *").unwrap())
        .enabled(true)
        .dependencies(vec![])
        .max_retries(5)
        .retry_delay_seconds(60)
        .timeout_seconds(Some(900))
        .build();
    orchestrator.add(spec).await.unwrap()
}

#[tokio::test]
async fn updating_with_identical_fields_is_observably_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(VirtualClock::new(at(12, 0, 0)));
    let orchestrator = orchestrator_at(dir.path(), clock.clone());
    orchestrator.bootstrap().await.unwrap();

    let id = orchestrator.add(spec("nightly", "0 8 * * *")).await.unwrap();
    let before = orchestrator.get(&id).await.unwrap();

    clock.advance(std::time::Duration::from_secs(600)).await;
    let update = ScheduleUpdate::builder()
        .cron_expression(Some(CronExpression::parse("0 8 * * *").unwrap()))
        .enabled(Some(true))
        .build();
    let after = orchestrator.update(&id, update).await.unwrap();
    assert_eq!(after.next_run, before.next_run, "unchanged cron must not move next_run");

    // An actually changed cron recomputes.
    let update = ScheduleUpdate::builder()
        .cron_expression(Some(CronExpression::parse("30 9 * * *").unwrap()))
        .build();
    let after = orchestrator.update(&id, update).await.unwrap();
    // The clock sits at 12:10, so the next 09:30 window is tomorrow's.
    assert_eq!(after.next_run, at(9, 30, 0) + chrono::Duration::days(1));
}

#[tokio::test]
async fn dependency_cycles_are_rejected_without_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(VirtualClock::new(at(12, 0, 0)));
    let orchestrator = orchestrator_at(dir.path(), clock);
    orchestrator.bootstrap().await.unwrap();
    let scheduler = orchestrator.scheduler();

    scheduler
        .insert_schedule(schedule_with_id("aaa", "* * * * *", vec![], at(12, 0, 0)))
        .await
        .unwrap();
    scheduler
        .insert_schedule(schedule_with_id("bbb", "* * * * *", vec!["aaa".into()], at(12, 0, 0)))
        .await
        .unwrap();

    let err = orchestrator.add_dependency("aaa", "bbb").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::DependencyCycle(_, _)));
    assert!(orchestrator.get("aaa").await.unwrap().dependencies.is_empty());

    // Self-dependencies are validation failures.
    let err = orchestrator.add_dependency("aaa", "aaa").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Validation(_) | OrchestratorError::DependencyCycle(_, _)
    ));

    // Longer cycles are caught too: ccc -> bbb -> aaa, then aaa -> ccc.
    scheduler
        .insert_schedule(schedule_with_id("ccc", "* * * * *", vec!["bbb".into()], at(12, 0, 0)))
        .await
        .unwrap();
    let err = orchestrator.add_dependency("aaa", "ccc").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::DependencyCycle(_, _)));
}

#[tokio::test]
async fn unknown_ids_surface_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_at(dir.path(), Arc::new(VirtualClock::new(at(12, 0, 0))));
    orchestrator.bootstrap().await.unwrap();

    assert!(matches!(
        orchestrator.get("ghost").await.unwrap_err(),
        OrchestratorError::ScheduleNotFound(_)
    ));
    assert!(matches!(
        orchestrator.run("ghost", false).await.unwrap_err(),
        OrchestratorError::ScheduleNotFound(_)
    ));
    assert!(matches!(
        orchestrator.status("ghost").await.unwrap_err(),
        OrchestratorError::ExecutionNotFound(_)
    ));
}

#[tokio::test]
async fn manual_runs_bypass_the_gate_and_leave_next_run_alone() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(VirtualClock::new(at(12, 0, 0)));
    let orchestrator = orchestrator_at(dir.path(), clock);
    orchestrator.bootstrap().await.unwrap();

    // A dependent whose predecessor never ran: the tick loop would defer it.
    register_pipeline(dir.path(), "pipeline-gated");
    let scheduler = orchestrator.scheduler();
    scheduler
        .insert_schedule(schedule_with_id("gated", "* * * * *", vec!["never-ran".into()], at(12, 0, 0)))
        .await
        .unwrap();
    let before = orchestrator.get("gated").await.unwrap();

    let execution_id = orchestrator.run("gated", false).await.unwrap();
    let record = orchestrator.status(&execution_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(record.trigger, pipewright::execution::TriggerKind::Manual);

    let after = orchestrator.get("gated").await.unwrap();
    assert_eq!(after.next_run, before.next_run);
}

#[tokio::test]
async fn observers_hear_about_terminal_transitions() {
    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(String, ExecutionStatus)>>,
    }

    #[async_trait]
    impl ExecutionObserver for Recording {
        async fn on_execution_complete(&self, record: &pipewright::execution::ExecutionRecord) {
            self.seen
                .lock()
                .unwrap()
                .push((record.schedule_id.clone(), record.status));
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let observer = Arc::new(Recording::default());
    let clock = Arc::new(VirtualClock::new(at(12, 0, 0)));
    let orchestrator = Orchestrator::builder()
        .layout(StorageLayout::new(dir.path()))
        .engine(NoopEngine)
        .clock(clock)
        .observers(vec![observer.clone() as Arc<dyn ExecutionObserver>])
        .build();
    orchestrator.bootstrap().await.unwrap();

    register_pipeline(dir.path(), "pipeline-observed");
    orchestrator
        .scheduler()
        .insert_schedule(schedule_with_id("observed", "* * * * *", vec![], at(12, 0, 0)))
        .await
        .unwrap();
    orchestrator.run("observed", false).await.unwrap();

    let seen = observer.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![("observed".to_string(), ExecutionStatus::Success)]);
}

#[tokio::test]
async fn deleting_a_schedule_leaves_its_history_intact() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(VirtualClock::new(at(12, 0, 0)));
    let orchestrator = orchestrator_at(dir.path(), clock);
    orchestrator.bootstrap().await.unwrap();

    register_pipeline(dir.path(), "pipeline-ephemeral");
    orchestrator
        .scheduler()
        .insert_schedule(schedule_with_id("ephemeral", "* * * * *", vec![], at(12, 0, 0)))
        .await
        .unwrap();
    let execution_id = orchestrator.run("ephemeral", false).await.unwrap();
    assert!(orchestrator.remove("ephemeral").await.unwrap());

    let record = orchestrator.status(&execution_id).await.unwrap();
    assert_eq!(record.schedule_id, "ephemeral");
    assert_eq!(record.status, ExecutionStatus::Success);
}

// ---------------------------------------------------------------------------
// Queued dispatch
// ---------------------------------------------------------------------------

struct QueuedFixture {
    orchestrator: Orchestrator,
    worker: Worker,
    clock: Arc<VirtualClock>,
    _dir: tempfile::TempDir,
}

fn queued_fixture() -> QueuedFixture {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(VirtualClock::new(at(12, 0, 0)));
    let layout = StorageLayout::new(dir.path());
    layout.ensure().unwrap();
    let queue =
        FileTaskQueue::open(dir.path().join("broker"), layout.results_dir()).unwrap();

    let orchestrator = Orchestrator::builder()
        .layout(layout.clone())
        .engine(NoopEngine)
        .clock(clock.clone())
        .queue(Some(Arc::new(queue.clone()) as Arc<dyn TaskQueue>))
        .build();

    let runner = PipelineRunner::builder()
        .engine(Arc::new(NoopEngine))
        .clock(clock.clone())
        .build();
    let worker = Worker::builder()
        .queue(queue)
        .runner(runner)
        .executions(ExecutionStore::new(layout.executions_dir()))
        .clock(clock.clone())
        .build();

    QueuedFixture {
        orchestrator,
        worker,
        clock,
        _dir: dir,
    }
}

#[tokio::test]
async fn queued_runs_flow_through_the_worker_and_back() {
    let fx = queued_fixture();
    fx.orchestrator.bootstrap().await.unwrap();
    register_pipeline(fx.orchestrator.layout().base(), "pipeline-spooled");
    fx.orchestrator
        .scheduler()
        .insert_schedule(schedule_with_id("spooled", "* * * * *", vec![], at(12, 0, 0)))
        .await
        .unwrap();

    let execution_id = fx.orchestrator.run("spooled", true).await.unwrap();
    // Submitted, not yet executed.
    let record = fx.orchestrator.status(&execution_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);

    // The worker picks it up and completes it.
    assert!(fx.worker.run_once().await.unwrap());

    // The next tick folds the result back in and updates the schedule.
    fx.clock.advance(std::time::Duration::from_secs(1)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.reaped, 1);

    let record = fx.orchestrator.status(&execution_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Success);
    let schedule = fx.orchestrator.get("spooled").await.unwrap();
    assert_eq!(schedule.last_run_status, Some(ExecutionStatus::Success));
}

#[tokio::test]
async fn cancelling_an_unclaimed_queued_run_closes_its_record() {
    let fx = queued_fixture();
    fx.orchestrator.bootstrap().await.unwrap();
    register_pipeline(fx.orchestrator.layout().base(), "pipeline-withdrawn");
    fx.orchestrator
        .scheduler()
        .insert_schedule(schedule_with_id("withdrawn", "* * * * *", vec![], at(12, 0, 0)))
        .await
        .unwrap();

    let execution_id = fx.orchestrator.run("withdrawn", true).await.unwrap();
    assert!(fx.orchestrator.cancel(&execution_id).await.unwrap());

    let record = fx.orchestrator.status(&execution_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    // Nothing is left for a worker.
    assert!(!fx.worker.run_once().await.unwrap());
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

struct FixedCatalog {
    entries: Vec<CatalogEntry>,
}

#[async_trait]
impl ScheduleCatalog for FixedCatalog {
    async fn entries(&self) -> pipewright::errors::Result<Vec<CatalogEntry>> {
        Ok(self.entries.clone())
    }
}

fn entry(id: &str, cron: &str, enabled: bool, updated_at: DateTime<Local>) -> CatalogEntry {
    CatalogEntry {
        id: id.to_string(),
        pipeline_ref: PipelineRef::Id(format!("pipeline-{id}")),
        cron_expression: CronExpression::parse(cron).unwrap(),
        enabled,
        dependencies: vec![],
        max_retries: 3,
        retry_delay_seconds: 300,
        timeout_seconds: None,
        updated_at,
    }
}

#[tokio::test]
async fn reconcile_converges_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(VirtualClock::new(at(12, 0, 0)));
    let orchestrator = orchestrator_at(dir.path(), clock);
    orchestrator.bootstrap().await.unwrap();

    // A local schedule the catalog does not know about.
    orchestrator
        .scheduler()
        .insert_schedule(schedule_with_id("local-only", "* * * * *", vec![], at(12, 0, 0)))
        .await
        .unwrap();

    let catalog = FixedCatalog {
        entries: vec![
            entry("from-catalog", "0 8 * * *", true, at(11, 0, 0)),
            entry("disabled-entry", "0 9 * * *", false, at(11, 0, 0)),
        ],
    };

    let summary = orchestrator.reconcile(&catalog).await.unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.updated, 0);

    let ids: Vec<String> = orchestrator.list().await.into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["from-catalog".to_string()]);

    // Running it again changes nothing.
    let summary = orchestrator.reconcile(&catalog).await.unwrap();
    assert!(summary.is_noop());
}

#[tokio::test]
async fn reconcile_takes_the_newer_catalog_version() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(VirtualClock::new(at(12, 0, 0)));
    let orchestrator = orchestrator_at(dir.path(), clock);
    orchestrator.bootstrap().await.unwrap();

    let catalog = FixedCatalog {
        entries: vec![entry("shared", "0 8 * * *", true, at(11, 0, 0))],
    };
    orchestrator.reconcile(&catalog).await.unwrap();

    // An older catalog version must not clobber the local one.
    let stale = FixedCatalog {
        entries: vec![entry("shared", "0 6 * * *", true, at(10, 0, 0))],
    };
    let summary = orchestrator.reconcile(&stale).await.unwrap();
    assert_eq!(summary.updated, 0);
    assert_eq!(
        orchestrator.get("shared").await.unwrap().cron_expression.as_str(),
        "0 8 * * *"
    );

    // A newer one wins.
    let newer = FixedCatalog {
        entries: vec![entry("shared", "30 8 * * *", true, at(13, 0, 0))],
    };
    let summary = orchestrator.reconcile(&newer).await.unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(
        orchestrator.get("shared").await.unwrap().cron_expression.as_str(),
        "30 8 * * *"
    );
}
