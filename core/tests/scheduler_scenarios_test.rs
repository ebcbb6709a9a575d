//! Deterministic tick-loop scenarios driven through a virtual clock.

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};
use pipewright::clock::{AdvanceableClock, VirtualClock};
use pipewright::config::StorageLayout;
use pipewright::cron::CronExpression;
use pipewright::execution::ExecutionStatus;
use pipewright::orchestrator::Orchestrator;
use pipewright::registry::PipelineConfig;
use pipewright::runner::{CancelToken, EngineError, LogSink, PipelineEngine};
use pipewright::schedule::{PipelineRef, ScheduleConfig};
use pipewright::store::ExecutionFilter;
use std::sync::Arc;
use std::time::Duration;

/// Fails every run, counting the attempts
#[derive(Default)]
struct AlwaysFailingEngine {
    attempts: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl PipelineEngine for AlwaysFailingEngine {
    async fn execute(
        &self,
        _config: &PipelineConfig,
        log: &LogSink,
        _cancel: &CancelToken,
    ) -> Result<(), EngineError> {
        let n = self
            .attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        log.push(format!("attempt {}", n + 1));
        Err(EngineError::Failed("synthetic failure".into()))
    }
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
}

fn schedule_with_id(
    id: &str,
    cron: &str,
    dependencies: Vec<String>,
    max_retries: u32,
    retry_delay_seconds: u64,
    now: DateTime<Local>,
) -> ScheduleConfig {
    let cron = CronExpression::parse(cron).unwrap();
    ScheduleConfig {
        id: id.to_string(),
        pipeline_ref: PipelineRef::Id(format!("pipeline-{id}")),
        next_run: cron.next_after(now).unwrap(),
        cron_expression: cron,
        enabled: true,
        dependencies,
        max_retries,
        retry_delay_seconds,
        timeout_seconds: None,
        last_run_time: None,
        last_run_status: None,
        created_at: now,
        updated_at: now,
    }
}

struct Fixture {
    orchestrator: Orchestrator,
    clock: Arc<VirtualClock>,
    _dir: tempfile::TempDir,
}

impl Fixture {
    /// Registers the schedule together with the catalog document its pipeline id
    /// resolves through
    async fn add_schedule(&self, schedule: ScheduleConfig) {
        let pipeline_id = schedule.pipeline_ref.as_display_string();
        let doc = self
            .orchestrator
            .layout()
            .pipelines_dir()
            .join(format!("{pipeline_id}.json"));
        std::fs::write(
            doc,
            serde_json::to_vec_pretty(&PipelineConfig::bare(&pipeline_id)).unwrap(),
        )
        .unwrap();
        self.orchestrator
            .scheduler()
            .insert_schedule(schedule)
            .await
            .unwrap();
    }
}

fn fixture_with_engine(
    engine: impl PipelineEngine + 'static,
    start: DateTime<Local>,
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(VirtualClock::new(start));
    let orchestrator = Orchestrator::builder()
        .layout(StorageLayout::new(dir.path()))
        .engine(engine)
        .clock(clock.clone())
        .build();
    Fixture {
        orchestrator,
        clock,
        _dir: dir,
    }
}

async fn all_records(orchestrator: &Orchestrator) -> Vec<pipewright::execution::ExecutionRecord> {
    orchestrator
        .executions(&ExecutionFilter::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn single_fire_advances_to_the_next_window() {
    let fx = fixture_with_engine(pipewright::runner::NoopEngine, at(12, 0, 0));
    fx.orchestrator.bootstrap().await.unwrap();
    fx.add_schedule(schedule_with_id("every-minute", "* * * * *", vec![], 3, 300, at(12, 0, 0)))
        .await;

    // Before the window: nothing fires.
    fx.clock.advance_to(at(12, 0, 30)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.fired, 0);
    assert!(all_records(&fx.orchestrator).await.is_empty());

    // Past the window: exactly one record, successful, and the next window is the
    // following minute boundary.
    fx.clock.advance_to(at(12, 1, 5)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.fired, 1);

    let records = all_records(&fx.orchestrator).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Success);
    assert_eq!(records[0].schedule_id, "every-minute");

    let schedule = fx.orchestrator.get("every-minute").await.unwrap();
    assert_eq!(schedule.next_run, at(12, 2, 0));
    assert_eq!(schedule.last_run_status, Some(ExecutionStatus::Success));
}

#[tokio::test]
async fn dependency_gate_defers_until_the_predecessor_succeeded() {
    let fx = fixture_with_engine(pipewright::runner::NoopEngine, at(12, 0, 30));
    fx.orchestrator.bootstrap().await.unwrap();

    // The dependent sorts first so the gate is evaluated before its predecessor
    // fires within the same tick.
    fx.add_schedule(schedule_with_id(
        "a-dependent",
        "* * * * *",
        vec!["b-upstream".to_string()],
        3,
        300,
        at(12, 0, 30),
    ))
    .await;
    fx.add_schedule(schedule_with_id("b-upstream", "* * * * *", vec![], 3, 300, at(12, 0, 30)))
        .await;

    fx.clock.advance_to(at(12, 1, 0)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.fired, 1);
    assert_eq!(summary.deferred, 1);
    let records = all_records(&fx.orchestrator).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].schedule_id, "b-upstream");

    // The dependent was deferred without advancing its window, so the next tick
    // fires both: the predecessor's latest terminal record is now a SUCCESS.
    fx.clock.advance_to(at(12, 2, 0)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.fired, 2);
    assert_eq!(summary.deferred, 0);

    let dependent_records = fx
        .orchestrator
        .executions(
            &ExecutionFilter::builder()
                .schedule_id(Some("a-dependent".to_string()))
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(dependent_records.len(), 1);
    assert_eq!(dependent_records[0].status, ExecutionStatus::Success);
}

#[tokio::test]
async fn retry_exhaustion_produces_a_terminal_failed_chain() {
    let fx = fixture_with_engine(AlwaysFailingEngine::default(), at(12, 0, 30));
    fx.orchestrator.bootstrap().await.unwrap();
    fx.add_schedule(schedule_with_id("flaky", "* * * * *", vec![], 2, 1, at(12, 0, 30)))
        .await;

    // First attempt fires on the cron window and is superseded by a retry.
    fx.clock.advance_to(at(12, 1, 0)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.fired, 1);

    // Retry #1 one second later.
    fx.clock.advance(Duration::from_secs(1)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.retried, 1);

    // Retry #2 exhausts the budget.
    fx.clock.advance(Duration::from_secs(1)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.retried, 1);

    let records = all_records(&fx.orchestrator).await;
    assert_eq!(records.len(), 3, "exactly one record per attempt");

    // Newest first: the final attempt is terminal FAILED, the earlier two were
    // superseded (RETRYING), and all three share the original record's chain.
    assert_eq!(records[0].status, ExecutionStatus::Failed);
    assert_eq!(records[0].retry_count, 2);
    assert_eq!(records[1].status, ExecutionStatus::Retrying);
    assert_eq!(records[2].status, ExecutionStatus::Retrying);
    let origin = &records[2];
    assert!(origin.chain_id.is_none());
    assert_eq!(records[0].chain_id.as_deref(), Some(origin.id.as_str()));
    assert_eq!(records[1].chain_id.as_deref(), Some(origin.id.as_str()));

    // The cadence is untouched by the retries.
    let schedule = fx.orchestrator.get("flaky").await.unwrap();
    assert_eq!(schedule.next_run, at(12, 2, 0));
}

#[tokio::test]
async fn zero_max_retries_means_the_first_failure_is_terminal() {
    let fx = fixture_with_engine(AlwaysFailingEngine::default(), at(12, 0, 30));
    fx.orchestrator.bootstrap().await.unwrap();
    fx.add_schedule(schedule_with_id("one-shot", "* * * * *", vec![], 0, 1, at(12, 0, 30)))
        .await;

    fx.clock.advance_to(at(12, 1, 0)).await;
    fx.orchestrator.run_once(false).await;
    // Give the (nonexistent) retry a chance to surface if the policy were wrong.
    fx.clock.advance(Duration::from_secs(5)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.retried, 0);

    let records = all_records(&fx.orchestrator).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Failed);
    assert_eq!(records[0].error_message.as_deref(), Some("synthetic failure"));
}

#[tokio::test]
async fn a_new_cron_window_abandons_pending_retries() {
    let fx = fixture_with_engine(AlwaysFailingEngine::default(), at(12, 0, 30));
    fx.orchestrator.bootstrap().await.unwrap();
    // Retry delay far beyond the cadence: the next window always arrives first.
    fx.add_schedule(schedule_with_id("slow-retry", "* * * * *", vec![], 3, 3600, at(12, 0, 30)))
        .await;

    // First window fails and leaves a retry due at 13:01.
    fx.clock.advance_to(at(12, 1, 0)).await;
    fx.orchestrator.run_once(false).await;

    // The 12:02 window fires first, abandoning that retry (and leaving its own,
    // due at 13:02).
    fx.clock.advance_to(at(12, 2, 0)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.fired, 1);
    assert_eq!(summary.retried, 0);

    // Deregister further windows so only retries could possibly dispatch, then
    // cross the abandoned retry's due instant: nothing runs.
    fx.orchestrator
        .update(
            "slow-retry",
            pipewright::schedule::ScheduleUpdate::builder()
                .enabled(Some(false))
                .build(),
        )
        .await
        .unwrap();
    let before = all_records(&fx.orchestrator).await.len();
    fx.clock.advance_to(at(13, 1, 30)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.retried, 0);
    assert_eq!(all_records(&fx.orchestrator).await.len(), before);
}

#[tokio::test]
async fn force_run_once_fires_every_enabled_schedule_exactly_once() {
    let fx = fixture_with_engine(pipewright::runner::NoopEngine, at(9, 0, 0));
    fx.orchestrator.bootstrap().await.unwrap();
    for i in 0..5 {
        // A daily 8am cron whose next window is far in the future.
        fx.add_schedule(schedule_with_id(
            &format!("forced-{i}"),
            "0 8 * * *",
            vec![],
            3,
            300,
            at(9, 0, 0),
        ))
        .await;
    }

    let force_time = at(9, 30, 0);
    fx.clock.advance_to(force_time).await;
    let summary = fx.orchestrator.run_once(true).await;
    assert_eq!(summary.fired, 5);

    let records = all_records(&fx.orchestrator).await;
    assert_eq!(records.len(), 5);
    for schedule in fx.orchestrator.list().await {
        assert!(schedule.next_run > force_time);
    }

    // The force is one-shot: nothing fires again on the next tick.
    fx.clock.advance(Duration::from_secs(60)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.fired, 0);
}

#[tokio::test]
async fn disabled_schedules_are_skipped_by_the_tick_loop() {
    let fx = fixture_with_engine(pipewright::runner::NoopEngine, at(12, 0, 0));
    fx.orchestrator.bootstrap().await.unwrap();
    let mut schedule = schedule_with_id("sleeper", "* * * * *", vec![], 3, 300, at(12, 0, 0));
    schedule.enabled = false;
    fx.add_schedule(schedule).await;

    fx.clock.advance_to(at(12, 5, 0)).await;
    let summary = fx.orchestrator.run_once(false).await;
    assert_eq!(summary.fired, 0);
    assert!(all_records(&fx.orchestrator).await.is_empty());
}

#[tokio::test]
async fn per_run_timeout_records_a_distinguishable_failure() {
    struct SlowEngine;

    #[async_trait]
    impl PipelineEngine for SlowEngine {
        async fn execute(
            &self,
            _config: &PipelineConfig,
            _log: &LogSink,
            cancel: &CancelToken,
        ) -> Result<(), EngineError> {
            loop {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    let fx = fixture_with_engine(SlowEngine, at(12, 0, 30));
    fx.orchestrator.bootstrap().await.unwrap();
    let mut schedule = schedule_with_id("laggard", "* * * * *", vec![], 0, 1, at(12, 0, 30));
    schedule.timeout_seconds = Some(1);
    fx.add_schedule(schedule).await;

    fx.clock.advance_to(at(12, 1, 0)).await;
    fx.orchestrator.run_once(false).await;

    let records = all_records(&fx.orchestrator).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Failed);
    assert_eq!(
        records[0].error_message.as_deref(),
        Some(pipewright::runner::TIMEOUT_ERROR_MESSAGE)
    );
}
