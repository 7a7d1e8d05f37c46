use super::*;
use crate::event_bus::Event;
use crate::plugin::PluginState;
use crate::scheduler::triggers::TriggerType;
use crate::scheduler::types::work_fn;
use crate::utils::RetryPolicy;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

const PLUGIN: &str = "worker";

struct Harness {
    executor: JobExecutor,
    store: Arc<JobStore>,
    bus: EventBus,
    plugins: PluginStateView,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Harness {
    fn add(&self, definition: JobDefinition, work: UnitOfWork) {
        self.executor.register(JobRegistration::new(definition, work));
    }

    fn due(&self, job_id: &str, source: DueSource) {
        self.executor
            .due_sender()
            .send(DueSignal::new(job_id, source))
            .unwrap();
    }
}

fn test_config() -> HostConfig {
    HostConfig::default()
        .with_deferral(crate::config::DeferralConfig {
            max_deferrals: 2,
            initial_delay_ms: 10,
            max_delay_ms: 20,
        })
}

async fn harness(config: HostConfig) -> Harness {
    let store = Arc::new(JobStore::in_memory().await.unwrap());
    let bus = EventBus::new();
    let plugins = PluginStateView::new();
    plugins.set(PLUGIN, PluginState::Running);

    let (due_tx, due_rx) = mpsc::unbounded_channel();
    let executor = JobExecutor::new(config, store.clone(), bus.clone(), plugins.clone(), due_tx);
    let shutdown = CancellationToken::new();
    let runner = executor.clone();
    let token = shutdown.clone();
    tokio::spawn(async move { runner.run(due_rx, token).await });

    Harness {
        executor,
        store,
        bus,
        plugins,
        shutdown,
    }
}

fn job(id: &str) -> JobDefinition {
    JobDefinition::new(id, PLUGIN, TriggerType::interval(Duration::from_secs(3600)))
        .with_retry(RetryPolicy::none())
}

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(attempts)
        .with_initial_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(20))
}

fn echo_work() -> UnitOfWork {
    work_fn(|ctx: WorkContext| async move {
        Ok(json!({ "attempt": ctx.attempt, "payload": ctx.payload }))
    })
}

fn failing_work(calls: Arc<AtomicU32>) -> UnitOfWork {
    work_fn(move |_| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("disk full"))
        }
    })
}

fn slow_work(duration: Duration) -> UnitOfWork {
    work_fn(move |_| async move {
        tokio::time::sleep(duration).await;
        Ok(Value::Null)
    })
}

fn exploding() -> anyhow::Result<Value> {
    panic!("worker exploded")
}

async fn wait_for_runs(store: &JobStore, job_id: &str, done: impl Fn(&[JobRun]) -> bool) -> Vec<JobRun> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let runs = store.list_runs(job_id).await.unwrap();
        if done(&runs) {
            return runs;
        }
        assert!(Instant::now() < deadline, "timed out, runs so far: {:#?}", runs);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until(check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Arc<Event>>) -> Arc<Event> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn finished(runs: &[JobRun]) -> usize {
    runs.iter().filter(|r| r.outcome.is_finished()).count()
}

#[tokio::test]
async fn test_successful_run_publishes_completion() {
    let h = harness(test_config()).await;
    let (_sub, mut events) = h.bus.subscribe_channel("job_*");
    h.add(job("report"), echo_work());

    assert!(h.executor.run_now("report", Some(json!({"range": "daily"}))));

    let started = next_event(&mut events).await;
    assert_eq!(started.topic, topics::JOB_STARTED);
    let completed = next_event(&mut events).await;
    assert_eq!(completed.topic, topics::JOB_COMPLETED);
    assert_eq!(completed.payload["result"]["payload"]["range"], "daily");

    let runs = wait_for_runs(&h.store, "report", |r| finished(r) == 1).await;
    assert_eq!(runs[0].outcome, RunOutcome::Success);
    assert_eq!(runs[0].attempt, 1);
    assert_eq!(runs[0].id.to_string(), completed.payload["run_id"]);
}

#[tokio::test]
async fn test_run_now_unknown_job() {
    let h = harness(test_config()).await;
    assert!(!h.executor.run_now("missing", None));
}

#[tokio::test]
async fn test_retry_exhaustion_records_each_attempt() {
    let h = harness(test_config()).await;
    let (_sub, mut failures) = h.bus.subscribe_channel(topics::JOB_FAILED);
    let calls = Arc::new(AtomicU32::new(0));
    h.add(job("flaky").with_retry(fast_retry(3)), failing_work(calls.clone()));

    h.due("flaky", DueSource::Timer);

    let failed = next_event(&mut failures).await;
    assert_eq!(failed.payload["attempts"], 3);
    assert_eq!(failed.payload["outcome"], "failed");

    let runs = wait_for_runs(&h.store, "flaky", |r| finished(r) == 3).await;
    let attempts: Vec<u32> = runs.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(runs.iter().all(|r| r.outcome == RunOutcome::Failed));
    assert!(runs.iter().all(|r| r.invocation_id == runs[0].invocation_id));
    assert_eq!(runs[2].error.as_deref(), Some("disk full"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.store.list_runs("flaky").await.unwrap().len(), 3);
    assert!(failures.try_recv().is_err());
}

#[tokio::test]
async fn test_retry_then_success() {
    let h = harness(test_config()).await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let work = work_fn(move |ctx: WorkContext| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if ctx.attempt < 2 {
                anyhow::bail!("transient");
            }
            Ok(json!("done"))
        }
    });
    h.add(job("sync").with_retry(fast_retry(5)), work);

    h.due("sync", DueSource::Timer);

    let runs = wait_for_runs(&h.store, "sync", |r| {
        r.iter().any(|run| run.outcome == RunOutcome::Success)
    })
    .await;
    let outcomes: Vec<&RunOutcome> = runs.iter().map(|r| &r.outcome).collect();
    assert_eq!(outcomes, vec![&RunOutcome::Failed, &RunOutcome::Success]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let h = harness(test_config()).await;
    let (_sub, mut failures) = h.bus.subscribe_channel(topics::JOB_FAILED);
    h.add(
        job("hang").with_timeout(Duration::from_millis(50)),
        slow_work(Duration::from_secs(30)),
    );

    h.due("hang", DueSource::Timer);

    let failed = next_event(&mut failures).await;
    assert_eq!(failed.payload["outcome"], "timeout");
    let runs = wait_for_runs(&h.store, "hang", |r| finished(r) == 1).await;
    assert_eq!(runs[0].outcome, RunOutcome::Timeout);
    assert!(runs[0].error.as_deref().unwrap().contains("timed out"));
    wait_until(|| h.executor.in_flight("hang") == 0).await;
}

#[tokio::test]
async fn test_panicking_work_is_recorded_as_failure() {
    let h = harness(test_config()).await;
    h.add(job("boom"), work_fn(|_| async move { exploding() }));

    h.due("boom", DueSource::Timer);

    let runs = wait_for_runs(&h.store, "boom", |r| finished(r) == 1).await;
    assert_eq!(runs[0].outcome, RunOutcome::Failed);
    assert!(runs[0].error.as_deref().unwrap().contains("worker exploded"));

    // The executor keeps running after a panic
    h.add(job("after"), echo_work());
    h.due("after", DueSource::Timer);
    wait_for_runs(&h.store, "after", |r| finished(r) == 1).await;
}

#[tokio::test]
async fn test_concurrency_limit_skips_timer_signals() {
    let h = harness(test_config()).await;
    h.add(job("slow"), slow_work(Duration::from_millis(200)));

    for _ in 0..3 {
        h.due("slow", DueSource::Timer);
    }

    let runs = wait_for_runs(&h.store, "slow", |r| finished(r) == 3).await;
    let skipped = runs
        .iter()
        .filter(|r| r.outcome == RunOutcome::Skipped(SkipReason::ConcurrencyLimit))
        .count();
    let succeeded = runs.iter().filter(|r| r.outcome == RunOutcome::Success).count();
    assert_eq!(skipped, 2);
    assert_eq!(succeeded, 1);
}

#[tokio::test]
async fn test_event_signals_wait_in_backlog() {
    let h = harness(test_config()).await;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (active.clone(), peak.clone());
    let work = work_fn(move |_| {
        let (active, peak) = (a.clone(), p.clone());
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    });
    h.add(job("on_alert"), work);

    for _ in 0..3 {
        h.due("on_alert", DueSource::Event);
    }

    let runs = wait_for_runs(&h.store, "on_alert", |r| finished(r) == 3).await;
    assert!(runs.iter().all(|r| r.outcome == RunOutcome::Success));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_event_backlog_drops_oldest() {
    let h = harness(test_config().with_event_queue_depth(1)).await;
    h.add(
        job("on_alert"),
        work_fn(|ctx: WorkContext| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(ctx.payload.unwrap_or(Value::Null))
        }),
    );

    let sender = h.executor.due_sender();
    for n in 1..=3 {
        sender
            .send(DueSignal::new("on_alert", DueSource::Event).with_payload(json!(n)))
            .unwrap();
    }

    let runs = wait_for_runs(&h.store, "on_alert", |r| finished(r) == 2).await;
    let results: Vec<Value> = runs.iter().filter_map(|r| r.result.clone()).collect();
    assert_eq!(results, vec![json!(1), json!(3)]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.store.list_runs("on_alert").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_worker_pool_bounds_total_runs() {
    let h = harness(test_config().with_worker_pool_size(1)).await;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for id in ["a", "b", "c", "d"] {
        let (active, peak) = (active.clone(), peak.clone());
        let work = work_fn(move |_| {
            let (active, peak) = (active.clone(), peak.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        h.add(job(id), work);
        h.due(id, DueSource::Timer);
    }

    for id in ["a", "b", "c", "d"] {
        let runs = wait_for_runs(&h.store, id, |r| finished(r) == 1).await;
        assert_eq!(runs[0].outcome, RunOutcome::Success);
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_queue_overflow_drops_oldest_invocation() {
    let h = harness(test_config().with_worker_pool_size(1).with_queue_capacity(1)).await;
    let (_sub, mut overflow) = h.bus.subscribe_channel(topics::QUEUE_OVERFLOW);
    h.add(job("busy"), slow_work(Duration::from_millis(200)));
    h.add(job("first"), echo_work());
    h.add(job("second"), echo_work());

    h.due("busy", DueSource::Timer);
    wait_for_runs(&h.store, "busy", |r| !r.is_empty()).await;

    h.due("first", DueSource::Timer);
    h.due("second", DueSource::Timer);

    let event = next_event(&mut overflow).await;
    assert_eq!(event.payload["job_id"], "first");
    wait_until(|| h.executor.in_flight("first") == 0).await;

    let runs = wait_for_runs(&h.store, "second", |r| finished(r) == 1).await;
    assert_eq!(runs[0].outcome, RunOutcome::Success);
    assert!(h.store.list_runs("first").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disabled_job_signals_are_dropped() {
    let h = harness(test_config()).await;
    h.add(job("off").with_enabled(false), echo_work());

    h.due("off", DueSource::Timer);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.list_runs("off").await.unwrap().is_empty());

    assert!(h.executor.set_enabled("off", true));
    h.due("off", DueSource::Timer);
    wait_for_runs(&h.store, "off", |r| finished(r) == 1).await;
}

#[tokio::test]
async fn test_deferral_exhaustion_skips_plugin_unavailable() {
    let h = harness(test_config()).await;
    h.plugins.set(PLUGIN, PluginState::Stopped);
    let (_sub, mut skips) = h.bus.subscribe_channel(topics::JOB_SKIPPED);
    h.add(job("report"), echo_work());

    h.due("report", DueSource::Timer);

    let skipped = next_event(&mut skips).await;
    assert_eq!(skipped.payload["reason"]["reason"], "plugin_unavailable");
    let runs = wait_for_runs(&h.store, "report", |r| !r.is_empty()).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, RunOutcome::Skipped(SkipReason::PluginUnavailable));
    assert_eq!(runs[0].attempt, 0);
}

#[tokio::test]
async fn test_deferred_signal_runs_once_plugin_starts() {
    let config = HostConfig::default().with_deferral(crate::config::DeferralConfig {
        max_deferrals: 10,
        initial_delay_ms: 10,
        max_delay_ms: 20,
    });
    let h = harness(config).await;
    h.plugins.set(PLUGIN, PluginState::Initialized);
    h.add(job("report"), echo_work());

    h.due("report", DueSource::Timer);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(h.store.list_runs("report").await.unwrap().is_empty());

    h.plugins.set(PLUGIN, PluginState::Running);
    let runs = wait_for_runs(&h.store, "report", |r| finished(r) == 1).await;
    assert_eq!(runs[0].outcome, RunOutcome::Success);
}

#[tokio::test]
async fn test_unmet_dependency_is_skipped() {
    let h = harness(test_config()).await;
    h.add(job("collect"), echo_work());
    h.add(job("report").depends_on("collect"), echo_work());

    h.due("report", DueSource::Timer);
    let runs = wait_for_runs(&h.store, "report", |r| !r.is_empty()).await;
    assert_eq!(
        runs[0].outcome,
        RunOutcome::Skipped(SkipReason::DependencyUnmet {
            dependency: "collect".into()
        })
    );

    h.due("collect", DueSource::Timer);
    wait_for_runs(&h.store, "collect", |r| finished(r) == 1).await;

    h.due("report", DueSource::Timer);
    let runs = wait_for_runs(&h.store, "report", |r| r.len() == 2 && finished(r) == 2).await;
    assert_eq!(runs[1].outcome, RunOutcome::Success);
}

#[tokio::test]
async fn test_failed_dependency_is_unmet() {
    let h = harness(test_config()).await;
    h.add(job("collect"), failing_work(Arc::new(AtomicU32::new(0))));
    h.add(job("report").depends_on("collect"), echo_work());

    h.due("collect", DueSource::Timer);
    wait_for_runs(&h.store, "collect", |r| finished(r) == 1).await;

    h.due("report", DueSource::Timer);
    let runs = wait_for_runs(&h.store, "report", |r| !r.is_empty()).await;
    assert!(matches!(
        runs[0].outcome,
        RunOutcome::Skipped(SkipReason::DependencyUnmet { .. })
    ));
}

#[tokio::test]
async fn test_cancel_running_attempt() {
    let h = harness(test_config()).await;
    h.add(job("long"), slow_work(Duration::from_secs(30)));

    h.due("long", DueSource::Timer);
    let runs = wait_for_runs(&h.store, "long", |r| !r.is_empty()).await;
    let run_id = runs[0].id;

    assert!(h.executor.cancel(run_id));
    let runs = wait_for_runs(&h.store, "long", |r| finished(r) == 1).await;
    assert_eq!(runs[0].outcome, RunOutcome::Cancelled);
    wait_until(|| h.executor.in_flight("long") == 0).await;

    assert!(!h.executor.cancel(run_id));
    assert!(!h.executor.cancel(Uuid::new_v4()));
}

#[tokio::test]
async fn test_drain_waits_for_quick_runs() {
    let h = harness(test_config()).await;
    h.add(job("quick"), slow_work(Duration::from_millis(50)));

    h.due("quick", DueSource::Timer);
    wait_for_runs(&h.store, "quick", |r| !r.is_empty()).await;

    h.plugins.set(PLUGIN, PluginState::Stopping);
    let cancelled = h.executor.drain_plugin(PLUGIN, Duration::from_secs(5)).await;
    assert_eq!(cancelled, 0);
    assert_eq!(h.executor.in_flight("quick"), 0);

    let runs = h.store.list_runs("quick").await.unwrap();
    assert_eq!(runs[0].outcome, RunOutcome::Success);
}

#[tokio::test]
async fn test_drain_cancels_after_grace() {
    let h = harness(test_config()).await;
    h.add(job("long"), slow_work(Duration::from_secs(30)));

    h.due("long", DueSource::Timer);
    wait_for_runs(&h.store, "long", |r| !r.is_empty()).await;

    h.plugins.set(PLUGIN, PluginState::Stopping);
    let cancelled = h
        .executor
        .drain_plugin(PLUGIN, Duration::from_millis(50))
        .await;
    assert_eq!(cancelled, 1);
    assert_eq!(h.executor.in_flight("long"), 0);

    let runs = wait_for_runs(&h.store, "long", |r| finished(r) == 1).await;
    assert_eq!(runs[0].outcome, RunOutcome::Cancelled);
}

#[tokio::test]
async fn test_unregister_cancels_and_forgets_job() {
    let h = harness(test_config()).await;
    h.add(job("long"), slow_work(Duration::from_secs(30)));
    h.add(job("other"), echo_work());

    h.due("long", DueSource::Timer);
    wait_for_runs(&h.store, "long", |r| !r.is_empty()).await;

    let removed = h.executor.unregister("long").unwrap();
    assert_eq!(removed.id, "long");
    assert!(h.executor.definition("long").is_none());
    assert_eq!(h.executor.jobs_for(PLUGIN), vec!["other"]);

    let runs = wait_for_runs(&h.store, "long", |r| finished(r) == 1).await;
    assert_eq!(runs[0].outcome, RunOutcome::Cancelled);
}

#[tokio::test]
async fn test_register_replaces_definition() {
    let h = harness(test_config()).await;
    h.add(job("report"), echo_work());
    h.add(job("report").with_max_concurrent(4).with_tag("v2"), echo_work());

    let jobs = h.executor.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].max_concurrent, 4);

    let mut updated = jobs[0].clone();
    updated.tags.clear();
    assert!(h.executor.update_definition(updated));
    assert!(h.executor.definition("report").unwrap().tags.is_empty());
    assert!(!h.executor.update_definition(job("ghost")));
}

#[tokio::test]
async fn test_plugin_stop_between_attempts_publishes_failure() {
    let h = harness(test_config()).await;
    let (_sub, mut failures) = h.bus.subscribe_channel(topics::JOB_FAILED);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let plugins = h.plugins.clone();
    let work = work_fn(move |_| {
        let counter = counter.clone();
        let plugins = plugins.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            plugins.set(PLUGIN, PluginState::Stopped);
            Err(anyhow::anyhow!("connection reset"))
        }
    });
    h.add(job("upload").with_retry(fast_retry(3)), work);

    h.due("upload", DueSource::Timer);

    let failed = next_event(&mut failures).await;
    assert_eq!(failed.payload["job_id"], "upload");
    assert_eq!(failed.payload["attempts"], 1);
    assert_eq!(failed.payload["error"], "connection reset");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    wait_until(|| h.executor.in_flight("upload") == 0).await;
}
