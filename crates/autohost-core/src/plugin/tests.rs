use super::*;
use crate::config::{AutoRestartConfig, PluginPolicyConfig};
use crate::error::{DependencyError, Error, LifecycleError};
use crate::event_bus::{handler_fn, topics, Event};
use crate::scheduler::JobStore;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

struct TestPlugin {
    descriptor: PluginDescriptor,
    fail_start: AtomicBool,
    healthy: AtomicBool,
    starts: AtomicU32,
    calls: Mutex<Vec<&'static str>>,
}

impl TestPlugin {
    fn new(descriptor: PluginDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            fail_start: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            starts: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn failing(descriptor: PluginDescriptor) -> Arc<Self> {
        let plugin = Self::new(descriptor);
        plugin.fail_start.store(true, Ordering::SeqCst);
        plugin
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        self.descriptor.clone()
    }

    async fn initialize(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        self.record("initialize");
        Ok(())
    }

    async fn start(&self, ctx: &PluginContext) -> anyhow::Result<()> {
        self.record("start");
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("port already in use");
        }
        ctx.subscribe_event("ping", handler_fn(|_| Ok(())));
        Ok(())
    }

    async fn stop(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        self.record("stop");
        Ok(())
    }

    async fn cleanup(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        self.record("cleanup");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        if self.healthy.load(Ordering::SeqCst) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy("upstream unreachable".into())
        }
    }
}

#[derive(Default)]
struct RecordingHooks {
    calls: Mutex<Vec<String>>,
}

impl RecordingHooks {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PluginHooks for RecordingHooks {
    async fn on_initialized(&self, plugin: &str, jobs: Vec<JobRegistration>) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("initialized:{}:{}", plugin, jobs.len()));
    }

    async fn on_stopping(&self, plugin: &str, _grace: Duration) {
        self.calls.lock().unwrap().push(format!("stopping:{}", plugin));
    }

    async fn on_stopped(&self, plugin: &str, retain_jobs: bool) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("stopped:{}:{}", plugin, retain_jobs));
    }
}

struct Harness {
    manager: LifecycleManager,
    hooks: Arc<RecordingHooks>,
    bus: EventBus,
    store: Arc<JobStore>,
}

async fn harness(config: PluginPolicyConfig) -> Harness {
    let bus = EventBus::new();
    let store = Arc::new(JobStore::in_memory().await.unwrap());
    let hooks = Arc::new(RecordingHooks::default());
    let weak: std::sync::Weak<dyn PluginHooks> = Arc::downgrade(&(hooks.clone() as Arc<dyn PluginHooks>));
    let manager = LifecycleManager::new(config, bus.clone(), store.clone(), PluginStateView::new(), weak);
    Harness {
        manager,
        hooks,
        bus,
        store,
    }
}

fn descriptor(name: &str, version: (u64, u64, u64)) -> PluginDescriptor {
    PluginDescriptor::new(name, Version::new(version.0, version.1, version.2))
}

fn fast_health(threshold: u32) -> PluginPolicyConfig {
    PluginPolicyConfig {
        health_check_interval_ms: 10,
        failure_threshold: threshold,
        stop_grace_ms: 50,
        auto_restart: AutoRestartConfig::default(),
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Arc<Event>>) -> Arc<Event> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_state(manager: &LifecycleManager, name: &str, state: PluginState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.status(name) != Some(state) {
        assert!(
            Instant::now() < deadline,
            "{} stuck in {:?}, expected {:?}",
            name,
            manager.status(name),
            state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_start_walks_state_machine_and_publishes() {
    let h = harness(PluginPolicyConfig::default()).await;
    let (_sub, mut events) = h.bus.subscribe_channel("plugin_*");
    let plugin = TestPlugin::new(descriptor("scanner", (1, 2, 0)));

    h.manager.load(plugin.clone()).await.unwrap();
    assert_eq!(h.manager.status("scanner"), Some(PluginState::Loaded));
    h.manager.start("scanner").await.unwrap();
    assert_eq!(h.manager.status("scanner"), Some(PluginState::Running));

    let loaded = next_event(&mut events).await;
    assert_eq!(loaded.topic, topics::PLUGIN_LOADED);
    assert_eq!(loaded.payload["plugin"], "scanner");
    assert_eq!(loaded.payload["version"], "1.2.0");
    assert_eq!(next_event(&mut events).await.topic, topics::PLUGIN_STARTED);

    assert_eq!(plugin.calls(), vec!["initialize", "start"]);
    assert_eq!(h.hooks.calls(), vec!["initialized:scanner:0"]);

    let status = h.manager.instance("scanner").unwrap();
    assert!(status.started_at.is_some());
    assert!(status.last_error.is_none());

    let records = h.store.list_plugins().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, PluginState::Running);
}

#[tokio::test]
async fn test_duplicate_load_is_rejected() {
    let h = harness(PluginPolicyConfig::default()).await;
    h.manager.load(TestPlugin::new(descriptor("scanner", (1, 0, 0)))).await.unwrap();

    let err = h
        .manager
        .load(TestPlugin::new(descriptor("scanner", (2, 0, 0))))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::AlreadyLoaded(name) if name == "scanner"));
    assert_eq!(h.manager.instance("scanner").unwrap().descriptor.version, Version::new(1, 0, 0));
}

#[tokio::test]
async fn test_incompatible_host_is_not_loaded() {
    let h = harness(PluginPolicyConfig::default()).await;
    let plugin = TestPlugin::new(
        descriptor("future", (1, 0, 0)).with_min_host_version(Version::new(999, 0, 0)),
    );

    let err = h.manager.load(plugin).await.unwrap_err();
    assert!(matches!(err, LifecycleError::IncompatibleHost { .. }));
    assert!(!h.manager.contains("future"));
}

#[tokio::test]
async fn test_start_requires_running_dependencies() {
    let h = harness(PluginPolicyConfig::default()).await;
    let storage = TestPlugin::new(descriptor("storage", (2, 0, 0)));
    let backup = TestPlugin::new(
        descriptor("backup", (1, 0, 0)).depends_on("storage", semver::VersionReq::parse("^2").unwrap()),
    );
    h.manager.load(storage).await.unwrap();
    h.manager.load(backup.clone()).await.unwrap();

    let err = h.manager.start("backup").await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::DependencyNotRunning { ref dependency, .. } if dependency == "storage"
    ));
    assert_eq!(h.manager.status("backup"), Some(PluginState::Loaded));
    assert!(backup.calls().is_empty());

    h.manager.start("storage").await.unwrap();
    h.manager.start("backup").await.unwrap();
    assert_eq!(h.manager.status("backup"), Some(PluginState::Running));
}

#[tokio::test]
async fn test_start_failure_moves_to_failed() {
    let h = harness(PluginPolicyConfig::default()).await;
    let (_sub, mut failures) = h.bus.subscribe_channel(topics::PLUGIN_FAILED);
    let plugin = TestPlugin::failing(descriptor("scanner", (1, 0, 0)));
    h.manager.load(plugin.clone()).await.unwrap();

    let err = h.manager.start("scanner").await.unwrap_err();
    assert!(matches!(err, LifecycleError::HookFailed { phase: "start", .. }));
    assert_eq!(h.manager.status("scanner"), Some(PluginState::Failed));
    assert_eq!(plugin.calls(), vec!["initialize", "start", "cleanup"]);

    let event = next_event(&mut failures).await;
    assert_eq!(event.payload["phase"], "start");
    assert_eq!(event.payload["error"], "port already in use");
    let status = h.manager.instance("scanner").unwrap();
    assert_eq!(status.last_error.as_deref(), Some("start: port already in use"));
    assert_eq!(h.bus.subscriber_count(), 1, "only the test's own subscription remains");

    plugin.fail_start.store(false, Ordering::SeqCst);
    h.manager.start("scanner").await.unwrap();
    assert_eq!(h.manager.status("scanner"), Some(PluginState::Running));
    assert!(h.manager.instance("scanner").unwrap().last_error.is_none());
}

#[tokio::test]
async fn test_stop_drains_and_releases_subscriptions() {
    let h = harness(PluginPolicyConfig::default()).await;
    let plugin = TestPlugin::new(descriptor("scanner", (1, 0, 0)));
    h.manager.load(plugin.clone()).await.unwrap();
    h.manager.start("scanner").await.unwrap();
    assert_eq!(h.bus.subscriber_count(), 1);

    h.manager.stop("scanner").await.unwrap();

    assert_eq!(h.manager.status("scanner"), Some(PluginState::Stopped));
    assert_eq!(h.bus.subscriber_count(), 0);
    assert_eq!(plugin.calls(), vec!["initialize", "start", "stop", "cleanup"]);
    assert_eq!(
        h.hooks.calls(),
        vec!["initialized:scanner:0", "stopping:scanner", "stopped:scanner:false"]
    );
}

#[tokio::test]
async fn test_stop_outside_running_is_invalid() {
    let h = harness(PluginPolicyConfig::default()).await;
    h.manager.load(TestPlugin::new(descriptor("scanner", (1, 0, 0)))).await.unwrap();

    let err = h.manager.stop("scanner").await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::InvalidTransition { from: PluginState::Loaded, action: "stop", .. }
    ));
    assert!(matches!(
        h.manager.stop("missing").await.unwrap_err(),
        LifecycleError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_reload_restarts_and_keeps_jobs() {
    let h = harness(PluginPolicyConfig::default()).await;
    let (_sub, mut events) = h.bus.subscribe_channel("plugin_*");
    let plugin = TestPlugin::new(descriptor("scanner", (1, 0, 0)));
    h.manager.load(plugin.clone()).await.unwrap();
    h.manager.start("scanner").await.unwrap();

    h.manager.reload("scanner").await.unwrap();

    assert_eq!(h.manager.status("scanner"), Some(PluginState::Running));
    assert_eq!(
        plugin.calls(),
        vec!["initialize", "start", "stop", "cleanup", "initialize", "start"]
    );
    assert!(h.hooks.calls().contains(&"stopped:scanner:true".to_string()));

    let mut topics_seen = Vec::new();
    for _ in 0..5 {
        topics_seen.push(next_event(&mut events).await.topic.clone());
    }
    assert_eq!(
        topics_seen,
        vec![
            topics::PLUGIN_LOADED,
            topics::PLUGIN_STARTED,
            topics::PLUGIN_STOPPED,
            topics::PLUGIN_LOADED,
            topics::PLUGIN_STARTED,
        ]
    );
}

#[tokio::test]
async fn test_health_failures_move_to_failed() {
    let h = harness(fast_health(3)).await;
    let (_sub, mut failures) = h.bus.subscribe_channel(topics::PLUGIN_FAILED);
    let plugin = TestPlugin::new(descriptor("scanner", (1, 0, 0)));
    h.manager.load(plugin.clone()).await.unwrap();
    h.manager.start("scanner").await.unwrap();

    plugin.healthy.store(false, Ordering::SeqCst);
    wait_for_state(&h.manager, "scanner", PluginState::Failed).await;

    let event = next_event(&mut failures).await;
    assert_eq!(event.payload["phase"], "health_check");
    let status = h.manager.instance("scanner").unwrap();
    assert!(status.health.consecutive_failures >= 3);
    assert!(h.hooks.calls().contains(&"stopping:scanner".to_string()));
    assert_eq!(plugin.starts.load(Ordering::SeqCst), 1, "no restart without auto_restart");
}

#[tokio::test]
async fn test_auto_restart_recovers_failed_plugin() {
    let mut config = fast_health(2);
    config.auto_restart = AutoRestartConfig {
        enabled: true,
        max_restarts: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 20,
        multiplier: 2.0,
    };
    let h = harness(config).await;
    let plugin = TestPlugin::new(descriptor("scanner", (1, 0, 0)));
    h.manager.load(plugin.clone()).await.unwrap();
    h.manager.start("scanner").await.unwrap();

    plugin.healthy.store(false, Ordering::SeqCst);
    wait_for_state(&h.manager, "scanner", PluginState::Failed).await;
    plugin.healthy.store(true, Ordering::SeqCst);
    wait_for_state(&h.manager, "scanner", PluginState::Running).await;

    let status = h.manager.instance("scanner").unwrap();
    assert!(status.restart_count >= 1);
    assert!(plugin.starts.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_replace_rolls_back_when_new_instance_fails() {
    let h = harness(PluginPolicyConfig::default()).await;
    let old = TestPlugin::new(descriptor("scanner", (1, 0, 0)));
    h.manager.load(old.clone()).await.unwrap();
    h.manager.start("scanner").await.unwrap();

    let broken = TestPlugin::failing(descriptor("scanner", (2, 0, 0)));
    let err = h.manager.replace(broken.clone()).await.unwrap_err();

    assert!(matches!(err, Error::Lifecycle(LifecycleError::HookFailed { .. })));
    assert_eq!(broken.starts.load(Ordering::SeqCst), 1);
    assert_eq!(h.manager.status("scanner"), Some(PluginState::Running));
    let status = h.manager.instance("scanner").unwrap();
    assert_eq!(status.descriptor.version, Version::new(1, 0, 0));
    assert_eq!(old.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_replace_swaps_running_instance() {
    let h = harness(PluginPolicyConfig::default()).await;
    let old = TestPlugin::new(descriptor("scanner", (1, 0, 0)));
    h.manager.load(old.clone()).await.unwrap();
    h.manager.start("scanner").await.unwrap();

    let upgraded = TestPlugin::new(descriptor("scanner", (1, 1, 0)));
    h.manager.replace(upgraded.clone()).await.unwrap();

    assert_eq!(h.manager.status("scanner"), Some(PluginState::Running));
    assert_eq!(h.manager.instance("scanner").unwrap().descriptor.version, Version::new(1, 1, 0));
    assert_eq!(old.calls(), vec!["initialize", "start", "stop", "cleanup"]);
    assert_eq!(upgraded.calls(), vec!["initialize", "start"]);
}

#[tokio::test]
async fn test_replace_checks_running_dependents() {
    let h = harness(PluginPolicyConfig::default()).await;
    h.manager.load(TestPlugin::new(descriptor("storage", (2, 0, 0)))).await.unwrap();
    h.manager
        .load(TestPlugin::new(
            descriptor("backup", (1, 0, 0)).depends_on("storage", semver::VersionReq::parse("^2").unwrap()),
        ))
        .await
        .unwrap();
    h.manager.start("storage").await.unwrap();
    h.manager.start("backup").await.unwrap();

    let err = h
        .manager
        .replace(TestPlugin::new(descriptor("storage", (3, 0, 0))))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Dependency(DependencyError::VersionMismatch { .. })));
    assert_eq!(h.manager.instance("storage").unwrap().descriptor.version, Version::new(2, 0, 0));
    assert_eq!(h.manager.status("storage"), Some(PluginState::Running));
}

#[tokio::test]
async fn test_shutdown_all_stops_in_reverse_order() {
    let h = harness(PluginPolicyConfig::default()).await;
    for name in ["alpha", "beta"] {
        h.manager.load(TestPlugin::new(descriptor(name, (1, 0, 0)))).await.unwrap();
        h.manager.start(name).await.unwrap();
    }

    h.manager
        .shutdown_all(&["alpha".to_string(), "beta".to_string()])
        .await;

    assert_eq!(h.manager.status("alpha"), Some(PluginState::Stopped));
    assert_eq!(h.manager.status("beta"), Some(PluginState::Stopped));
    let stops: Vec<String> = h
        .hooks
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("stopped:"))
        .collect();
    assert_eq!(stops, vec!["stopped:beta:true", "stopped:alpha:true"]);
}

#[tokio::test]
async fn test_health_failure_stops_and_cleans_up_instance() {
    let h = harness(fast_health(1)).await;
    let plugin = TestPlugin::new(descriptor("scanner", (1, 0, 0)));
    h.manager.load(plugin.clone()).await.unwrap();
    h.manager.start("scanner").await.unwrap();

    plugin.healthy.store(false, Ordering::SeqCst);
    wait_until("stop and cleanup", || plugin.calls().len() == 4).await;

    assert_eq!(plugin.calls(), vec!["initialize", "start", "stop", "cleanup"]);
    assert_eq!(h.manager.status("scanner"), Some(PluginState::Failed));
    assert_eq!(h.bus.subscriber_count(), 0);
}

#[tokio::test]
async fn test_restart_limit_leaves_plugin_failed() {
    let mut config = fast_health(1);
    config.auto_restart = AutoRestartConfig {
        enabled: true,
        max_restarts: 2,
        initial_backoff_ms: 10,
        max_backoff_ms: 20,
        multiplier: 2.0,
    };
    let h = harness(config).await;
    let plugin = TestPlugin::new(descriptor("scanner", (1, 0, 0)));
    plugin.healthy.store(false, Ordering::SeqCst);
    h.manager.load(plugin.clone()).await.unwrap();
    h.manager.start("scanner").await.unwrap();

    wait_until("three wound-down instances", || plugin.calls().len() == 12).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(plugin.starts.load(Ordering::SeqCst), 3);
    assert_eq!(h.manager.status("scanner"), Some(PluginState::Failed));
    assert_eq!(h.manager.instance("scanner").unwrap().restart_count, 2);
    let cycle = ["initialize", "start", "stop", "cleanup"];
    assert_eq!(plugin.calls(), cycle.repeat(3));

    plugin.healthy.store(true, Ordering::SeqCst);
    h.manager.start("scanner").await.unwrap();
    assert_eq!(h.manager.status("scanner"), Some(PluginState::Running));
    assert_eq!(h.manager.instance("scanner").unwrap().restart_count, 0);
}

#[tokio::test]
async fn test_unload_stops_and_forgets_plugin() {
    let h = harness(PluginPolicyConfig::default()).await;
    let (_sub, mut unloaded) = h.bus.subscribe_channel(topics::PLUGIN_UNLOADED);
    let plugin = TestPlugin::new(descriptor("scanner", (1, 0, 0)));
    h.manager.load(plugin.clone()).await.unwrap();
    h.manager.start("scanner").await.unwrap();

    h.manager.unload("scanner").await.unwrap();

    assert!(!h.manager.contains("scanner"));
    assert_eq!(h.manager.status("scanner"), None);
    assert_eq!(plugin.calls(), vec!["initialize", "start", "stop", "cleanup"]);
    assert!(h.hooks.calls().contains(&"stopped:scanner:false".to_string()));
    assert_eq!(h.bus.subscriber_count(), 1, "only the test's own subscription remains");
    assert!(h.store.list_plugins().await.unwrap().is_empty());

    let event = next_event(&mut unloaded).await;
    assert_eq!(event.payload["plugin"], "scanner");
    assert_eq!(event.payload["version"], "1.0.0");

    h.manager.load(TestPlugin::new(descriptor("scanner", (2, 0, 0)))).await.unwrap();
    assert_eq!(h.manager.status("scanner"), Some(PluginState::Loaded));
    assert!(matches!(
        h.manager.unload("missing").await.unwrap_err(),
        LifecycleError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_unload_refused_while_dependents_run() {
    let h = harness(PluginPolicyConfig::default()).await;
    h.manager.load(TestPlugin::new(descriptor("storage", (2, 0, 0)))).await.unwrap();
    h.manager
        .load(TestPlugin::new(
            descriptor("backup", (1, 0, 0)).depends_on("storage", semver::VersionReq::parse("^2").unwrap()),
        ))
        .await
        .unwrap();
    h.manager.start("storage").await.unwrap();
    h.manager.start("backup").await.unwrap();

    let err = h.manager.unload("storage").await.unwrap_err();
    assert_eq!(
        err,
        LifecycleError::InUse {
            name: "storage".into(),
            dependents: vec!["backup".into()],
        }
    );
    assert_eq!(h.manager.status("storage"), Some(PluginState::Running));

    h.manager.stop("backup").await.unwrap();
    h.manager.unload("storage").await.unwrap();
    assert!(!h.manager.contains("storage"));
}

#[tokio::test]
async fn test_unload_loaded_plugin_skips_hooks() {
    let h = harness(PluginPolicyConfig::default()).await;
    let plugin = TestPlugin::new(descriptor("scanner", (1, 0, 0)));
    h.manager.load(plugin.clone()).await.unwrap();

    h.manager.unload("scanner").await.unwrap();

    assert!(plugin.calls().is_empty());
    assert_eq!(h.hooks.calls(), vec!["stopped:scanner:false"]);
    assert!(h.manager.list().is_empty());
}
