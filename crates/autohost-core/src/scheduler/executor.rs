//! Job executor
//!
//! Consumes due signals, runs the admission checks and dispatches admitted
//! invocations onto a bounded worker pool:
//!
//! 1. job enabled, otherwise the signal is dropped
//! 2. owning plugin `Running`, otherwise the signal is re-queued with backoff
//! 3. every dependency has a fresh successful run, otherwise `skipped`
//! 4. per-job concurrency below the limit, otherwise `skipped` (time-based)
//!    or held in a bounded per-job backlog (event-based)
//!
//! Admitted invocations wait in a bounded queue for a worker; when the queue
//! is full the oldest invocation is dropped and `queue_overflow` published.
//! Per-run failures are retried or recorded here and never leave the loop.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::store::{JobStore, StoreResult};
use super::types::{
    DueSignal, DueSource, JobDefinition, JobRegistration, JobRun, RunOutcome, UnitOfWork,
    WorkContext,
};
use crate::config::HostConfig;
use crate::error::{ExecutionError, SkipReason};
use crate::event_bus::{topics, EventBus};
use crate::plugin::PluginStateView;

/// How long shutdown waits for cancelled runs to record their outcome
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

struct JobSlot {
    definition: JobDefinition,
    work: UnitOfWork,
    // Admitted and not yet released, queued invocations included
    in_flight: usize,
    backlog: VecDeque<DueSignal>,
}

struct Invocation {
    job_id: String,
    plugin: String,
    cancel: CancellationToken,
}

struct Pending {
    invocation_id: Uuid,
    signal: DueSignal,
}

enum Admission {
    Admitted(Pending),
    PluginNotRunning(DueSignal),
    AtLimit,
    Backlogged,
    UnknownJob,
}

enum Interrupted {
    TimedOut,
    Cancelled,
}

struct ExecutorInner {
    config: HostConfig,
    store: Arc<JobStore>,
    bus: EventBus,
    plugins: PluginStateView,
    due_tx: mpsc::UnboundedSender<DueSignal>,
    jobs: DashMap<String, JobSlot>,
    invocations: DashMap<Uuid, Invocation>,
    // run id -> invocation id, for attempts currently executing
    runs: DashMap<Uuid, Uuid>,
    pending: Mutex<VecDeque<Pending>>,
    queued: Notify,
    released: Notify,
    workers: Arc<Semaphore>,
}

/// Runs due jobs under admission, concurrency, timeout and retry policy
#[derive(Clone)]
pub struct JobExecutor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("jobs", &self.inner.jobs.len())
            .field("invocations", &self.inner.invocations.len())
            .finish()
    }
}

impl JobExecutor {
    /// Create an executor. `due_tx` must feed the receiver later passed to
    /// [`run`](Self::run); deferred signals are re-sent on it.
    pub fn new(
        config: HostConfig,
        store: Arc<JobStore>,
        bus: EventBus,
        plugins: PluginStateView,
        due_tx: mpsc::UnboundedSender<DueSignal>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            inner: Arc::new(ExecutorInner {
                config,
                store,
                bus,
                plugins,
                due_tx,
                jobs: DashMap::new(),
                invocations: DashMap::new(),
                runs: DashMap::new(),
                pending: Mutex::new(VecDeque::new()),
                queued: Notify::new(),
                released: Notify::new(),
                workers,
            }),
        }
    }

    /// Sender for due signals
    #[must_use]
    pub fn due_sender(&self) -> mpsc::UnboundedSender<DueSignal> {
        self.inner.due_tx.clone()
    }

    /// Add or replace a job. In-flight counts survive replacement.
    pub fn register(&self, registration: JobRegistration) {
        let JobRegistration { definition, work } = registration;
        debug!(job_id = %definition.id, plugin = %definition.plugin, "Job registered with executor");
        match self.inner.jobs.entry(definition.id.clone()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                slot.definition = definition;
                slot.work = work;
            }
            Entry::Vacant(entry) => {
                entry.insert(JobSlot {
                    definition,
                    work,
                    in_flight: 0,
                    backlog: VecDeque::new(),
                });
            }
        }
    }

    /// Remove a job and cancel its outstanding invocations
    pub fn unregister(&self, job_id: &str) -> Option<JobDefinition> {
        let (_, slot) = self.inner.jobs.remove(job_id)?;
        let cancelled = self.inner.cancel_where(|inv| inv.job_id == job_id);
        debug!(job_id, cancelled, "Job removed from executor");
        Some(slot.definition)
    }

    /// Replace a job's definition, keeping its unit of work
    pub fn update_definition(&self, definition: JobDefinition) -> bool {
        match self.inner.jobs.get_mut(&definition.id) {
            Some(mut slot) => {
                slot.definition = definition;
                true
            }
            None => false,
        }
    }

    /// Enable or disable a job
    pub fn set_enabled(&self, job_id: &str, enabled: bool) -> bool {
        match self.inner.jobs.get_mut(job_id) {
            Some(mut slot) => {
                slot.definition.enabled = enabled;
                slot.definition.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Current definition of a job
    #[must_use]
    pub fn definition(&self, job_id: &str) -> Option<JobDefinition> {
        self.inner.jobs.get(job_id).map(|slot| slot.definition.clone())
    }

    /// Every registered job, by id
    #[must_use]
    pub fn jobs(&self) -> Vec<JobDefinition> {
        let mut jobs: Vec<JobDefinition> = self
            .inner
            .jobs
            .iter()
            .map(|slot| slot.definition.clone())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    /// Ids of jobs owned by `plugin`
    #[must_use]
    pub fn jobs_for(&self, plugin: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .jobs
            .iter()
            .filter(|slot| slot.definition.plugin == plugin)
            .map(|slot| slot.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Admitted invocations of a job that have not finished
    #[must_use]
    pub fn in_flight(&self, job_id: &str) -> usize {
        self.inner.jobs.get(job_id).map_or(0, |slot| slot.in_flight)
    }

    /// Invocations waiting for a worker
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// Send a manual due signal. It still goes through admission.
    pub fn run_now(&self, job_id: &str, payload: Option<Value>) -> bool {
        if !self.inner.jobs.contains_key(job_id) {
            return false;
        }
        let mut signal = DueSignal::new(job_id, DueSource::Manual);
        signal.payload = payload;
        self.inner.due_tx.send(signal).is_ok()
    }

    /// Cancel the invocation a running attempt belongs to
    pub fn cancel(&self, run_id: Uuid) -> bool {
        let Some(invocation_id) = self.inner.runs.get(&run_id).map(|id| *id) else {
            return false;
        };
        match self.inner.invocations.get(&invocation_id) {
            Some(invocation) => {
                info!(job_id = %invocation.job_id, %run_id, "Cancelling job run");
                invocation.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Full run history of a job, oldest first
    pub async fn history(&self, job_id: &str) -> StoreResult<Vec<JobRun>> {
        self.inner.store.list_runs(job_id).await
    }

    /// Wait for every invocation owned by `plugin` to finish, cancelling
    /// whatever is still running once `grace` has elapsed. Invocations still
    /// waiting for a worker are deferred instead. Returns how many were
    /// cancelled.
    ///
    /// Call after the plugin has left `Running` so nothing new is admitted.
    pub async fn drain_plugin(&self, plugin: &str, grace: Duration) -> usize {
        let inner = &self.inner;
        inner.requeue_pending(plugin).await;

        let deadline = Instant::now() + grace;
        let mut cancelled = None;
        loop {
            let released = inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let active = inner.active_for(plugin);
            if active == 0 {
                break;
            }
            if cancelled.is_none() && Instant::now() >= deadline {
                let count = inner.cancel_where(|inv| inv.plugin == plugin);
                warn!(plugin, cancelled = count, "Stop grace period elapsed, cancelling runs");
                cancelled = Some(count);
                continue;
            }
            debug!(plugin, active, "Waiting for in-flight runs");
            if cancelled.is_some() {
                released.await;
            } else {
                tokio::select! {
                    _ = &mut released => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
        }
        cancelled.unwrap_or(0)
    }

    /// Consume due signals until `shutdown` is cancelled
    pub async fn run(&self, mut due_rx: mpsc::UnboundedReceiver<DueSignal>, shutdown: CancellationToken) {
        info!(
            workers = self.inner.config.worker_pool_size,
            queue_capacity = self.inner.config.queue_capacity,
            "Job executor starting"
        );

        let feeder = tokio::spawn(self.inner.clone().feed(shutdown.clone()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = due_rx.recv() => match signal {
                    Some(signal) => self.inner.on_due(signal).await,
                    None => break,
                },
            }
        }

        feeder.abort();
        self.inner.shutdown().await;
        info!("Job executor stopped");
    }
}

impl ExecutorInner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn on_due(&self, signal: DueSignal) {
        let Some((plugin, enabled, dependencies)) = self.jobs.get(&signal.job_id).map(|slot| {
            let d = &slot.definition;
            (d.plugin.clone(), d.enabled, d.dependencies.clone())
        }) else {
            debug!(job_id = %signal.job_id, "Due signal for unknown job dropped");
            return;
        };

        if !enabled {
            debug!(job_id = %signal.job_id, source = ?signal.source, "Job disabled, due signal dropped");
            return;
        }

        if !self.plugins.is_running(&plugin) {
            self.defer(signal, &plugin).await;
            return;
        }

        for dependency in &dependencies {
            if !self.dependency_fresh(dependency).await {
                let reason = SkipReason::DependencyUnmet {
                    dependency: dependency.clone(),
                };
                self.record_skip(&signal.job_id, reason).await;
                return;
            }
        }

        let job_id = signal.job_id.clone();
        match self.admit(signal, &plugin) {
            Admission::Admitted(pending) => self.enqueue(pending),
            Admission::PluginNotRunning(signal) => self.defer(signal, &plugin).await,
            Admission::AtLimit => self.record_skip(&job_id, SkipReason::ConcurrencyLimit).await,
            Admission::Backlogged | Admission::UnknownJob => {}
        }
    }

    /// Concurrency check and registration, atomic with respect to plugin
    /// state changes
    fn admit(&self, signal: DueSignal, plugin: &str) -> Admission {
        let Some(_running) = self.plugins.running_guard(plugin) else {
            return Admission::PluginNotRunning(signal);
        };
        let Some(mut slot) = self.jobs.get_mut(&signal.job_id) else {
            return Admission::UnknownJob;
        };

        if slot.in_flight >= slot.definition.max_concurrent as usize {
            if signal.source != DueSource::Event {
                return Admission::AtLimit;
            }
            slot.backlog.push_back(signal);
            if slot.backlog.len() > self.config.event_queue_depth {
                if let Some(dropped) = slot.backlog.pop_front() {
                    warn!(
                        job_id = %dropped.job_id,
                        scheduled = %dropped.scheduled_at,
                        "Event backlog full, dropped oldest signal"
                    );
                }
            }
            debug!(
                job_id = %slot.definition.id,
                backlog = slot.backlog.len(),
                "Job at concurrency limit, event signal held"
            );
            return Admission::Backlogged;
        }

        slot.in_flight += 1;
        let invocation_id = Uuid::new_v4();
        self.invocations.insert(
            invocation_id,
            Invocation {
                job_id: signal.job_id.clone(),
                plugin: plugin.to_string(),
                cancel: CancellationToken::new(),
            },
        );
        debug!(job_id = %signal.job_id, %invocation_id, source = ?signal.source, "Invocation admitted");
        Admission::Admitted(Pending {
            invocation_id,
            signal,
        })
    }

    async fn defer(&self, mut signal: DueSignal, plugin: &str) {
        if signal.deferrals >= self.config.deferral.max_deferrals {
            info!(
                job_id = %signal.job_id,
                plugin,
                deferrals = signal.deferrals,
                "Owning plugin still unavailable"
            );
            self.record_skip(&signal.job_id, SkipReason::PluginUnavailable).await;
            return;
        }

        signal.deferrals += 1;
        let delay = self.config.deferral.policy().delay_for(signal.deferrals);
        debug!(
            job_id = %signal.job_id,
            plugin,
            deferrals = signal.deferrals,
            delay_ms = delay.as_millis() as u64,
            "Owning plugin not running, deferring"
        );
        let due_tx = self.due_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = due_tx.send(signal);
        });
    }

    async fn dependency_fresh(&self, dependency: &str) -> bool {
        let latest = match self.store.latest_finished_run(dependency).await {
            Ok(latest) => latest,
            Err(e) => {
                warn!(dependency, error = %e, "Failed to load dependency history");
                return false;
            }
        };
        let Some(run) = latest else {
            return false;
        };
        if run.outcome != RunOutcome::Success {
            return false;
        }

        let cutoff = chrono::Duration::from_std(self.config.dependency_freshness())
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window));
        match (run.finished_at, cutoff) {
            (Some(finished), Some(cutoff)) => finished >= cutoff,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    async fn record_skip(&self, job_id: &str, reason: SkipReason) {
        let run = JobRun::skipped(job_id, reason.clone());
        info!(job_id, reason = %reason, "Job skipped");
        if let Err(e) = self.store.insert_run(&run).await {
            error!(job_id, error = %e, "Failed to record skipped run");
        }
        self.bus.publish(
            topics::JOB_SKIPPED,
            json!({
                "job_id": job_id,
                "run_id": run.id,
                "reason": reason,
            }),
        );
    }

    fn enqueue(&self, pending: Pending) {
        let overflow = {
            let mut queue = self.lock_pending();
            queue.push_back(pending);
            if queue.len() > self.config.queue_capacity {
                queue.pop_front()
            } else {
                None
            }
        };
        self.queued.notify_one();

        if let Some(dropped) = overflow {
            let job_id = dropped.signal.job_id;
            warn!(
                job_id = %job_id,
                capacity = self.config.queue_capacity,
                "Due queue full, dropped oldest invocation"
            );
            self.release(&job_id, dropped.invocation_id);
            self.bus.publish(
                topics::QUEUE_OVERFLOW,
                json!({
                    "job_id": job_id,
                    "invocation_id": dropped.invocation_id,
                    "capacity": self.config.queue_capacity,
                }),
            );
        }
    }

    /// Hand queued invocations to workers as permits become free
    async fn feed(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let pending = loop {
                let next = self.lock_pending().pop_front();
                if next.is_some() {
                    break next;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break None,
                    _ = self.queued.notified() => {}
                }
            };
            let Some(pending) = pending else {
                break;
            };

            let inner = self.clone();
            tokio::spawn(async move {
                inner.execute(pending).await;
                drop(permit);
            });
        }
    }

    async fn execute(&self, pending: Pending) {
        let Pending {
            invocation_id,
            signal,
        } = pending;
        let job_id = signal.job_id.clone();

        let Some(cancel) = self.invocations.get(&invocation_id).map(|inv| inv.cancel.clone()) else {
            return;
        };
        if cancel.is_cancelled() {
            self.release(&job_id, invocation_id);
            return;
        }
        let Some((definition, work)) = self
            .jobs
            .get(&job_id)
            .map(|slot| (slot.definition.clone(), slot.work.clone()))
        else {
            debug!(job_id = %job_id, "Job removed while queued");
            self.release(&job_id, invocation_id);
            return;
        };

        let policy = definition
            .retry
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());
        let max_attempts = policy.max_attempts.max(1);
        let timeout = definition.timeout_or(self.config.default_timeout());

        let mut attempt = 1;
        let mut last_run: Option<JobRun> = None;
        loop {
            let Some(mut run) = self.begin_run(&definition, invocation_id, attempt) else {
                if attempt == 1 {
                    self.release(&job_id, invocation_id);
                    self.defer(signal, &definition.plugin).await;
                    return;
                }
                info!(job_id = %job_id, attempt, "Owning plugin stopped between attempts");
                if let Some(last) = &last_run {
                    self.publish_failed(last);
                }
                break;
            };

            if let Err(e) = self.store.insert_run(&run).await {
                error!(job_id = %job_id, run_id = %run.id, error = %e, "Failed to record run start");
            }
            self.bus.publish(
                topics::JOB_STARTED,
                json!({
                    "job_id": job_id,
                    "run_id": run.id,
                    "invocation_id": invocation_id,
                    "attempt": attempt,
                }),
            );
            info!(job_id = %job_id, run_id = %run.id, attempt, "Job run started");

            let ctx = WorkContext {
                job_id: job_id.clone(),
                run_id: run.id,
                invocation_id,
                attempt,
                payload: signal.payload.clone(),
                cancel: cancel.child_token(),
                bus: self.bus.clone(),
            };
            let (outcome, error, result) = run_attempt(&work, ctx, timeout, &cancel).await;
            run.finish(outcome, error, result);
            self.runs.remove(&run.id);
            if let Err(e) = self.store.finish_run(&run).await {
                error!(job_id = %job_id, run_id = %run.id, error = %e, "Failed to record run outcome");
            }

            match &run.outcome {
                RunOutcome::Success => {
                    info!(
                        job_id = %job_id,
                        run_id = %run.id,
                        attempt,
                        duration_ms = run.duration().map_or(0, |d| d.num_milliseconds()),
                        "Job run succeeded"
                    );
                    self.bus.publish(
                        topics::JOB_COMPLETED,
                        json!({
                            "job_id": job_id,
                            "run_id": run.id,
                            "invocation_id": invocation_id,
                            "attempt": attempt,
                            "result": run.result,
                        }),
                    );
                    break;
                }
                outcome if outcome.is_failure() && attempt < max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        job_id = %job_id,
                        run_id = %run.id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = run.error.as_deref().unwrap_or_default(),
                        "Job run failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(job_id = %job_id, "Invocation cancelled during retry backoff");
                            self.publish_failed(&run);
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                _ => {
                    warn!(
                        job_id = %job_id,
                        run_id = %run.id,
                        outcome = %run.outcome,
                        attempts = attempt,
                        error = run.error.as_deref().unwrap_or_default(),
                        "Job invocation failed"
                    );
                    self.publish_failed(&run);
                    break;
                }
            }
            last_run = Some(run);
        }

        self.release(&job_id, invocation_id);
    }

    /// Create the run record while holding the plugin's running guard, so no
    /// attempt starts once a stop has begun
    fn begin_run(&self, definition: &JobDefinition, invocation_id: Uuid, attempt: u32) -> Option<JobRun> {
        let _running = self.plugins.running_guard(&definition.plugin)?;
        let run = JobRun::start(&definition.id, invocation_id, attempt);
        self.runs.insert(run.id, invocation_id);
        Some(run)
    }

    fn publish_failed(&self, run: &JobRun) {
        self.bus.publish(
            topics::JOB_FAILED,
            json!({
                "job_id": run.job_id,
                "run_id": run.id,
                "invocation_id": run.invocation_id,
                "attempts": run.attempt,
                "outcome": run.outcome.as_str(),
                "error": run.error,
            }),
        );
    }

    /// Free an invocation's concurrency slot and re-admit one held event
    fn release(&self, job_id: &str, invocation_id: Uuid) {
        self.invocations.remove(&invocation_id);
        let next = match self.jobs.get_mut(job_id) {
            Some(mut slot) => {
                slot.in_flight = slot.in_flight.saturating_sub(1);
                slot.backlog.pop_front()
            }
            None => None,
        };
        self.released.notify_waiters();

        if let Some(signal) = next {
            let _ = self.due_tx.send(signal);
        }
    }

    fn active_for(&self, plugin: &str) -> usize {
        self.invocations.iter().filter(|inv| inv.plugin == plugin).count()
    }

    fn cancel_where(&self, matches: impl Fn(&Invocation) -> bool) -> usize {
        let mut count = 0;
        for invocation in self.invocations.iter() {
            if matches(&invocation) && !invocation.cancel.is_cancelled() {
                invocation.cancel.cancel();
                count += 1;
            }
        }
        count
    }

    /// Pull a plugin's queued invocations back out and defer them
    async fn requeue_pending(&self, plugin: &str) {
        let requeued: Vec<Pending> = {
            let mut queue = self.lock_pending();
            let mut kept = VecDeque::with_capacity(queue.len());
            let mut taken = Vec::new();
            for pending in queue.drain(..) {
                let owned = self
                    .invocations
                    .get(&pending.invocation_id)
                    .is_some_and(|inv| inv.plugin == plugin);
                if owned {
                    taken.push(pending);
                } else {
                    kept.push_back(pending);
                }
            }
            *queue = kept;
            taken
        };

        for pending in requeued {
            let job_id = pending.signal.job_id.clone();
            self.release(&job_id, pending.invocation_id);
            self.defer(pending.signal, plugin).await;
        }
    }

    async fn shutdown(&self) {
        let queued: Vec<Pending> = self.lock_pending().drain(..).collect();
        for pending in queued {
            self.release(&pending.signal.job_id, pending.invocation_id);
        }

        let cancelled = self.cancel_where(|_| true);
        if cancelled > 0 {
            info!(cancelled, "Cancelled in-flight runs for shutdown");
        }

        let deadline = Instant::now() + SHUTDOWN_WAIT;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.invocations.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                warn!(remaining = self.invocations.len(), "Runs still in flight at shutdown");
                break;
            }
        }
    }
}

/// Run one attempt under `timeout`, stopping early if `cancel` fires
async fn run_attempt(
    work: &UnitOfWork,
    ctx: WorkContext,
    timeout: Duration,
    cancel: &CancellationToken,
) -> (RunOutcome, Option<String>, Option<Value>) {
    let attempt_cancel = ctx.cancel.clone();
    let work = work.clone();
    let mut handle = tokio::spawn(async move { work(ctx).await });

    let interrupted = tokio::select! {
        joined = &mut handle => return settle(joined),
        _ = tokio::time::sleep(timeout) => Interrupted::TimedOut,
        _ = cancel.cancelled() => Interrupted::Cancelled,
    };

    // Cooperative signal first, then stop waiting regardless
    attempt_cancel.cancel();
    handle.abort();

    let (outcome, error) = match interrupted {
        Interrupted::TimedOut => (RunOutcome::Timeout, ExecutionError::Timeout(timeout)),
        Interrupted::Cancelled => (RunOutcome::Cancelled, ExecutionError::Cancelled),
    };
    (outcome, Some(error.to_string()), None)
}

fn settle(
    joined: Result<anyhow::Result<Value>, JoinError>,
) -> (RunOutcome, Option<String>, Option<Value>) {
    match joined {
        Ok(Ok(value)) => (RunOutcome::Success, None, Some(value)),
        Ok(Err(e)) => (
            RunOutcome::Failed,
            Some(ExecutionError::Failed(format!("{:#}", e)).to_string()),
            None,
        ),
        Err(e) if e.is_panic() => (
            RunOutcome::Failed,
            Some(ExecutionError::Panicked(panic_message(e.into_panic())).to_string()),
            None,
        ),
        Err(_) => (
            RunOutcome::Cancelled,
            Some(ExecutionError::Cancelled.to_string()),
            None,
        ),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(|| "unknown panic".to_string(), |s| (*s).to_string()),
    }
}

#[cfg(test)]
mod tests;
