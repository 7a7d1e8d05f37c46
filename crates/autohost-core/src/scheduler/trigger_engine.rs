//! Trigger engine
//!
//! A single loop sleeps until the nearest time-based deadline (min-heap with
//! lazy deletion) and re-evaluates whenever registrations change. Event
//! triggers are bus subscriptions that emit due signals synchronously. The
//! engine never runs a job; it only sends [`DueSignal`]s to the executor.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{JobStore, StoreResult};
use super::triggers::TriggerType;
use super::types::{DueSignal, DueSource, JobDefinition, TriggerState};
use crate::event_bus::{handler_fn, Event, EventBus, Subscription};

/// Longest sleep without a deadline; bounds the effect of wall-clock jumps
const IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    due: DateTime<Utc>,
    generation: u64,
    job_id: String,
}

struct TriggerEntry {
    trigger: TriggerType,
    enabled: bool,
    generation: u64,
    state: TriggerState,
    subscription: Option<Subscription>,
}

struct EngineInner {
    store: Arc<JobStore>,
    bus: EventBus,
    due_tx: mpsc::UnboundedSender<DueSignal>,
    entries: DashMap<String, TriggerEntry>,
    // Lock order: an `entries` guard may be held while locking `heap`, never the reverse
    heap: Mutex<BinaryHeap<Reverse<Deadline>>>,
    generation: AtomicU64,
    wake: Notify,
}

/// Evaluates triggers and produces due signals
#[derive(Clone)]
pub struct TriggerEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for TriggerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerEngine")
            .field("registered", &self.inner.entries.len())
            .finish()
    }
}

impl TriggerEngine {
    /// Create an engine sending due signals on `due_tx`
    pub fn new(store: Arc<JobStore>, bus: EventBus, due_tx: mpsc::UnboundedSender<DueSignal>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                bus,
                due_tx,
                entries: DashMap::new(),
                heap: Mutex::new(BinaryHeap::new()),
                generation: AtomicU64::new(1),
                wake: Notify::new(),
            }),
        }
    }

    /// Register a job's trigger, resuming from persisted trigger state.
    ///
    /// Missed interval or cron slots are skipped; a one-shot that already
    /// fired stays retired.
    pub async fn register(&self, job: &JobDefinition) -> StoreResult<()> {
        let persisted = self.inner.store.get_trigger_state(&job.id).await?;
        self.install(job, persisted, true).await
    }

    /// Re-register after the trigger specification changed, ignoring any
    /// persisted due time
    pub async fn reschedule(&self, job: &JobDefinition) -> StoreResult<()> {
        let previous = match self.state(&job.id) {
            Some(state) => Some(state),
            None => self.inner.store.get_trigger_state(&job.id).await?,
        };
        let carried = previous.map(|p| TriggerState {
            next_due: None,
            subscription: None,
            ..p
        });
        self.install(job, carried, false).await
    }

    async fn install(
        &self,
        job: &JobDefinition,
        persisted: Option<TriggerState>,
        restore: bool,
    ) -> StoreResult<()> {
        self.unregister(&job.id);

        let now = Utc::now();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = persisted.unwrap_or_else(|| TriggerState::new(&job.id));
        let mut subscription = None;

        match &job.trigger {
            TriggerType::Event(event) => {
                let weak = Arc::downgrade(&self.inner);
                let job_id = job.id.clone();
                let sub = self.inner.bus.subscribe(
                    event.pattern(),
                    handler_fn(move |event| {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_event(&job_id, generation, event);
                        }
                        Ok(())
                    }),
                );
                state.next_due = None;
                state.subscription = Some(format!("{}:{}", sub.pattern(), sub.id()));
                subscription = Some(sub);
            }
            TriggerType::OneShot(_) if restore && state.fire_count > 0 => {
                debug!(job_id = %job.id, "One-shot trigger already fired, not rescheduling");
                state.next_due = None;
                state.subscription = None;
                self.inner.store.save_trigger_state(&state).await?;
                return Ok(());
            }
            trigger => {
                state.next_due = if restore {
                    state
                        .next_due
                        .and_then(|persisted| trigger.resume_from(persisted, now))
                        .or_else(|| trigger.first_due(now))
                } else {
                    trigger.first_due(now)
                };
                state.subscription = None;
            }
        }

        debug!(
            job_id = %job.id,
            kind = job.trigger.kind(),
            next_due = ?state.next_due,
            "Trigger registered"
        );

        self.inner.entries.insert(
            job.id.clone(),
            TriggerEntry {
                trigger: job.trigger.clone(),
                enabled: job.enabled,
                generation,
                state: state.clone(),
                subscription,
            },
        );
        // Entry first: the loop discards deadlines without a matching entry
        if let Some(due) = state.next_due {
            self.inner.push(due, generation, &job.id);
        }
        self.inner.wake.notify_one();
        self.inner.store.save_trigger_state(&state).await
    }

    /// Remove a job's trigger. Persisted trigger state is left in place.
    pub fn unregister(&self, job_id: &str) -> bool {
        let Some((_, entry)) = self.inner.entries.remove(job_id) else {
            return false;
        };
        if let Some(sub) = &entry.subscription {
            self.inner.bus.unsubscribe(sub);
        }
        self.inner.wake.notify_one();
        debug!(job_id, "Trigger unregistered");
        true
    }

    /// Suppress or resume due signals without touching the schedule.
    ///
    /// Re-enabling a one-shot that never fired arms it to fire now.
    pub fn set_enabled(&self, job_id: &str, enabled: bool) -> bool {
        let Some(mut entry) = self.inner.entries.get_mut(job_id) else {
            return false;
        };
        entry.enabled = enabled;
        // A registered one-shot without a due time was skipped while disabled
        if enabled
            && matches!(entry.trigger, TriggerType::OneShot(_))
            && entry.state.next_due.is_none()
        {
            let now = Utc::now();
            entry.state.next_due = Some(now);
            self.inner.push(now, entry.generation, job_id);
        }
        drop(entry);
        self.inner.wake.notify_one();
        true
    }

    /// Current trigger state of a registered job
    #[must_use]
    pub fn state(&self, job_id: &str) -> Option<TriggerState> {
        self.inner.entries.get(job_id).map(|e| e.state.clone())
    }

    /// Ids of registered jobs
    #[must_use]
    pub fn registered(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Run the timer loop until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Trigger engine starting");

        loop {
            let wait = self.inner.next_wait(Utc::now());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.wake.notified() => continue,
                _ = tokio::time::sleep(wait) => {}
            }
            self.inner.fire_due(Utc::now()).await;
        }

        info!("Trigger engine stopped");
    }
}

impl EngineInner {
    fn push(&self, due: DateTime<Utc>, generation: u64, job_id: &str) {
        if let Ok(mut heap) = self.heap.lock() {
            heap.push(Reverse(Deadline {
                due,
                generation,
                job_id: job_id.to_string(),
            }));
        }
    }

    fn next_wait(&self, now: DateTime<Utc>) -> Duration {
        let next = self
            .heap
            .lock()
            .ok()
            .and_then(|heap| heap.peek().map(|Reverse(d)| d.due));
        match next {
            Some(due) => (due - now).to_std().unwrap_or(Duration::ZERO).min(IDLE_WAIT),
            None => IDLE_WAIT,
        }
    }

    fn pop_due(&self, now: DateTime<Utc>) -> Option<Deadline> {
        let mut heap = self.heap.lock().ok()?;
        match heap.peek() {
            Some(Reverse(d)) if d.due <= now => heap.pop().map(|Reverse(d)| d),
            _ => None,
        }
    }

    async fn fire_due(&self, now: DateTime<Utc>) {
        let mut changed = Vec::new();

        while let Some(deadline) = self.pop_due(now) {
            let Some(mut entry) = self.entries.get_mut(&deadline.job_id) else {
                continue;
            };
            if entry.generation != deadline.generation {
                continue;
            }

            let next = entry.trigger.next_after(deadline.due, now);
            entry.state.next_due = next;

            let fired = entry.enabled;
            if fired {
                entry.state.last_fired = Some(now);
                entry.state.fire_count += 1;
                let signal = DueSignal {
                    job_id: deadline.job_id.clone(),
                    scheduled_at: deadline.due,
                    source: DueSource::Timer,
                    payload: None,
                    deferrals: 0,
                };
                if self.due_tx.send(signal).is_err() {
                    warn!(job_id = %deadline.job_id, "Due signal dropped: executor is gone");
                }
                debug!(job_id = %deadline.job_id, scheduled = %deadline.due, "Trigger fired");
            } else {
                debug!(job_id = %deadline.job_id, "Job disabled, advancing schedule only");
            }

            if let Some(due) = next {
                self.push(due, entry.generation, &deadline.job_id);
            }
            let retired = next.is_none() && fired;
            changed.push(entry.state.clone());
            drop(entry);

            if retired {
                self.entries.remove(&deadline.job_id);
                info!(job_id = %deadline.job_id, "One-shot trigger fired, unregistered");
            }
        }

        for state in changed {
            if let Err(e) = self.store.save_trigger_state(&state).await {
                warn!(job_id = %state.job_id, error = %e, "Failed to persist trigger state");
            }
        }
    }

    fn on_event(&self, job_id: &str, generation: u64, event: &Event) {
        let Some(mut entry) = self.entries.get_mut(job_id) else {
            return;
        };
        if entry.generation != generation || !entry.enabled {
            return;
        }
        let TriggerType::Event(trigger) = &entry.trigger else {
            return;
        };
        if !trigger.accepts(&event.payload) {
            debug!(job_id, topic = %event.topic, "Event did not match trigger predicate");
            return;
        }

        let now = Utc::now();
        entry.state.last_fired = Some(now);
        entry.state.fire_count += 1;
        let state = entry.state.clone();
        drop(entry);

        let signal = DueSignal {
            job_id: job_id.to_string(),
            scheduled_at: now,
            source: DueSource::Event,
            payload: Some(event.payload.clone()),
            deferrals: 0,
        };
        if self.due_tx.send(signal).is_err() {
            warn!(job_id, "Due signal dropped: executor is gone");
            return;
        }
        debug!(job_id, topic = %event.topic, "Event trigger fired");

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save_trigger_state(&state).await {
                warn!(job_id = %state.job_id, error = %e, "Failed to persist trigger state");
            }
        });
    }
}
