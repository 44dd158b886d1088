//! The supervisor: registration, lifecycle commands and the dispatcher.

use crate::aggregate::{self, FleetSummary, Performer};
use crate::config::SupervisorConfig;
use crate::health::{self, HealthReport, HealthState, InstanceHealth, WorkerHealth};
use crate::instance::{Begin, Finish, Slot, StopOutcome};
use crate::registry::PayloadRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_budget::{BudgetEnforcer, Reservation};
use foreman_core::{
    AuditLog, Clock, ConfigError, DurationMs, EventObserver, InstanceId, InstanceSnapshot,
    LifecycleEvent, Observers, Outcome, Payload, PayloadError, StopCause, SupervisorError,
    SystemClock, WorkerControl, WorkerDefinition, WorkerId, WorkerSnapshot, WorkerStatus,
};
use rust_decimal::Decimal;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;

/// How long the dispatcher sleeps when nothing is scheduled. A schedule
/// call wakes it earlier.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// One runtime instance. Shares its worker's definition and payload.
struct Instance {
    id: InstanceId,
    definition: Arc<WorkerDefinition>,
    payload: Arc<dyn Payload>,
    slot: Mutex<Slot>,
}

impl Instance {
    fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            state: lock(&self.slot).state.clone(),
        }
    }
}

struct WorkerEntry {
    definition: Arc<WorkerDefinition>,
    payload: Arc<dyn Payload>,
    instances: Vec<Arc<Instance>>,
    retired: bool,
}

impl WorkerEntry {
    fn add_instance(&mut self) -> Arc<Instance> {
        let ordinal = u32::try_from(self.instances.len()).unwrap_or(u32::MAX);
        let instance = Arc::new(Instance {
            id: InstanceId::new(self.definition.id.clone(), ordinal),
            definition: Arc::clone(&self.definition),
            payload: Arc::clone(&self.payload),
            slot: Mutex::new(Slot::new()),
        });
        self.instances.push(Arc::clone(&instance));
        instance
    }

    fn any_in_flight(&self) -> bool {
        self.instances.iter().any(|i| lock(&i.slot).is_in_flight())
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            definition: (*self.definition).clone(),
            instances: self.instances.iter().map(|i| i.snapshot()).collect(),
            retired: self.retired,
        }
    }
}

/// A queued cycle. Ordered by due time, then by insertion.
struct Due {
    at: DateTime<Utc>,
    seq: u64,
    generation: u64,
    instance: Arc<Instance>,
}

impl PartialEq for Due {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Due {}

impl PartialOrd for Due {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Due {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

struct Inner {
    enforcer: Arc<BudgetEnforcer>,
    registry: PayloadRegistry,
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<dyn AuditLog>>,
    observers: Observers,
    workers: RwLock<BTreeMap<WorkerId, WorkerEntry>>,
    queue: Mutex<BinaryHeap<Reverse<Due>>>,
    seq: AtomicU64,
    wake: Notify,
    permits: Arc<Semaphore>,
}

/// Builds a [`Supervisor`].
pub struct SupervisorBuilder {
    enforcer: Arc<BudgetEnforcer>,
    registry: PayloadRegistry,
    config: SupervisorConfig,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditLog>>,
    observers: Observers,
}

impl SupervisorBuilder {
    /// Replace the default configuration.
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this clock for timestamps and due times. Pass the enforcer's
    /// clock so both agree. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Append settled ledger entries to `audit`.
    pub fn audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Deliver run and stop events to `observer`.
    pub fn observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observers.add(observer);
        self
    }

    /// Validate the configuration and build.
    pub fn build(self) -> Result<Supervisor, ConfigError> {
        self.config.validate()?;
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        Ok(Supervisor {
            inner: Arc::new(Inner {
                enforcer: self.enforcer,
                registry: self.registry,
                config: self.config,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                audit: self.audit,
                observers: self.observers,
                workers: RwLock::new(BTreeMap::new()),
                queue: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                wake: Notify::new(),
                permits,
            }),
        })
    }
}

/// Owns every worker and schedules their cycles.
///
/// Cheap to clone. All clones share the same workers and queue.
///
/// Nothing runs until cycles are driven, either by the task from
/// [`Supervisor::spawn_dispatcher`] or by calling
/// [`Supervisor::run_pending`] directly.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("workers", &read(&self.inner.workers).len())
            .field("queued", &lock(&self.inner.queue).len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Supervisor {
    /// Start building a supervisor that reserves through `enforcer` and
    /// runs payloads from `registry`.
    pub fn builder(enforcer: Arc<BudgetEnforcer>, registry: PayloadRegistry) -> SupervisorBuilder {
        SupervisorBuilder {
            enforcer,
            registry,
            config: SupervisorConfig::default(),
            clock: None,
            audit: None,
            observers: Observers::new(),
        }
    }

    /// The enforcer every cycle reserves through.
    pub fn enforcer(&self) -> &Arc<BudgetEnforcer> {
        &self.inner.enforcer
    }

    /// The configuration in use.
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Register a worker. It gets one instance, not yet started.
    ///
    /// Fails when the definition is invalid, its `type` has no registered
    /// payload, or the id is taken.
    pub fn register(&self, definition: WorkerDefinition) -> Result<WorkerId, ConfigError> {
        definition.validate()?;
        let payload = self
            .inner
            .registry
            .get(&definition.kind)
            .ok_or_else(|| ConfigError::UnknownPayload(definition.kind.clone()))?;
        let id = definition.id.clone();
        {
            let mut workers = write(&self.inner.workers);
            if workers.contains_key(&id) {
                return Err(ConfigError::Duplicate(id));
            }
            let mut entry = WorkerEntry {
                definition: Arc::new(definition),
                payload,
                instances: Vec::new(),
                retired: false,
            };
            entry.add_instance();
            if let Some(limit) = entry.definition.daily_budget {
                self.inner.enforcer.set_worker_limit(&id, limit);
            }
            workers.insert(id.clone(), entry);
        }
        tracing::info!(worker = %id, "foreman.worker.registered");
        Ok(id)
    }

    /// Start every stopped instance of a worker. Crash-stopped instances
    /// stay stopped; use [`Self::reset`].
    pub fn start(&self, id: &WorkerId) -> Result<(), SupervisorError> {
        let now = self.inner.clock.now();
        let workers = read(&self.inner.workers);
        let entry = workers
            .get(id)
            .ok_or_else(|| SupervisorError::WorkerNotFound(id.clone()))?;
        if entry.retired {
            return Err(SupervisorError::Retired(id.clone()));
        }
        let mut started = 0;
        for instance in &entry.instances {
            let generation = lock(&instance.slot).start(now);
            if let Some(generation) = generation {
                self.inner.schedule(Arc::clone(instance), now, generation);
                started += 1;
            }
        }
        if started > 0 {
            tracing::info!(worker = %id, instances = started, "foreman.worker.started");
        }
        Ok(())
    }

    /// Stop every instance of a worker.
    ///
    /// Idle instances stop immediately. An instance mid-cycle finishes and
    /// settles that cycle first.
    pub fn stop(&self, id: &WorkerId) -> Result<(), SupervisorError> {
        let stopped = {
            let workers = read(&self.inner.workers);
            let entry = workers
                .get(id)
                .ok_or_else(|| SupervisorError::WorkerNotFound(id.clone()))?;
            stop_instances(entry, StopCause::Requested)
        };
        tracing::info!(worker = %id, "foreman.worker.stop_requested");
        self.inner.announce_stops(stopped, StopCause::Requested);
        Ok(())
    }

    /// Start every registered worker.
    pub fn start_all(&self) {
        for id in self.ids() {
            // Retired workers refuse; everything else starts.
            let _ = self.start(&id);
        }
    }

    /// Stop every registered worker.
    pub fn stop_all(&self) {
        for id in self.ids() {
            let _ = self.stop(&id);
        }
    }

    /// Add `multiplier - 1` instances. Returns the new instance count.
    ///
    /// New instances start right away when the worker has a running
    /// instance. Otherwise they wait for the next [`Self::start`].
    pub fn scale(&self, id: &WorkerId, multiplier: u32) -> Result<usize, SupervisorError> {
        if multiplier == 0 {
            return Err(SupervisorError::InvalidMultiplier(multiplier));
        }
        let now = self.inner.clock.now();
        let mut workers = write(&self.inner.workers);
        let entry = workers
            .get_mut(id)
            .ok_or_else(|| SupervisorError::WorkerNotFound(id.clone()))?;
        if entry.retired {
            return Err(SupervisorError::Retired(id.clone()));
        }
        let running = entry
            .instances
            .iter()
            .any(|i| lock(&i.slot).state.status != WorkerStatus::Stopped);
        for _ in 1..multiplier {
            let instance = entry.add_instance();
            if running {
                let generation = lock(&instance.slot).start(now);
                if let Some(generation) = generation {
                    self.inner.schedule(instance, now, generation);
                }
            }
        }
        let count = entry.instances.len();
        tracing::info!(worker = %id, multiplier, instances = count, "foreman.worker.scaled");
        Ok(count)
    }

    /// Stop a worker and remove it once no instance is in flight.
    ///
    /// An in-flight cycle is never preempted. It settles normally and the
    /// worker is removed right after.
    pub fn kill(&self, id: &WorkerId) -> Result<(), SupervisorError> {
        let stopped = {
            let mut workers = write(&self.inner.workers);
            let entry = workers
                .get_mut(id)
                .ok_or_else(|| SupervisorError::WorkerNotFound(id.clone()))?;
            entry.retired = true;
            stop_instances(entry, StopCause::Retired)
        };
        tracing::warn!(worker = %id, "foreman.worker.killed");
        self.inner.announce_stops(stopped, StopCause::Retired);
        self.inner.purge(id);
        Ok(())
    }

    /// Remove a worker now. Fails with [`SupervisorError::WorkerBusy`]
    /// while any of its instances is in flight.
    pub fn remove(&self, id: &WorkerId) -> Result<WorkerDefinition, SupervisorError> {
        let (entry, stopped) = {
            let mut workers = write(&self.inner.workers);
            let entry = workers
                .get(id)
                .ok_or_else(|| SupervisorError::WorkerNotFound(id.clone()))?;
            if entry.any_in_flight() {
                return Err(SupervisorError::WorkerBusy(id.clone()));
            }
            let stopped = stop_instances(entry, StopCause::Retired);
            let entry = workers
                .remove(id)
                .ok_or_else(|| SupervisorError::WorkerNotFound(id.clone()))?;
            (entry, stopped)
        };
        self.inner.enforcer.remove_worker(id);
        self.inner.announce_stops(stopped, StopCause::Retired);
        tracing::info!(worker = %id, "foreman.worker.removed");
        Ok((*entry.definition).clone())
    }

    /// Revive instances stopped by their crash limit. Returns how many
    /// were revived.
    pub fn reset(&self, id: &WorkerId) -> Result<usize, SupervisorError> {
        let now = self.inner.clock.now();
        let workers = read(&self.inner.workers);
        let entry = workers
            .get(id)
            .ok_or_else(|| SupervisorError::WorkerNotFound(id.clone()))?;
        if entry.retired {
            return Err(SupervisorError::Retired(id.clone()));
        }
        let mut revived = 0;
        for instance in &entry.instances {
            let generation = lock(&instance.slot).reset(now);
            if let Some(generation) = generation {
                self.inner.schedule(Arc::clone(instance), now, generation);
                revived += 1;
            }
        }
        tracing::info!(worker = %id, revived, "foreman.worker.reset");
        Ok(revived)
    }

    /// Snapshot one worker.
    pub fn status(&self, id: &WorkerId) -> Result<WorkerSnapshot, SupervisorError> {
        read(&self.inner.workers)
            .get(id)
            .map(WorkerEntry::snapshot)
            .ok_or_else(|| SupervisorError::WorkerNotFound(id.clone()))
    }

    /// Snapshot every worker, in id order.
    pub fn list(&self) -> Vec<WorkerSnapshot> {
        read(&self.inner.workers)
            .values()
            .map(WorkerEntry::snapshot)
            .collect()
    }

    fn ids(&self) -> Vec<WorkerId> {
        read(&self.inner.workers).keys().cloned().collect()
    }

    /// Classify every worker. A worker takes the worst state of its
    /// instances.
    pub fn health_check(&self) -> HealthReport {
        let now = self.inner.clock.now();
        let workers = read(&self.inner.workers);
        let mut report = HealthReport {
            checked_at: Some(now),
            workers: Vec::with_capacity(workers.len()),
        };
        for (id, entry) in workers.iter() {
            let instances: Vec<InstanceHealth> = entry
                .instances
                .iter()
                .map(|i| {
                    let slot = lock(&i.slot);
                    health::classify(
                        &entry.definition,
                        &i.id,
                        &slot.state,
                        now,
                        &self.inner.config.health,
                    )
                })
                .collect();
            let state = instances
                .iter()
                .map(|i| i.state)
                .max()
                .unwrap_or(HealthState::Stopped);
            if state == HealthState::Unhealthy {
                let reasons: Vec<&str> = instances
                    .iter()
                    .flat_map(|i| i.reasons.iter().map(String::as_str))
                    .collect();
                tracing::warn!(worker = %id, reasons = ?reasons, "foreman.worker.unhealthy");
            }
            report.workers.push(WorkerHealth {
                worker: id.clone(),
                state,
                instances,
            });
        }
        report
    }

    /// Totals over every worker.
    pub fn summary(&self) -> FleetSummary {
        FleetSummary::from_snapshots(&self.list(), self.inner.config.roi_epsilon)
    }

    /// The `n` workers with the highest ROI. Workers that never ran are
    /// left out.
    pub fn top_performers(&self, n: usize) -> Vec<Performer> {
        let mut ranked = aggregate::rank(&self.list(), self.inner.config.roi_epsilon);
        ranked.truncate(n);
        ranked
    }

    /// The `n` workers with the lowest ROI, worst first.
    pub fn bottom_performers(&self, n: usize) -> Vec<Performer> {
        let mut ranked = aggregate::rank(&self.list(), self.inner.config.roi_epsilon);
        ranked.reverse();
        ranked.truncate(n);
        ranked
    }

    /// Cycles waiting in the queue, including stale ones not yet dropped.
    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Run every cycle that is due now, one after another, and return how
    /// many ran. Cycles scheduled by those runs are left for later.
    ///
    /// Drives the supervisor without a dispatcher task. Do not combine
    /// with [`Self::spawn_dispatcher`].
    pub async fn run_pending(&self) -> usize {
        let now = self.inner.clock.now();
        let mut ran = 0;
        while let Some(due) = self.inner.pop_due(now) {
            if Arc::clone(&self.inner).run_cycle(due).await {
                ran += 1;
            }
        }
        ran
    }

    /// Spawn the dispatcher on the current tokio runtime.
    ///
    /// The dispatcher sleeps until the earliest due time, then runs every
    /// due cycle on its own task, at most `max_concurrency` at once.
    pub fn spawn_dispatcher(&self) -> DispatcherHandle {
        let (shutdown, receiver) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let permits = Arc::clone(&self.inner.permits);
        let task = tokio::spawn(dispatch_loop(inner, receiver));
        DispatcherHandle {
            shutdown,
            task,
            permits,
            capacity: self.inner.config.max_concurrency,
        }
    }
}

/// Stop every instance of `entry`. Returns the instances that stopped
/// immediately.
fn stop_instances(entry: &WorkerEntry, cause: StopCause) -> Vec<InstanceId> {
    entry
        .instances
        .iter()
        .filter(|i| lock(&i.slot).request_stop(cause) == StopOutcome::Stopped)
        .map(|i| i.id.clone())
        .collect()
}

impl Inner {
    fn schedule(&self, instance: Arc<Instance>, at: DateTime<Utc>, generation: u64) {
        let seq = self.seq.fetch_add(1, atomic::Ordering::Relaxed);
        lock(&self.queue).push(Reverse(Due {
            at,
            seq,
            generation,
            instance,
        }));
        self.wake.notify_one();
    }

    fn pop_due(&self, now: DateTime<Utc>) -> Option<Due> {
        let mut queue = lock(&self.queue);
        if queue.peek().is_some_and(|Reverse(due)| due.at <= now) {
            queue.pop().map(|Reverse(due)| due)
        } else {
            None
        }
    }

    fn wait_time(&self, now: DateTime<Utc>) -> Duration {
        lock(&self.queue)
            .peek()
            .map(|Reverse(due)| (due.at - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(IDLE_WAIT)
    }

    fn announce_stops(&self, instances: Vec<InstanceId>, cause: StopCause) {
        let at = self.clock.now();
        for instance in instances {
            self.observers.emit(&LifecycleEvent::InstanceStopped {
                instance,
                cause,
                at,
            });
        }
    }

    /// Drop a retired worker once nothing of it is in flight.
    fn purge(&self, id: &WorkerId) -> bool {
        {
            let mut workers = write(&self.workers);
            let Some(entry) = workers.get(id) else {
                return false;
            };
            if !entry.retired || entry.any_in_flight() {
                return false;
            }
            workers.remove(id);
        }
        self.enforcer.remove_worker(id);
        tracing::info!(worker = %id, "foreman.worker.removed");
        true
    }

    /// Where the estimate for a run comes from, in order: the payload,
    /// the definition, the token hint priced by the enforcer, the default.
    fn estimate(&self, instance: &Instance) -> Decimal {
        let definition = &instance.definition;
        instance
            .payload
            .estimate_cost(&definition.config)
            .or(definition.estimated_cost)
            .or_else(|| {
                definition
                    .token_budget_hint
                    .as_ref()
                    .map(|hint| self.enforcer.predict_hint(hint))
            })
            .unwrap_or(self.config.default_estimated_cost)
    }

    /// Run one cycle of the instance in `due`. Returns `false` when the
    /// entry was stale.
    async fn run_cycle(self: Arc<Self>, due: Due) -> bool {
        let instance = due.instance;
        if lock(&instance.slot).begin(due.generation) == Begin::Stale {
            tracing::trace!(instance = %instance.id, "foreman.worker.stale_entry");
            return false;
        }
        let definition = Arc::clone(&instance.definition);
        let started = self.clock.now();
        let next_regular = started + definition.run_interval.to_chrono();
        let estimate = self.estimate(&instance);

        let reserved = self
            .enforcer
            .reserve_for(&definition.id, &self.config.operation, estimate);
        let reservation = match reserved {
            Ok(reservation) => reservation,
            Err(reason) => {
                let finish = lock(&instance.slot).denied(next_regular);
                tracing::debug!(
                    instance = %instance.id,
                    reason = %reason,
                    "foreman.worker.skipped"
                );
                self.observers.emit(&LifecycleEvent::RunSkipped {
                    instance: instance.id.clone(),
                    reason: reason.kind(),
                    at: started,
                });
                self.after(&instance, finish, next_regular);
                return true;
            }
        };

        lock(&instance.slot).granted(started);
        let timeout = definition
            .execution_timeout
            .unwrap_or(self.config.default_execution_timeout);
        tracing::debug!(
            instance = %instance.id,
            estimate = %estimate,
            reservation = %reservation.id,
            "foreman.worker.run_started"
        );
        let result = execute(
            Arc::clone(&instance.payload),
            definition.config.clone(),
            timeout,
        )
        .await;
        lock(&instance.slot).settling();

        match result {
            Ok(outcome) => {
                let cost = outcome.cost.max(Decimal::ZERO);
                self.settle(&reservation, cost).await;
                let finish = lock(&instance.slot).succeeded(cost, outcome.revenue, next_regular);
                let at = self.clock.now();
                tracing::debug!(
                    instance = %instance.id,
                    cost = %cost,
                    revenue = %outcome.revenue,
                    "foreman.worker.run_settled"
                );
                self.observers.emit(&LifecycleEvent::RunSettled {
                    instance: instance.id.clone(),
                    cost,
                    revenue: outcome.revenue,
                    at,
                });
                self.after(&instance, finish, next_regular);
            }
            Err(error) => {
                let cost = error
                    .reported_cost()
                    .unwrap_or(reservation.amount)
                    .max(Decimal::ZERO);
                self.settle(&reservation, cost).await;
                let at = self.clock.now();
                let message = error.to_string();
                let retry_at = (at + definition.cooldown_duration.to_chrono()).max(next_regular);
                let (count, finish) = {
                    let mut slot = lock(&instance.slot);
                    let (count, limited) =
                        slot.failed(cost, message.clone(), definition.max_consecutive_crashes);
                    let finish = if limited {
                        Finish::Stopped(slot.crash_stop())
                    } else {
                        slot.backoff(retry_at)
                    };
                    (count, finish)
                };
                tracing::warn!(
                    instance = %instance.id,
                    error = %message,
                    consecutive_crashes = count,
                    cost = %cost,
                    "foreman.worker.crash"
                );
                self.observers.emit(&LifecycleEvent::RunFailed {
                    instance: instance.id.clone(),
                    error: message,
                    consecutive_crashes: count,
                    cost,
                    at,
                });
                if finish == Finish::Stopped(StopCause::CrashLimit) {
                    tracing::error!(
                        instance = %instance.id,
                        consecutive_crashes = count,
                        max = definition.max_consecutive_crashes,
                        "foreman.worker.crash_limit"
                    );
                }
                self.after(&instance, finish, retry_at);
            }
        }
        true
    }

    /// Settle the reservation and append its ledger entries.
    async fn settle(&self, reservation: &Reservation, cost: Decimal) {
        let Some(settlement) = self.enforcer.release_unused(reservation, cost) else {
            return;
        };
        let Some(audit) = &self.audit else {
            return;
        };
        for entry in settlement.entries {
            if let Err(error) = audit.append_ledger(entry).await {
                tracing::warn!(
                    reservation = %reservation.id,
                    error = %error,
                    "foreman.audit.append_failed"
                );
            }
        }
    }

    fn after(&self, instance: &Arc<Instance>, finish: Finish, next: DateTime<Utc>) {
        match finish {
            Finish::Scheduled(generation) => self.schedule(Arc::clone(instance), next, generation),
            Finish::Stopped(cause) => {
                tracing::info!(instance = %instance.id, cause = ?cause, "foreman.worker.stopped");
                self.announce_stops(vec![instance.id.clone()], cause);
                if cause == StopCause::Retired {
                    self.purge(&instance.id.worker);
                }
            }
        }
    }
}

/// Run the payload on its own task under a hard timeout. A panic in the
/// payload becomes [`PayloadError::Panicked`].
async fn execute(
    payload: Arc<dyn Payload>,
    config: serde_json::Value,
    timeout: DurationMs,
) -> Result<Outcome, PayloadError> {
    let mut handle = tokio::spawn(async move { payload.run(&config).await });
    match tokio::time::timeout(timeout.to_std(), &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => {
            let message = if join.is_panic() {
                let panic = join.into_panic();
                panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "payload panicked".to_owned())
            } else {
                "payload task cancelled".to_owned()
            };
            Err(PayloadError::Panicked(message))
        }
        Err(_) => {
            handle.abort();
            Err(PayloadError::Timeout(timeout))
        }
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(
        max_concurrency = inner.config.max_concurrency,
        "foreman.dispatcher.started"
    );
    'outer: loop {
        if *shutdown.borrow() {
            break;
        }
        let now = inner.clock.now();
        while let Some(due) = inner.pop_due(now) {
            let permit = tokio::select! {
                permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'outer,
                },
                _ = shutdown.changed() => {
                    let Due { at, generation, instance, .. } = due;
                    inner.schedule(instance, at, generation);
                    break 'outer;
                }
            };
            let cycle = Arc::clone(&inner);
            tokio::spawn(async move {
                cycle.run_cycle(due).await;
                drop(permit);
            });
        }
        let wait = inner.wait_time(inner.clock.now());
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    tracing::info!("foreman.dispatcher.stopped");
}

/// Handle to a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl DispatcherHandle {
    /// Stop dispatching and wait for in-flight cycles to settle.
    ///
    /// Queued cycles stay queued. A new dispatcher picks them up.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            tracing::error!(error = %error, "foreman.dispatcher.join_failed");
        }
        let capacity = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        if let Ok(all) = self.permits.acquire_many(capacity).await {
            drop(all);
        }
    }

    /// Whether the dispatcher task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[async_trait]
impl WorkerControl for Supervisor {
    async fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.list()
    }

    async fn scale(&self, id: &WorkerId, multiplier: u32) -> Result<usize, SupervisorError> {
        Supervisor::scale(self, id, multiplier)
    }

    async fn pause(&self, id: &WorkerId) -> Result<(), SupervisorError> {
        self.stop(id)
    }

    async fn kill(&self, id: &WorkerId) -> Result<(), SupervisorError> {
        Supervisor::kill(self, id)
    }

    async fn deploy(&self, definition: WorkerDefinition) -> Result<WorkerId, SupervisorError> {
        let id = self.register(definition)?;
        self.start(&id)?;
        Ok(id)
    }
}
