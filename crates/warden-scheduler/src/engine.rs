//! Scheduler Engine — the loop that finds due tasks, leases them and runs them.
//!
//! Per task, per tick: Idle → Due → LockPending → Running → Completed →
//! Idle with a fresh `next_run`. Work units are dispatched onto tokio tasks
//! so a slow task never delays the next due-check. The same task never runs
//! twice at once: in-process via the in-flight set, across processes via the
//! lease in the shared store.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::lease::{self, LeaseManager};
use crate::persistence::{ClaimGuard, RunCompletion, SchedulerDb};
use crate::registry::{TaskDefinition, TaskOutcome, TaskRegistry};
use crate::retry::{self, RetryDecision};
use crate::schedule;
use crate::tasks::{RunOutcome, RunRecord, TaskState, TriggerKind};
use warden_core::{Result, SchedulerConfig, WardenError};

/// Handle to a dispatched run.
pub type RunHandle = JoinHandle<Result<RunRecord>>;

/// Loop tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Polling interval.
    pub tick: std::time::Duration,
    /// Max lateness for which a missed run still fires once.
    pub catch_up_window: Duration,
    /// Zone used to evaluate cron fields.
    pub timezone: Tz,
    /// This instance's `lock_holder` value.
    pub holder_id: String,
    /// Lease TTL overrides keyed by category name.
    pub lease_ttl_overrides: BTreeMap<String, u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick: std::time::Duration::from_secs(15),
            catch_up_window: Duration::hours(1),
            timezone: chrono_tz::UTC,
            holder_id: lease::instance_id(),
            lease_ttl_overrides: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_config(cfg: &SchedulerConfig) -> Result<Self> {
        let holder_id = if cfg.instance_id.trim().is_empty() {
            lease::instance_id()
        } else {
            cfg.instance_id.trim().to_string()
        };
        lease::validate_ttl_overrides(&cfg.lease_ttl_secs)?;
        Ok(Self {
            tick: std::time::Duration::from_secs(cfg.tick_secs.max(1)),
            catch_up_window: lease::seconds(cfg.catch_up_window_secs).ok_or_else(|| {
                WardenError::Config(format!(
                    "catch_up_window_secs = {} is out of range",
                    cfg.catch_up_window_secs
                ))
            })?,
            timezone: schedule::parse_timezone(&cfg.timezone)?,
            holder_id,
            lease_ttl_overrides: cfg.lease_ttl_secs.clone(),
        })
    }

    /// Lateness beyond which a due run counts as missed while down.
    pub fn missed_after(&self) -> Duration {
        Duration::from_std(self.tick * 2).unwrap_or_else(|_| Duration::seconds(30))
    }
}

/// What the loop decided for one task on one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickDecision {
    Idle,
    Run(TriggerKind),
    /// Missed beyond the catch-up window: skip and re-plan from now.
    SkipMissed,
}

/// Summary of one tick.
#[derive(Debug, Default)]
pub struct TickReport {
    pub dispatched: Vec<(String, TriggerKind)>,
    pub skipped_missed: Vec<String>,
    pub contended: Vec<String>,
    pub unseeded: Vec<String>,
    pub handles: Vec<RunHandle>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty()
            && self.skipped_missed.is_empty()
            && self.contended.is_empty()
            && self.unseeded.is_empty()
    }
}

/// The scheduler engine. Constructed once at startup and shared via `Arc`.
pub struct SchedulerEngine {
    registry: Arc<TaskRegistry>,
    db: Arc<SchedulerDb>,
    leases: LeaseManager,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    /// Task names with a run in flight from this process.
    in_flight: Mutex<HashSet<String>>,
}

impl SchedulerEngine {
    pub fn new(
        registry: Arc<TaskRegistry>,
        db: Arc<SchedulerDb>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let leases = LeaseManager::new(db.clone(), clock.clone());
        Self {
            registry,
            db,
            leases,
            clock,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn db(&self) -> &SchedulerDb {
        &self.db
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn holder_id(&self) -> &str {
        &self.config.holder_id
    }

    /// Create missing state rows from registry defaults. Returns how many
    /// rows were created.
    pub fn seed(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut created = 0;
        for def in self.registry.all() {
            let next_run = self.next_run_from(&def.default_schedule, now)?;
            if self.db.seed(&def.name, &def.default_schedule, next_run)? {
                tracing::info!(task = %def.name, %next_run, "🌱 Task state seeded");
                created += 1;
            }
        }
        Ok(created)
    }

    /// Next occurrence of `schedule` strictly after `base`, in the engine's zone.
    pub fn next_run_from(&self, schedule: &str, base: DateTime<Utc>) -> Result<DateTime<Utc>> {
        schedule::next_occurrence(schedule, base, self.config.timezone)
    }

    /// Whether this process is currently running `name`.
    pub fn is_running(&self, name: &str) -> bool {
        self.lock_in_flight().contains(name)
    }

    /// Number of runs in flight from this process.
    pub fn running_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply the due/catch-up rules to one task row.
    pub fn classify(&self, def: &TaskDefinition, state: &TaskState, now: DateTime<Utc>) -> TickDecision {
        if state.schedule_due(now) {
            let lateness = now - state.next_run;
            let missed = lateness > self.config.missed_after();
            if missed && def.catch_up_eligible {
                return if lateness <= self.config.catch_up_window {
                    TickDecision::Run(TriggerKind::CatchUp)
                } else {
                    TickDecision::SkipMissed
                };
            }
            return TickDecision::Run(TriggerKind::Scheduled);
        }
        if state.retry_due(now) {
            return TickDecision::Run(TriggerKind::Retry);
        }
        TickDecision::Idle
    }

    /// One pass over the registry. Never fails: per-task problems are
    /// logged and the task is retried next tick.
    pub fn tick(self: &Arc<Self>) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for def in self.registry.all() {
            let name = def.name.as_str();
            if self.is_running(name) {
                continue;
            }

            let state = match self.db.get_state(name) {
                Ok(Some(state)) => state,
                Ok(None) => {
                    tracing::warn!(task = name, "no state row; refusing to run until seeded");
                    report.unseeded.push(name.to_string());
                    continue;
                }
                Err(e) => {
                    tracing::error!(task = name, "failed to load task state: {e}");
                    continue;
                }
            };

            match self.classify(def, &state, now) {
                TickDecision::Idle => {}
                TickDecision::SkipMissed => {
                    if state.lease_active(now) {
                        report.contended.push(name.to_string());
                        continue;
                    }
                    match self.skip_missed(&state, now) {
                        Ok(next_run) => {
                            tracing::info!(
                                task = name,
                                missed = %state.next_run,
                                %next_run,
                                "⏭️ Missed run outside catch-up window, skipped"
                            );
                            report.skipped_missed.push(name.to_string());
                        }
                        Err(e) => tracing::error!(task = name, "failed to skip missed run: {e}"),
                    }
                }
                TickDecision::Run(kind) => {
                    let ttl = lease::lease_ttl_for(def.category, &self.config.lease_ttl_overrides);
                    let guard = match (kind, state.retry_next_at) {
                        (TriggerKind::Retry, Some(at)) => ClaimGuard::RetryAt(at),
                        _ => ClaimGuard::NextRun(state.next_run),
                    };
                    match self.leases.acquire(name, self.holder_id(), ttl, guard) {
                        Ok(()) => {
                            tracing::info!(task = name, trigger = %kind, "🔔 Task due");
                            report.dispatched.push((name.to_string(), kind));
                            report.handles.push(self.dispatch(def.clone(), kind, now));
                        }
                        Err(WardenError::LeaseContention(_)) => report.contended.push(name.to_string()),
                        Err(e) => tracing::error!(task = name, "lease acquisition failed: {e}"),
                    }
                }
            }
        }

        report
    }

    fn skip_missed(&self, state: &TaskState, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let next_run = self.next_run_from(&state.schedule, now)?;
        self.db.advance_next_run(&state.name, state.next_run, next_run)?;
        Ok(next_run)
    }

    /// Run a task now, bypassing due-ness and the enabled flag but not the
    /// lease. Rejects with `AlreadyRunning` if a run is in flight anywhere.
    pub fn trigger(self: &Arc<Self>, name: &str) -> Result<RunHandle> {
        let def = self.registry.require(name)?.clone();
        let now = self.clock.now();
        let state = self.db.get_state(name)?.ok_or_else(|| {
            WardenError::Store(format!("task '{name}' has no state row; seed first"))
        })?;
        if self.is_running(name) || state.lease_active(now) {
            return Err(WardenError::AlreadyRunning(name.to_string()));
        }

        let ttl = lease::lease_ttl_for(def.category, &self.config.lease_ttl_overrides);
        self.leases
            .acquire(name, self.holder_id(), ttl, ClaimGuard::Any)
            .map_err(|e| match e {
                WardenError::LeaseContention(name) => WardenError::AlreadyRunning(name),
                other => other,
            })?;
        tracing::info!(task = name, "👆 Manual trigger");
        Ok(self.dispatch(def, TriggerKind::Manual, now))
    }

    /// Spawn the run. The caller must already hold the lease.
    fn dispatch(self: &Arc<Self>, def: TaskDefinition, kind: TriggerKind, started_at: DateTime<Utc>) -> RunHandle {
        self.lock_in_flight().insert(def.name.clone());
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let name = def.name.clone();
            let result = engine.execute(def, kind, started_at).await;
            engine.lock_in_flight().remove(&name);
            if let Err(e) = &result {
                tracing::error!(task = %name, "failed to record run: {e}");
            }
            result
        })
    }

    async fn execute(&self, def: TaskDefinition, kind: TriggerKind, started_at: DateTime<Utc>) -> Result<RunRecord> {
        let unit = def.work_unit.clone();
        // A panicking work unit is a failed run, not a dead scheduler.
        let outcome = match tokio::spawn(async move { unit.run().await }).await {
            Ok(outcome) => outcome,
            Err(e) => TaskOutcome::fail(format!("work unit panicked: {e}")),
        };

        let result = self.record_completion(&def, kind, started_at, outcome);
        if let Err(e) = self.leases.release(&def.name, self.holder_id()) {
            tracing::error!(task = %def.name, "lease release failed: {e}");
        }
        result
    }

    /// Persist state and history for a finished run.
    fn record_completion(
        &self,
        def: &TaskDefinition,
        kind: TriggerKind,
        started_at: DateTime<Utc>,
        outcome: TaskOutcome,
    ) -> Result<RunRecord> {
        let name = def.name.as_str();
        let finished_at = self.clock.now();
        let state = self.db.get_state(name)?.ok_or_else(|| {
            WardenError::Store(format!("task '{name}' state row vanished during run"))
        })?;

        let next_run = if kind.advances_schedule() {
            let mut next = self.next_run_from(&state.schedule, started_at)?;
            if next <= finished_at {
                next = self.next_run_from(&state.schedule, finished_at)?;
            }
            Some(next)
        } else {
            None
        };
        let regular_next = next_run.unwrap_or(state.next_run);

        let (run_outcome, decision, detail) = match outcome {
            TaskOutcome::Success(detail) => (RunOutcome::Success, RetryDecision::Clear, detail),
            TaskOutcome::Failure(reason) => {
                let decision = retry::on_failure(
                    def.retry_policy.as_ref(),
                    state.retry_count.unwrap_or(0),
                    finished_at,
                    regular_next,
                );
                let detail = match &decision {
                    RetryDecision::Retry { attempt, delay, at: Some(_) } => {
                        format!("{reason} (retry {attempt} in {})", retry::describe(*delay))
                    }
                    RetryDecision::Retry { attempt, at: None, .. } => {
                        format!("{reason} (retry {attempt} deferred to next regular run)")
                    }
                    RetryDecision::Exhausted { attempts } => {
                        format!("{reason} (gave up after {attempts} retries)")
                    }
                    RetryDecision::Clear => reason,
                };
                (decision.failure_outcome(), decision, Some(detail))
            }
        };

        let (retry_count, retry_next_at) = decision.persisted();
        let last = (run_outcome != RunOutcome::RetryScheduled).then(|| {
            let result = match &detail {
                Some(d) => format!("{run_outcome}: {d}"),
                None => run_outcome.to_string(),
            };
            (started_at, result)
        });
        let completion = RunCompletion {
            last,
            next_run,
            retry_count,
            retry_next_at,
        };
        if !self.db.finish_run(name, self.holder_id(), &completion)? {
            tracing::warn!(
                task = name,
                "lease lost before completion; state not updated, history still recorded"
            );
        }

        let mut record = RunRecord {
            id: 0,
            task_name: name.to_string(),
            started_at,
            finished_at,
            outcome: run_outcome,
            detail,
            trigger_kind: kind,
        };
        record.id = self.db.record_run(&record)?;

        match run_outcome {
            RunOutcome::Success => tracing::info!(task = name, trigger = %kind, "✅ Task completed"),
            RunOutcome::RetryScheduled => tracing::warn!(
                task = name,
                retry_at = ?retry_next_at,
                "⚠️ Task failed, retry scheduled: {}",
                record.detail.as_deref().unwrap_or_default()
            ),
            RunOutcome::Failure => tracing::warn!(
                task = name,
                "❌ Task failed: {}",
                record.detail.as_deref().unwrap_or_default()
            ),
        }
        Ok(record)
    }

    /// Wait until this process has no runs in flight, up to `timeout`.
    /// Returns `true` if drained.
    pub async fn drain(&self, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.running_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        true
    }
}

/// Run the scheduler loop until `shutdown` is notified. In-flight runs are
/// given up to one minute to finish before returning.
pub async fn spawn_scheduler(engine: Arc<SchedulerEngine>, shutdown: Arc<Notify>) {
    tracing::info!(
        holder = engine.holder_id(),
        tasks = engine.registry().len(),
        "⏰ Scheduler started (tick every {:?})",
        engine.config().tick
    );

    let mut interval = tokio::time::interval(engine.config().tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = engine.tick();
                if !report.is_empty() {
                    tracing::debug!(
                        dispatched = report.dispatched.len(),
                        skipped = report.skipped_missed.len(),
                        contended = report.contended.len(),
                        "tick"
                    );
                }
            }
            _ = shutdown.notified() => break,
        }
    }

    tracing::info!("🛑 Scheduler stopping; waiting for {} in-flight run(s)", engine.running_count());
    if !engine.drain(std::time::Duration::from_secs(60)).await {
        tracing::warn!("in-flight runs still active at shutdown; their leases will expire");
    }
}
