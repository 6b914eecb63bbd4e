//! Administrative surface over the scheduler: listing, history, enable and
//! disable, manual triggers and schedule edits. Shared by the CLI and the
//! HTTP gateway.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::engine::{RunHandle, SchedulerEngine};
use crate::schedule;
use crate::tasks::{RunRecord, TaskCategory, TaskState};
use warden_core::{Result, WardenError};

/// Default number of history rows returned when the caller doesn't ask.
pub const DEFAULT_HISTORY_PAGE: usize = 20;

/// Registered task joined with its persisted state.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub category: TaskCategory,
    pub default_schedule: String,
    pub catch_up_eligible: bool,
    pub has_retry_policy: bool,
    /// Running in this process right now.
    pub running: bool,
    /// `None` until the task has been seeded.
    pub state: Option<TaskState>,
}

/// Façade over a running [`SchedulerEngine`].
#[derive(Clone)]
pub struct SchedulerAdmin {
    engine: Arc<SchedulerEngine>,
}

impl SchedulerAdmin {
    pub fn new(engine: Arc<SchedulerEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<SchedulerEngine> {
        &self.engine
    }

    /// Every registered task, in registration order.
    pub fn list_tasks(&self) -> Result<Vec<TaskSummary>> {
        self.engine
            .registry()
            .all()
            .iter()
            .map(|def| {
                Ok(TaskSummary {
                    name: def.name.clone(),
                    category: def.category,
                    default_schedule: def.default_schedule.clone(),
                    catch_up_eligible: def.catch_up_eligible,
                    has_retry_policy: def.retry_policy.is_some(),
                    running: self.engine.is_running(&def.name),
                    state: self.engine.db().get_state(&def.name)?,
                })
            })
            .collect()
    }

    /// One task's summary.
    pub fn get_task(&self, name: &str) -> Result<TaskSummary> {
        self.engine.registry().require(name)?;
        self.list_tasks()?
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| WardenError::TaskNotFound(name.to_string()))
    }

    /// Newest-first run history.
    pub fn get_history(&self, name: &str, limit: usize) -> Result<Vec<RunRecord>> {
        self.engine.registry().require(name)?;
        self.engine.db().history(name, limit.max(1))
    }

    /// Enable a task. Idempotent; returns `false` if it was already enabled.
    /// Re-enabling recomputes `next_run` from now so runs missed while
    /// disabled are not replayed.
    pub fn enable(&self, name: &str) -> Result<bool> {
        let state = self.require_state(name)?;
        if state.enabled {
            return Ok(false);
        }
        let next_run = self
            .engine
            .next_run_from(&state.schedule, self.engine.clock().now())?;
        let changed = self.engine.db().enable(name, next_run)?;
        if changed {
            tracing::info!(task = name, %next_run, "▶️ Task enabled");
        }
        Ok(changed)
    }

    /// Disable a task. Idempotent; returns `false` if it was already disabled.
    /// A run already in flight is allowed to finish.
    pub fn disable(&self, name: &str) -> Result<bool> {
        self.require_state(name)?;
        let changed = self.engine.db().disable(name)?;
        if changed {
            tracing::info!(task = name, "⏸️ Task disabled");
        }
        Ok(changed)
    }

    /// Run a task now, outside its schedule.
    pub fn trigger(&self, name: &str) -> Result<RunHandle> {
        self.engine.trigger(name)
    }

    /// Replace the effective schedule and recompute `next_run` from now.
    /// The registered default is untouched.
    pub fn update_schedule(&self, name: &str, expression: &str) -> Result<TaskState> {
        schedule::validate(expression)?;
        self.require_state(name)?;
        let expression = expression.trim();
        let next_run = self
            .engine
            .next_run_from(expression, self.engine.clock().now())?;
        self.engine.db().set_schedule(name, expression, next_run)?;
        tracing::info!(task = name, schedule = expression, %next_run, "🗓️ Schedule updated");
        self.require_state(name)
    }

    /// Validate an expression and preview its next `count` occurrences.
    pub fn preview_schedule(&self, expression: &str, count: usize) -> Result<Vec<DateTime<Utc>>> {
        schedule::validate(expression)?;
        schedule::upcoming(
            expression,
            self.engine.clock().now(),
            self.engine.config().timezone,
            count,
        )
    }

    fn require_state(&self, name: &str) -> Result<TaskState> {
        self.engine.registry().require(name)?;
        self.engine
            .db()
            .get_state(name)?
            .ok_or_else(|| WardenError::Store(format!("task '{name}' has no state row; seed first")))
    }
}
