//! Task registry — the boot-time catalog of named work units.
//!
//! Built once from a static list of [`TaskDefinition`]s and read-only
//! afterwards. Construction fails fast on duplicate names or malformed
//! default schedules so a misconfigured process never starts serving.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::schedule;
use crate::tasks::{RetryPolicy, TaskCategory};
use warden_core::{Result, WardenError};

/// What a work unit reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Completed, with an optional human-readable summary.
    Success(Option<String>),
    /// Failed, with the reason.
    Failure(String),
}

impl TaskOutcome {
    pub fn ok() -> Self {
        TaskOutcome::Success(None)
    }

    pub fn ok_with(detail: impl Into<String>) -> Self {
        TaskOutcome::Success(Some(detail.into()))
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        TaskOutcome::Failure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            TaskOutcome::Success(d) => d.as_deref(),
            TaskOutcome::Failure(reason) => Some(reason),
        }
    }
}

impl<E: std::fmt::Display> From<std::result::Result<Option<String>, E>> for TaskOutcome {
    fn from(r: std::result::Result<Option<String>, E>) -> Self {
        match r {
            Ok(detail) => TaskOutcome::Success(detail),
            Err(e) => TaskOutcome::Failure(e.to_string()),
        }
    }
}

/// An opaque unit of application work the scheduler invokes by name.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    async fn run(&self) -> TaskOutcome;
}

/// Adapter turning an async closure into a [`WorkUnit`].
pub struct FnWorkUnit<F>(F);

#[async_trait]
impl<F, Fut> WorkUnit for FnWorkUnit<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutcome> + Send,
{
    async fn run(&self) -> TaskOutcome {
        (self.0)().await
    }
}

/// Wrap an async closure as a shareable work unit.
pub fn work_fn<F, Fut>(f: F) -> Arc<dyn WorkUnit>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskOutcome> + Send + 'static,
{
    Arc::new(FnWorkUnit(f))
}

/// Immutable description of a registered task.
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub work_unit: Arc<dyn WorkUnit>,
    pub default_schedule: String,
    pub category: TaskCategory,
    pub catch_up_eligible: bool,
    pub retry_policy: Option<RetryPolicy>,
}

impl TaskDefinition {
    pub fn new(
        name: impl Into<String>,
        default_schedule: impl Into<String>,
        category: TaskCategory,
        work_unit: Arc<dyn WorkUnit>,
    ) -> Self {
        Self {
            name: name.into(),
            work_unit,
            default_schedule: default_schedule.into(),
            category,
            catch_up_eligible: false,
            retry_policy: None,
        }
    }

    /// Allow one catch-up run after a short outage.
    pub fn catch_up(mut self, eligible: bool) -> Self {
        self.catch_up_eligible = eligible;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("default_schedule", &self.default_schedule)
            .field("category", &self.category)
            .field("catch_up_eligible", &self.catch_up_eligible)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

/// Process-local catalog of task definitions.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: Vec<TaskDefinition>,
    index: HashMap<String, usize>,
}

impl TaskRegistry {
    /// Build the registry, rejecting duplicate names and bad schedules.
    pub fn new(definitions: Vec<TaskDefinition>) -> Result<Self> {
        let mut index = HashMap::with_capacity(definitions.len());
        for (i, def) in definitions.iter().enumerate() {
            if def.name.trim().is_empty() {
                return Err(WardenError::Config("task name must not be empty".into()));
            }
            if index.insert(def.name.clone(), i).is_some() {
                return Err(WardenError::DuplicateTask(def.name.clone()));
            }
            schedule::validate(&def.default_schedule).map_err(|e| {
                WardenError::InvalidSchedule(format!("task '{}': {e}", def.name))
            })?;
        }
        tracing::info!("📋 Task registry built: {} task(s)", definitions.len());
        Ok(Self {
            tasks: definitions,
            index,
        })
    }

    pub fn all(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.index.get(name).map(|&i| &self.tasks[i])
    }

    /// Like [`get`](Self::get) but maps absence to `TaskNotFound`.
    pub fn require(&self, name: &str) -> Result<&TaskDefinition> {
        self.get(name)
            .ok_or_else(|| WardenError::TaskNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn WorkUnit> {
        work_fn(|| async { TaskOutcome::ok() })
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = TaskRegistry::new(vec![
            TaskDefinition::new("cleanup-sessions", "@hourly", TaskCategory::Cleanup, noop()),
            TaskDefinition::new("daily-forecast", "0 6 * * *", TaskCategory::Weather, noop())
                .catch_up(true),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("daily-forecast").unwrap().catch_up_eligible);
        assert!(registry.get("nope").is_none());
        assert!(matches!(registry.require("nope"), Err(WardenError::TaskNotFound(_))));
        assert_eq!(registry.names(), vec!["cleanup-sessions", "daily-forecast"]);
    }

    #[test]
    fn test_duplicate_names_fail_fast() {
        let err = TaskRegistry::new(vec![
            TaskDefinition::new("backup", "@daily", TaskCategory::Backup, noop()),
            TaskDefinition::new("backup", "@weekly", TaskCategory::Backup, noop()),
        ])
        .unwrap_err();
        assert!(matches!(err, WardenError::DuplicateTask(name) if name == "backup"));
    }

    #[test]
    fn test_bad_default_schedule_fails_fast() {
        let err = TaskRegistry::new(vec![TaskDefinition::new(
            "broken",
            "61 * * * *",
            TaskCategory::Maintenance,
            noop(),
        )])
        .unwrap_err();
        assert!(matches!(err, WardenError::InvalidSchedule(_)));
    }

    #[tokio::test]
    async fn test_work_fn_runs_closure() {
        let unit = work_fn(|| async { TaskOutcome::ok_with("rotated 3 files") });
        assert_eq!(unit.run().await.detail(), Some("rotated 3 files"));
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: TaskOutcome = Ok::<_, String>(Some("done".to_string())).into();
        assert!(ok.is_success());
        let bad: TaskOutcome = Err::<Option<String>, _>("disk full").into();
        assert_eq!(bad, TaskOutcome::fail("disk full"));
    }
}
