//! Housekeeping task the scheduler registers for itself.

use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

use crate::clock::Clock;
use crate::persistence::SchedulerDb;
use crate::registry::{TaskDefinition, TaskOutcome, WorkUnit};
use crate::tasks::TaskCategory;

/// Registered name of the retention task.
pub const RETENTION_TASK: &str = "history-retention";

/// Prunes history older than the retention window and removes rows left
/// behind by tasks that are no longer registered.
pub struct RetentionJob {
    db: Arc<SchedulerDb>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    registered: Vec<String>,
}

impl RetentionJob {
    pub fn new(
        db: Arc<SchedulerDb>,
        clock: Arc<dyn Clock>,
        retention_days: u32,
        registered: Vec<String>,
    ) -> Self {
        Self {
            db,
            clock,
            retention: Duration::days(retention_days.max(1) as i64),
            registered,
        }
    }
}

#[async_trait]
impl WorkUnit for RetentionJob {
    async fn run(&self) -> TaskOutcome {
        let cutoff = self.clock.now() - self.retention;
        let pruned = match self.db.prune_history_before(cutoff) {
            Ok(n) => n,
            Err(e) => return TaskOutcome::fail(format!("history prune failed: {e}")),
        };
        let orphans = match self.db.prune_orphans(&self.registered) {
            Ok(names) => names,
            Err(e) => return TaskOutcome::fail(format!("orphan prune failed: {e}")),
        };
        if !orphans.is_empty() {
            tracing::info!("🧹 Removed rows for unregistered tasks: {}", orphans.join(", "));
        }
        TaskOutcome::ok_with(format!(
            "pruned {pruned} history row(s), {} orphaned task(s)",
            orphans.len()
        ))
    }
}

/// Definition for the retention task. `registered` should hold every task
/// name in the registry, this one included.
pub fn retention_task(
    db: Arc<SchedulerDb>,
    clock: Arc<dyn Clock>,
    retention_days: u32,
    schedule: &str,
    mut registered: Vec<String>,
) -> TaskDefinition {
    if !registered.iter().any(|n| n == RETENTION_TASK) {
        registered.push(RETENTION_TASK.to_string());
    }
    let job = RetentionJob::new(db, clock, retention_days, registered);
    TaskDefinition::new(RETENTION_TASK, schedule, TaskCategory::Cleanup, Arc::new(job)).catch_up(true)
}
