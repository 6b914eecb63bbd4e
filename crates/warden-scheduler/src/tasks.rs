//! Task data model — persisted state rows, run records, and the enums
//! shared between the registry, the store and the loop.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use warden_core::{Result, WardenError};

/// Task category. Drives the default lease TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Maintenance,
    Cleanup,
    Weather,
    Notifications,
    Backup,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 5] = [
        TaskCategory::Maintenance,
        TaskCategory::Cleanup,
        TaskCategory::Weather,
        TaskCategory::Notifications,
        TaskCategory::Backup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Maintenance => "maintenance",
            TaskCategory::Cleanup => "cleanup",
            TaskCategory::Weather => "weather",
            TaskCategory::Notifications => "notifications",
            TaskCategory::Backup => "backup",
        }
    }

    /// Lease lifetime when config doesn't override it. Must exceed the
    /// realistic worst-case run time of tasks in the category.
    pub fn default_lease_ttl(&self) -> Duration {
        match self {
            TaskCategory::Maintenance => Duration::minutes(15),
            TaskCategory::Cleanup => Duration::minutes(15),
            TaskCategory::Weather => Duration::minutes(5),
            TaskCategory::Notifications => Duration::minutes(5),
            TaskCategory::Backup => Duration::hours(2),
        }
    }
}

impl std::str::FromStr for TaskCategory {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        TaskCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| WardenError::Config(format!("unknown task category '{s}'")))
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How retry delays grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Constant `base_delay`.
    Fixed,
    /// `base_delay * 2^retry_count`.
    Exponential,
}

impl std::str::FromStr for BackoffKind {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(WardenError::Config(format!("unknown backoff kind '{other}'"))),
        }
    }
}

/// Out-of-band retry policy for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Fixed,
            base_delay,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Exponential,
            base_delay,
        }
    }
}

/// Persisted per-task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub name: String,
    /// Effective schedule (may differ from the registered default).
    pub schedule: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub next_run: DateTime<Utc>,
    pub lock_holder: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub retry_next_at: Option<DateTime<Utc>>,
}

impl TaskState {
    /// A lease counts only while unexpired, whatever `lock_holder` says.
    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.lock_holder.is_some() && self.lock_expires_at.is_some_and(|exp| exp > now)
    }

    /// Regular cadence says run.
    pub fn schedule_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && now >= self.next_run
    }

    /// A pending retry has come due.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.retry_next_at.is_some_and(|at| now >= at)
    }
}

/// Result recorded for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
    RetryScheduled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
            RunOutcome::RetryScheduled => "retry_scheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunOutcome::Success),
            "failure" => Some(RunOutcome::Failure),
            "retry_scheduled" => Some(RunOutcome::RetryScheduled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    CatchUp,
    Manual,
    Retry,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::CatchUp => "catch_up",
            TriggerKind::Manual => "manual",
            TriggerKind::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TriggerKind::Scheduled),
            "catch_up" => Some(TriggerKind::CatchUp),
            "manual" => Some(TriggerKind::Manual),
            "retry" => Some(TriggerKind::Retry),
            _ => None,
        }
    }

    /// Scheduled and catch-up runs move the regular cadence forward.
    pub fn advances_schedule(&self) -> bool {
        matches!(self, TriggerKind::Scheduled | TriggerKind::CatchUp)
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Store-assigned id; 0 before insertion.
    pub id: i64,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub detail: Option<String>,
    pub trigger_kind: TriggerKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn state(now: DateTime<Utc>) -> TaskState {
        TaskState {
            name: "cleanup-sessions".into(),
            schedule: "@hourly".into(),
            enabled: true,
            last_run: None,
            last_result: None,
            next_run: now,
            lock_holder: None,
            lock_expires_at: None,
            retry_count: None,
            retry_next_at: None,
        }
    }

    #[test]
    fn test_expired_lease_reads_as_absent() {
        let now = Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 0).unwrap();
        let mut s = state(now);
        s.lock_holder = Some("a".into());
        s.lock_expires_at = Some(now + Duration::seconds(1));
        assert!(s.lease_active(now));
        s.lock_expires_at = Some(now);
        assert!(!s.lease_active(now));
    }

    #[test]
    fn test_disabled_is_never_due() {
        let now = Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 0).unwrap();
        let mut s = state(now);
        s.retry_next_at = Some(now);
        assert!(s.schedule_due(now) && s.retry_due(now));
        s.enabled = false;
        assert!(!s.schedule_due(now) && !s.retry_due(now));
    }

    #[test]
    fn test_enum_names() {
        assert_eq!("backup".parse::<TaskCategory>().unwrap(), TaskCategory::Backup);
        assert!("chores".parse::<TaskCategory>().is_err());
        assert_eq!("exponential".parse::<BackoffKind>().unwrap(), BackoffKind::Exponential);
        for kind in [TriggerKind::Scheduled, TriggerKind::CatchUp, TriggerKind::Manual, TriggerKind::Retry] {
            assert_eq!(TriggerKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RunOutcome::parse("retry_scheduled"), Some(RunOutcome::RetryScheduled));
    }
}
