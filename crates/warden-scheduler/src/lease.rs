//! Lock/lease manager — per-task, time-bounded execution claims.
//!
//! A lease lives in the task's row of the shared store, so the guarantee
//! holds across independent processes, not just within one. A holder that
//! outlives its TTL can have its lease reclaimed; tasks are expected to be
//! idempotent for that case.

use chrono::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::persistence::{ClaimGuard, SchedulerDb};
use crate::tasks::{TaskCategory, TaskState};
use warden_core::{Result, WardenError};

/// Acquires and releases task leases against the store.
#[derive(Clone)]
pub struct LeaseManager {
    db: Arc<SchedulerDb>,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(db: Arc<SchedulerDb>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Claim the lease for `ttl` if it is free or expired and the row still
    /// matches `guard`.
    pub fn try_acquire(
        &self,
        task_name: &str,
        holder_id: &str,
        ttl: Duration,
        guard: ClaimGuard,
    ) -> Result<bool> {
        let now = self.clock.now();
        let acquired = self
            .db
            .try_acquire_lease(task_name, holder_id, now, now + ttl, guard)?;
        if acquired {
            tracing::debug!(task = task_name, holder = holder_id, "🔒 lease acquired");
        } else {
            tracing::debug!(task = task_name, holder = holder_id, "lease contention");
        }
        Ok(acquired)
    }

    /// Like [`try_acquire`](Self::try_acquire) but contention is
    /// `LeaseContention`.
    pub fn acquire(&self, task_name: &str, holder_id: &str, ttl: Duration, guard: ClaimGuard) -> Result<()> {
        if self.try_acquire(task_name, holder_id, ttl, guard)? {
            Ok(())
        } else {
            Err(WardenError::LeaseContention(task_name.to_string()))
        }
    }

    /// Release the lease if `holder_id` still owns it.
    pub fn release(&self, task_name: &str, holder_id: &str) -> Result<()> {
        if self.db.release_lease(task_name, holder_id)? {
            tracing::debug!(task = task_name, holder = holder_id, "🔓 lease released");
        } else {
            tracing::warn!(
                task = task_name,
                holder = holder_id,
                "lease was no longer held at release (expired and reclaimed?)"
            );
        }
        Ok(())
    }

    /// `true` when the row carries no usable lease: absent, or past expiry.
    pub fn is_expired(&self, state: &TaskState) -> bool {
        !state.lease_active(self.clock.now())
    }
}

/// Lease TTL for a category, honouring config overrides keyed by category name.
pub fn lease_ttl_for(category: TaskCategory, overrides: &BTreeMap<String, u64>) -> Duration {
    overrides
        .get(category.as_str())
        .and_then(|secs| seconds(*secs))
        .unwrap_or_else(|| category.default_lease_ttl())
}

/// Whole seconds as a `Duration`, `None` when out of range.
pub fn seconds(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

/// Reject TTL overrides that don't fit a `Duration`.
pub fn validate_ttl_overrides(overrides: &BTreeMap<String, u64>) -> Result<()> {
    for (category, secs) in overrides {
        if *secs == 0 || seconds(*secs).is_none() {
            return Err(WardenError::Config(format!(
                "lease_ttl_secs.{category} = {secs} is out of range"
            )));
        }
    }
    Ok(())
}

/// Identity used as `lock_holder`: `hostname:pid:short-uuid`.
pub fn instance_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}:{}:{}", std::process::id(), &nonce[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::Barrier;

    fn setup() -> (Arc<SchedulerDb>, Arc<ManualClock>, LeaseManager) {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 0).unwrap(),
        ));
        db.seed("daily-forecast", "0 6 * * *", clock.now()).unwrap();
        let leases = LeaseManager::new(db.clone(), clock.clone());
        (db, clock, leases)
    }

    #[test]
    fn test_acquire_release_cycle() {
        let (db, _clock, leases) = setup();
        let ttl = Duration::minutes(5);
        assert!(leases.try_acquire("daily-forecast", "a", ttl, ClaimGuard::Any).unwrap());
        assert!(matches!(
            leases.acquire("daily-forecast", "b", ttl, ClaimGuard::Any),
            Err(WardenError::LeaseContention(_))
        ));

        let state = db.get_state("daily-forecast").unwrap().unwrap();
        assert!(!leases.is_expired(&state));

        leases.release("daily-forecast", "a").unwrap();
        let state = db.get_state("daily-forecast").unwrap().unwrap();
        assert!(leases.is_expired(&state));
        assert!(leases.try_acquire("daily-forecast", "b", ttl, ClaimGuard::Any).unwrap());
    }

    #[test]
    fn test_expired_lease_is_reclaimed_and_old_holder_cannot_release() {
        let (db, clock, leases) = setup();
        let ttl = Duration::minutes(5);
        assert!(leases.try_acquire("daily-forecast", "a", ttl, ClaimGuard::Any).unwrap());

        clock.advance(Duration::minutes(6));
        let state = db.get_state("daily-forecast").unwrap().unwrap();
        assert_eq!(state.lock_holder.as_deref(), Some("a"));
        assert!(leases.is_expired(&state));

        assert!(leases.try_acquire("daily-forecast", "b", ttl, ClaimGuard::Any).unwrap());
        leases.release("daily-forecast", "a").unwrap();
        let state = db.get_state("daily-forecast").unwrap().unwrap();
        assert_eq!(state.lock_holder.as_deref(), Some("b"));
    }

    #[test]
    fn test_concurrent_acquire_across_connections() {
        let dir = std::env::temp_dir().join("warden-lease-race-test");
        std::fs::remove_dir_all(&dir).ok();
        let path = dir.join("shared.db");
        let start = Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 0).unwrap();
        let rounds = 25;

        // Two independent connections stand in for two processes.
        let db_a = Arc::new(SchedulerDb::open(&path).unwrap());
        let db_b = Arc::new(SchedulerDb::open(&path).unwrap());
        for i in 0..rounds {
            db_a.seed(&format!("task-{i}"), "@hourly", start).unwrap();
        }

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [("a", db_a), ("b", db_b)]
            .into_iter()
            .map(|(holder, db)| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start));
                    let leases = LeaseManager::new(db, clock);
                    let mut won = Vec::new();
                    for i in 0..rounds {
                        barrier.wait();
                        if leases
                            .try_acquire(&format!("task-{i}"), holder, Duration::minutes(5), ClaimGuard::Any)
                            .unwrap()
                        {
                            won.push(i);
                        }
                    }
                    won
                })
            })
            .collect();

        let results: Vec<Vec<i32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let mut all: Vec<i32> = results.concat();
        all.sort_unstable();
        assert_eq!(all, (0..rounds).collect::<Vec<_>>(), "each lease won exactly once");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_ttl_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("backup".to_string(), 60);
        assert_eq!(lease_ttl_for(TaskCategory::Backup, &overrides), Duration::seconds(60));
        assert_eq!(
            lease_ttl_for(TaskCategory::Weather, &overrides),
            TaskCategory::Weather.default_lease_ttl()
        );
    }

    #[test]
    fn test_ttl_override_range() {
        let mut overrides = BTreeMap::new();
        overrides.insert("backup".to_string(), u64::MAX);
        assert_eq!(
            lease_ttl_for(TaskCategory::Backup, &overrides),
            TaskCategory::Backup.default_lease_ttl()
        );
        assert!(matches!(validate_ttl_overrides(&overrides), Err(WardenError::Config(_))));

        overrides.insert("backup".to_string(), 0);
        assert!(validate_ttl_overrides(&overrides).is_err());
        overrides.insert("backup".to_string(), 900);
        assert!(validate_ttl_overrides(&overrides).is_ok());
    }

    #[test]
    fn test_instance_id_shape() {
        let a = instance_id();
        let b = instance_id();
        assert_ne!(a, b);
        assert_eq!(a.split(':').count(), 3);
    }
}
