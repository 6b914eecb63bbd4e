//! SQLite-backed persistence for task state and run history.
//! Survives restarts and is shared by every scheduler instance pointed at
//! the same file. All lease-sensitive writes are single conditional
//! UPDATEs, never read-then-write.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::tasks::{RunOutcome, RunRecord, TaskState, TriggerKind};
use warden_core::Result;

/// Default number of history rows kept per task.
pub const DEFAULT_HISTORY_LIMIT: usize = 200;

const STATE_COLUMNS: &str = "name, schedule, enabled, last_run, last_result, next_run, \
     lock_holder, lock_expires_at, retry_count, retry_next_at";

/// State written when a run finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    /// `(last_run, last_result)`; only for success or terminal failure.
    pub last: Option<(DateTime<Utc>, String)>,
    /// New regular `next_run`; `None` leaves the cadence untouched.
    pub next_run: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub retry_next_at: Option<DateTime<Utc>>,
}

/// What a lease claim must still find in the row. The due decision is made
/// from an earlier read, so the claim re-checks it in the same statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimGuard {
    /// Manual runs: only lease ownership matters.
    Any,
    /// The regular occurrence that was observed due.
    NextRun(DateTime<Utc>),
    /// The pending retry that was observed due.
    RetryAt(DateTime<Utc>),
}

impl ClaimGuard {
    fn params(self) -> (Option<i64>, Option<i64>) {
        match self {
            ClaimGuard::Any => (None, None),
            ClaimGuard::NextRun(at) => (Some(to_ms(at)), None),
            ClaimGuard::RetryAt(at) => (None, Some(to_ms(at))),
        }
    }
}

/// SQLite persistence store for scheduler state.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
    history_limit: usize,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
            history_limit: DEFAULT_HISTORY_LIMIT,
        };
        db.migrate()?;
        Ok(db)
    }

    /// Override how many history rows are kept per task.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn().execute_batch(
            "
            -- One row per registered task. Timestamps are epoch milliseconds.
            CREATE TABLE IF NOT EXISTS task_state (
                name TEXT PRIMARY KEY,
                schedule TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_run INTEGER,
                last_result TEXT,
                next_run INTEGER NOT NULL,
                lock_holder TEXT,
                lock_expires_at INTEGER,
                retry_count INTEGER,
                retry_next_at INTEGER
            );

            -- Append-only run history, trimmed per task.
            CREATE TABLE IF NOT EXISTS task_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_name TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER NOT NULL,
                outcome TEXT NOT NULL,          -- success, failure, retry_scheduled
                detail TEXT,
                trigger_kind TEXT NOT NULL      -- scheduled, catch_up, manual, retry
            );

            CREATE INDEX IF NOT EXISTS idx_task_history_name ON task_history(task_name, id);
            CREATE INDEX IF NOT EXISTS idx_task_history_finished ON task_history(finished_at);
            ",
        )?;
        Ok(())
    }

    // ─── Task State ──────────────────────────────────────────

    /// Insert the row for `name` if absent. Returns `true` when created.
    pub fn seed(&self, name: &str, schedule: &str, next_run: DateTime<Utc>) -> Result<bool> {
        let n = self.conn().execute(
            "INSERT OR IGNORE INTO task_state (name, schedule, enabled, next_run)
             VALUES (?1, ?2, 1, ?3)",
            params![name, schedule, to_ms(next_run)],
        )?;
        Ok(n == 1)
    }

    /// Load one task row.
    pub fn get_state(&self, name: &str) -> Result<Option<TaskState>> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM task_state WHERE name = ?1");
        let state = self
            .conn()
            .query_row(&sql, [name], row_to_state)
            .optional()?;
        Ok(state)
    }

    /// Load all task rows, ordered by name.
    pub fn list_states(&self) -> Result<Vec<TaskState>> {
        let conn = self.conn();
        let sql = format!("SELECT {STATE_COLUMNS} FROM task_state ORDER BY name");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_state)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Enable: flips the flag and installs a fresh `next_run`. No-op
    /// (returns `false`) if already enabled. A pending retry at or past the
    /// new `next_run` is absorbed by the regular run.
    pub fn enable(&self, name: &str, next_run: DateTime<Utc>) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE task_state SET
                 enabled = 1,
                 next_run = ?2,
                 retry_next_at = CASE WHEN retry_next_at >= ?2 THEN NULL ELSE retry_next_at END
             WHERE name = ?1 AND enabled = 0",
            params![name, to_ms(next_run)],
        )?;
        Ok(n == 1)
    }

    /// Disable. No-op (returns `false`) if already disabled.
    pub fn disable(&self, name: &str) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE task_state SET enabled = 0 WHERE name = ?1 AND enabled = 1",
            [name],
        )?;
        Ok(n == 1)
    }

    /// Replace the effective schedule and its `next_run`. A pending retry at
    /// or past the new `next_run` is absorbed by the regular run.
    pub fn set_schedule(&self, name: &str, schedule: &str, next_run: DateTime<Utc>) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE task_state SET
                 schedule = ?2,
                 next_run = ?3,
                 retry_next_at = CASE WHEN retry_next_at >= ?3 THEN NULL ELSE retry_next_at END
             WHERE name = ?1",
            params![name, schedule, to_ms(next_run)],
        )?;
        Ok(n == 1)
    }

    /// Compare-and-set on `next_run`: only moves it if nobody else has.
    pub fn advance_next_run(
        &self,
        name: &str,
        expected: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE task_state SET next_run = ?3 WHERE name = ?1 AND next_run = ?2",
            params![name, to_ms(expected), to_ms(next_run)],
        )?;
        Ok(n == 1)
    }

    // ─── Leases ──────────────────────────────────────────────

    /// Claim the lease if it is free or expired and the row still matches
    /// `guard`. Check and claim happen in one statement, so two contenders
    /// can never both win, and a peer that already ran the occurrence
    /// leaves nothing to claim.
    pub fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        guard: ClaimGuard,
    ) -> Result<bool> {
        let (expected_next_run, expected_retry_at) = guard.params();
        let n = self.conn().execute(
            "UPDATE task_state SET lock_holder = ?2, lock_expires_at = ?3
             WHERE name = ?1
               AND (lock_holder IS NULL OR lock_expires_at IS NULL OR lock_expires_at <= ?4)
               AND (?5 IS NULL OR (enabled = 1 AND next_run = ?5))
               AND (?6 IS NULL OR (enabled = 1 AND retry_next_at = ?6))",
            params![
                name,
                holder,
                to_ms(expires_at),
                to_ms(now),
                expected_next_run,
                expected_retry_at,
            ],
        )?;
        Ok(n == 1)
    }

    /// Clear the lease only if `holder` still owns it.
    pub fn release_lease(&self, name: &str, holder: &str) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE task_state SET lock_holder = NULL, lock_expires_at = NULL
             WHERE name = ?1 AND lock_holder = ?2",
            params![name, holder],
        )?;
        Ok(n == 1)
    }

    /// Persist a run's effect on task state, guarded by lease ownership.
    /// Returns `false` if `holder` no longer owns the lease.
    pub fn finish_run(&self, name: &str, holder: &str, done: &RunCompletion) -> Result<bool> {
        let (last_run, last_result) = match &done.last {
            Some((at, result)) => (Some(to_ms(*at)), Some(result.as_str())),
            None => (None, None),
        };
        let n = self.conn().execute(
            "UPDATE task_state SET
                 last_run = COALESCE(?3, last_run),
                 last_result = COALESCE(?4, last_result),
                 next_run = COALESCE(?5, next_run),
                 retry_count = ?6,
                 retry_next_at = ?7
             WHERE name = ?1 AND lock_holder = ?2",
            params![
                name,
                holder,
                last_run,
                last_result,
                done.next_run.map(to_ms),
                done.retry_count,
                done.retry_next_at.map(to_ms),
            ],
        )?;
        Ok(n == 1)
    }

    // ─── History ─────────────────────────────────────────────

    /// Append a run record and trim the task's history to the limit.
    pub fn record_run(&self, record: &RunRecord) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO task_history (task_name, started_at, finished_at, outcome, detail, trigger_kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.task_name,
                to_ms(record.started_at),
                to_ms(record.finished_at),
                record.outcome.as_str(),
                record.detail,
                record.trigger_kind.as_str(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "DELETE FROM task_history
             WHERE task_name = ?1
               AND id NOT IN (
                   SELECT id FROM task_history WHERE task_name = ?1 ORDER BY id DESC LIMIT ?2
               )",
            params![record.task_name, self.history_limit as i64],
        )?;
        Ok(id)
    }

    /// Most recent runs for a task, newest first.
    pub fn history(&self, name: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_name, started_at, finished_at, outcome, detail, trigger_kind
             FROM task_history WHERE task_name = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![name, limit as i64], |row| {
            let outcome: String = row.get(4)?;
            let trigger: String = row.get(6)?;
            Ok(RunRecord {
                id: row.get(0)?,
                task_name: row.get(1)?,
                started_at: from_ms(row.get(2)?),
                finished_at: from_ms(row.get(3)?),
                outcome: RunOutcome::parse(&outcome).unwrap_or(RunOutcome::Failure),
                detail: row.get(5)?,
                trigger_kind: TriggerKind::parse(&trigger).unwrap_or(TriggerKind::Scheduled),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete history rows that finished before `cutoff`.
    pub fn prune_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let n = self.conn().execute(
            "DELETE FROM task_history WHERE finished_at < ?1",
            [to_ms(cutoff)],
        )?;
        Ok(n)
    }

    /// Delete state and history rows for names not in `registered`.
    /// Returns the orphaned names that were removed.
    pub fn prune_orphans(&self, registered: &[String]) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let orphans: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT name FROM task_state
                 UNION
                 SELECT DISTINCT task_name FROM task_history
                 ORDER BY 1",
            )?;
            let names = stmt.query_map([], |r| r.get::<_, String>(0))?;
            names
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .filter(|n| !registered.contains(n))
                .collect()
        };
        for name in &orphans {
            tx.execute("DELETE FROM task_state WHERE name = ?1", [name])?;
            tx.execute("DELETE FROM task_history WHERE task_name = ?1", [name])?;
        }
        tx.commit()?;
        Ok(orphans)
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_state(row: &Row<'_>) -> rusqlite::Result<TaskState> {
    Ok(TaskState {
        name: row.get(0)?,
        schedule: row.get(1)?,
        enabled: row.get::<_, i32>(2)? != 0,
        last_run: row.get::<_, Option<i64>>(3)?.map(from_ms),
        last_result: row.get(4)?,
        next_run: from_ms(row.get(5)?),
        lock_holder: row.get(6)?,
        lock_expires_at: row.get::<_, Option<i64>>(7)?.map(from_ms),
        retry_count: row.get(8)?,
        retry_next_at: row.get::<_, Option<i64>>(9)?.map(from_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 22, 10, 0, 0).unwrap()
    }

    fn record(name: &str, at: DateTime<Utc>, outcome: RunOutcome) -> RunRecord {
        RunRecord {
            id: 0,
            task_name: name.into(),
            started_at: at,
            finished_at: at + Duration::seconds(3),
            outcome,
            detail: Some(format!("{outcome} at {at}")),
            trigger_kind: TriggerKind::Scheduled,
        }
    }

    #[test]
    fn test_open_and_migrate() {
        let dir = std::env::temp_dir().join("warden-sched-db-test");
        std::fs::remove_dir_all(&dir).ok();
        let db = SchedulerDb::open(&dir.join("test.db")).unwrap();
        assert!(db.list_states().unwrap().is_empty());
        drop(db);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_seed_is_idempotent() {
        let db = SchedulerDb::open_in_memory().unwrap();
        assert!(db.seed("cleanup-sessions", "@hourly", t0()).unwrap());
        assert!(!db.seed("cleanup-sessions", "@daily", t0() + Duration::days(1)).unwrap());

        let state = db.get_state("cleanup-sessions").unwrap().unwrap();
        assert_eq!(state.schedule, "@hourly");
        assert_eq!(state.next_run, t0());
        assert!(state.enabled);
        assert!(state.last_run.is_none() && state.lock_holder.is_none());
    }

    #[test]
    fn test_enable_disable_are_idempotent() {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.seed("t", "@hourly", t0()).unwrap();
        assert!(!db.enable("t", t0()).unwrap());
        assert!(db.disable("t").unwrap());
        assert!(!db.disable("t").unwrap());
        assert!(db.enable("t", t0() + Duration::hours(2)).unwrap());
        assert_eq!(db.get_state("t").unwrap().unwrap().next_run, t0() + Duration::hours(2));
    }

    #[test]
    fn test_lease_exclusive_until_expiry() {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.seed("t", "@hourly", t0()).unwrap();
        let ttl = Duration::minutes(5);

        assert!(db.try_acquire_lease("t", "a", t0(), t0() + ttl, ClaimGuard::Any).unwrap());
        assert!(!db.try_acquire_lease("t", "b", t0(), t0() + ttl, ClaimGuard::Any).unwrap());
        assert!(!db.try_acquire_lease("t", "a", t0(), t0() + ttl, ClaimGuard::Any).unwrap());

        // Expired → reclaimable by anyone.
        let later = t0() + ttl;
        assert!(db.try_acquire_lease("t", "b", later, later + ttl, ClaimGuard::Any).unwrap());
        // Stale holder can't release the new owner's lease.
        assert!(!db.release_lease("t", "a").unwrap());
        assert!(db.release_lease("t", "b").unwrap());
        assert!(db.get_state("t").unwrap().unwrap().lock_holder.is_none());
    }

    #[test]
    fn test_finish_run_guarded_by_holder() {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.seed("t", "@hourly", t0()).unwrap();
        db.try_acquire_lease("t", "a", t0(), t0() + Duration::minutes(5), ClaimGuard::Any)
            .unwrap();

        let done = RunCompletion {
            last: Some((t0(), "success".into())),
            next_run: Some(t0() + Duration::hours(1)),
            retry_count: None,
            retry_next_at: None,
        };
        assert!(!db.finish_run("t", "b", &done).unwrap());
        assert!(db.finish_run("t", "a", &done).unwrap());

        let state = db.get_state("t").unwrap().unwrap();
        assert_eq!(state.last_run, Some(t0()));
        assert_eq!(state.last_result.as_deref(), Some("success"));
        assert_eq!(state.next_run, t0() + Duration::hours(1));

        // A retry-only completion keeps last_run and next_run.
        let retry = RunCompletion {
            last: None,
            next_run: None,
            retry_count: Some(1),
            retry_next_at: Some(t0() + Duration::minutes(10)),
        };
        assert!(db.finish_run("t", "a", &retry).unwrap());
        let state = db.get_state("t").unwrap().unwrap();
        assert_eq!(state.last_run, Some(t0()));
        assert_eq!(state.next_run, t0() + Duration::hours(1));
        assert_eq!(state.retry_count, Some(1));
    }

    #[test]
    fn test_guarded_claim_requires_observed_occurrence() {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.seed("t", "@hourly", t0()).unwrap();
        let ttl = Duration::minutes(5);

        // A peer already ran the 10:00 occurrence and moved the cadence on.
        assert!(db.advance_next_run("t", t0(), t0() + Duration::hours(1)).unwrap());
        assert!(!db.try_acquire_lease("t", "b", t0(), t0() + ttl, ClaimGuard::NextRun(t0())).unwrap());
        assert!(db.get_state("t").unwrap().unwrap().lock_holder.is_none());

        let next = t0() + Duration::hours(1);
        assert!(db.try_acquire_lease("t", "b", next, next + ttl, ClaimGuard::NextRun(next)).unwrap());
        db.release_lease("t", "b").unwrap();

        // Retry claims match on retry_next_at, and never on a disabled task.
        let retry_at = t0() + Duration::minutes(10);
        let pending = RunCompletion {
            last: None,
            next_run: None,
            retry_count: Some(1),
            retry_next_at: Some(retry_at),
        };
        db.try_acquire_lease("t", "a", t0(), t0() + ttl, ClaimGuard::Any).unwrap();
        db.finish_run("t", "a", &pending).unwrap();
        db.release_lease("t", "a").unwrap();
        assert!(!db.try_acquire_lease("t", "b", retry_at, retry_at + ttl, ClaimGuard::RetryAt(t0())).unwrap());
        db.disable("t").unwrap();
        assert!(!db.try_acquire_lease("t", "b", retry_at, retry_at + ttl, ClaimGuard::RetryAt(retry_at)).unwrap());
        db.enable("t", next).unwrap();
        assert!(db.try_acquire_lease("t", "b", retry_at, retry_at + ttl, ClaimGuard::RetryAt(retry_at)).unwrap());
    }

    #[test]
    fn test_schedule_change_absorbs_later_retry() {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.seed("t", "@daily", t0() + Duration::hours(14)).unwrap();
        db.try_acquire_lease("t", "a", t0(), t0() + Duration::minutes(5), ClaimGuard::Any).unwrap();
        let pending = RunCompletion {
            last: None,
            next_run: None,
            retry_count: Some(1),
            retry_next_at: Some(t0() + Duration::hours(1)),
        };
        db.finish_run("t", "a", &pending).unwrap();
        db.release_lease("t", "a").unwrap();

        // Earlier retry survives a schedule change that keeps it first.
        db.set_schedule("t", "@every 2h", t0() + Duration::hours(2)).unwrap();
        let state = db.get_state("t").unwrap().unwrap();
        assert_eq!(state.retry_next_at, Some(t0() + Duration::hours(1)));

        // A denser schedule overtakes it.
        db.set_schedule("t", "*/5 * * * *", t0() + Duration::minutes(5)).unwrap();
        let state = db.get_state("t").unwrap().unwrap();
        assert_eq!(state.retry_next_at, None);
        assert_eq!(state.retry_count, Some(1));
    }

    #[test]
    fn test_advance_next_run_is_compare_and_set() {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.seed("t", "@hourly", t0()).unwrap();
        assert!(db.advance_next_run("t", t0(), t0() + Duration::hours(1)).unwrap());
        assert!(!db.advance_next_run("t", t0(), t0() + Duration::hours(2)).unwrap());
    }

    #[test]
    fn test_history_newest_first_and_trimmed() {
        let db = SchedulerDb::open_in_memory().unwrap().with_history_limit(3);
        for i in 0..5 {
            db.record_run(&record("t", t0() + Duration::hours(i), RunOutcome::Success))
                .unwrap();
        }
        db.record_run(&record("other", t0(), RunOutcome::Failure)).unwrap();

        let history = db.history("t", 10).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].started_at, t0() + Duration::hours(4));
        assert_eq!(history[2].started_at, t0() + Duration::hours(2));
        assert_eq!(db.history("t", 1).unwrap().len(), 1);
        assert_eq!(db.history("other", 10).unwrap()[0].outcome, RunOutcome::Failure);
    }

    #[test]
    fn test_prune_history_and_orphans() {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.seed("kept", "@hourly", t0()).unwrap();
        db.seed("removed", "@hourly", t0()).unwrap();
        db.record_run(&record("kept", t0() - Duration::days(40), RunOutcome::Success))
            .unwrap();
        db.record_run(&record("kept", t0(), RunOutcome::Success)).unwrap();
        db.record_run(&record("ghost", t0(), RunOutcome::Success)).unwrap();

        assert_eq!(db.prune_history_before(t0() - Duration::days(30)).unwrap(), 1);

        let orphans = db.prune_orphans(&["kept".to_string()]).unwrap();
        assert_eq!(orphans, vec!["ghost".to_string(), "removed".to_string()]);
        assert!(db.get_state("removed").unwrap().is_none());
        assert!(db.history("ghost", 10).unwrap().is_empty());
        assert_eq!(db.history("kept", 10).unwrap().len(), 1);
    }
}
