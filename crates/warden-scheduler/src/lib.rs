//! # Warden Scheduler
//!
//! Persistent, catch-up-aware, lease-safe periodic task scheduler.
//!
//! ## Design Principles
//! - SQLite persistence: schedules, leases and history survive restarts
//! - Shared store, many instances: a task runs on at most one of them at a time
//! - Tokio timers only; work units run on their own tasks
//! - Missed runs: one catch-up inside the window, otherwise skip forward
//! - Retries run alongside the regular cadence, never instead of it
//!
//! ## Architecture
//! ```text
//! spawn_scheduler (tokio interval)
//!   └── SchedulerEngine::tick
//!         ├── TaskRegistry ── name → WorkUnit, default schedule, category
//!         ├── SchedulerDb ──── task_state / task_history (SQLite, WAL)
//!         ├── classify ─────── scheduled | catch_up | retry | skip missed
//!         ├── LeaseManager ─── conditional UPDATE on lock_holder/lock_expires_at
//!         └── dispatch ─────── tokio::spawn(WorkUnit::run)
//!                                └── finish: next_run, retry window, history, release
//!
//! SchedulerAdmin (CLI + HTTP)
//!   └── list, history, enable, disable, trigger, update_schedule, preview
//! ```

pub mod admin;
pub mod builtin;
pub mod clock;
pub mod engine;
pub mod lease;
pub mod persistence;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod tasks;
pub mod units;

pub use admin::{SchedulerAdmin, TaskSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EngineConfig, RunHandle, SchedulerEngine, TickReport, spawn_scheduler};
pub use lease::LeaseManager;
pub use persistence::SchedulerDb;
pub use registry::{TaskDefinition, TaskOutcome, TaskRegistry, WorkUnit, work_fn};
pub use schedule::Schedule;
pub use tasks::{BackoffKind, RetryPolicy, RunOutcome, RunRecord, TaskCategory, TaskState, TriggerKind};
