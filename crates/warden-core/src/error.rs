//! Warden error types.

/// Top-level error type for the scheduler and its admin surface.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Malformed schedule expression. Always reported to the submitter.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Operation references a task name that is not registered.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Another holder owns an unexpired lease on the task.
    #[error("lease held by another instance: {0}")]
    LeaseContention(String),

    /// A manual trigger hit a task that is already executing.
    #[error("task already running: {0}")]
    AlreadyRunning(String),

    /// Two task definitions share a name.
    #[error("duplicate task name: {0}")]
    DuplicateTask(String),

    /// The task's own work failed.
    #[error("work unit failed: {0}")]
    WorkUnit(String),

    /// Persistent store error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for WardenError {
    fn from(e: rusqlite::Error) -> Self {
        WardenError::Store(e.to_string())
    }
}

impl WardenError {
    /// Short machine-readable kind, used by the HTTP layer.
    pub fn kind(&self) -> &'static str {
        match self {
            WardenError::InvalidSchedule(_) => "invalid_schedule",
            WardenError::TaskNotFound(_) => "task_not_found",
            WardenError::LeaseContention(_) => "lease_contention",
            WardenError::AlreadyRunning(_) => "already_running",
            WardenError::DuplicateTask(_) => "duplicate_task",
            WardenError::WorkUnit(_) => "work_unit",
            WardenError::Store(_) => "store",
            WardenError::Config(_) => "config",
            WardenError::Io(_) => "io",
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, WardenError>;
