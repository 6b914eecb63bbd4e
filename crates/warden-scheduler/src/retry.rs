//! Retry/backoff controller.
//!
//! Decides what a finished run does to a task's retry window. Retries
//! run alongside the regular cadence: they never move `next_run`, and a
//! retry that would not land strictly before the next regular run is
//! absorbed by that run instead.

use chrono::{DateTime, Duration, Utc};

use crate::tasks::{BackoffKind, RetryPolicy, RunOutcome};

/// What the controller decided after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Success, or no policy: the retry window is cleared.
    Clear,
    /// Failure with attempts left.
    Retry {
        /// New `retry_count`.
        attempt: u32,
        delay: Duration,
        /// `None` when the next regular run comes first.
        at: Option<DateTime<Utc>>,
    },
    /// Failure with every attempt used; window cleared.
    Exhausted { attempts: u32 },
}

impl RetryDecision {
    /// Outcome recorded in history for a failed run with this decision.
    pub fn failure_outcome(&self) -> RunOutcome {
        match self {
            RetryDecision::Retry { .. } => RunOutcome::RetryScheduled,
            _ => RunOutcome::Failure,
        }
    }

    /// `(retry_count, retry_next_at)` to persist.
    pub fn persisted(&self) -> (Option<u32>, Option<DateTime<Utc>>) {
        match self {
            RetryDecision::Retry { attempt, at, .. } => (Some(*attempt), *at),
            _ => (None, None),
        }
    }
}

/// Delay before retry number `retry_count + 1`.
pub fn delay(policy: &RetryPolicy, retry_count: u32) -> Duration {
    match policy.backoff {
        BackoffKind::Fixed => policy.base_delay,
        BackoffKind::Exponential => 2i32
            .checked_pow(retry_count)
            .and_then(|factor| policy.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX),
    }
}

/// Decide the retry window after a failed run.
pub fn on_failure(
    policy: Option<&RetryPolicy>,
    retry_count: u32,
    now: DateTime<Utc>,
    next_run: DateTime<Utc>,
) -> RetryDecision {
    let Some(policy) = policy else {
        return RetryDecision::Clear;
    };
    if retry_count >= policy.max_attempts {
        return RetryDecision::Exhausted {
            attempts: retry_count,
        };
    }

    let delay = delay(policy, retry_count);
    let at = now
        .checked_add_signed(delay)
        .filter(|at| *at < next_run);
    RetryDecision::Retry {
        attempt: retry_count + 1,
        delay,
        at,
    }
}

/// Human-readable duration for history details ("10m", "1h30m", "45s").
pub fn describe(d: Duration) -> String {
    let mut secs = d.num_seconds().max(0);
    if secs == 0 {
        return "0s".into();
    }
    let mut out = String::new();
    for (unit, size) in [("d", 86_400), ("h", 3600), ("m", 60), ("s", 1)] {
        if secs >= size {
            out.push_str(&format!("{}{unit}", secs / size));
            secs %= size;
        }
    }
    out
}
