//! Hard deadlines around blocking operations.
//!
//! [`run_bounded`] is the only way the endpoint waits on anything. When the
//! deadline passes, the wrapped future is dropped (abandoning whatever
//! socket call it was parked in) and a [`FaultError::Timeout`] comes back.
//! Tearing down the abandoned connection is the caller's job.
//!
//! Deadlines are `tokio::time::Instant`s so that a paused tokio clock or a
//! turmoil simulation drives them.

use std::{future::Future, time::Duration};

use tokio::time::Instant;

use crate::error::{FaultError, Result};

/// Point in time after which a guarded operation fails.
pub type Deadline = Instant;

/// Deadline `limit` from now.
pub fn deadline_after(limit: Duration) -> Deadline {
    Instant::now() + limit
}

/// Run `operation` until it completes or `deadline` passes.
///
/// The result of a completed operation is returned unchanged. Past the
/// deadline the operation is dropped and `Timeout { operation: what }` is
/// returned.
pub async fn run_bounded<T, E, F>(deadline: Deadline, what: &'static str, operation: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    FaultError: From<E>,
{
    let started = Instant::now();
    match tokio::time::timeout_at(deadline, operation).await {
        Ok(result) => result.map_err(FaultError::from),
        Err(_) => {
            let limit = deadline.saturating_duration_since(started);
            tracing::debug!(operation = what, ?limit, "guarded operation timed out");
            Err(FaultError::Timeout { operation: what, limit })
        },
    }
}

/// Fixed time limit applied to each operation it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutGuard {
    limit: Duration,
}

impl TimeoutGuard {
    /// Guard with the given per-operation limit.
    pub const fn new(limit: Duration) -> Self {
        Self { limit }
    }

    /// Per-operation limit.
    pub const fn limit(&self) -> Duration {
        self.limit
    }

    /// Deadline for an operation started now.
    pub fn deadline(&self) -> Deadline {
        deadline_after(self.limit)
    }

    /// Run `operation` with this guard's limit starting now.
    pub async fn run<T, E, F>(&self, what: &'static str, operation: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        FaultError: From<E>,
    {
        run_bounded(self.deadline(), what, operation).await
    }
}

/// Bounded connect-retry schedule.
///
/// Attempts repeat with a fixed `backoff` until `max_total` has elapsed.
/// The retry count is bounded only by the total budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total time budget for all attempts.
    pub max_total: Duration,
    /// Pause between a refused attempt and the next.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_total: Duration::from_secs(2), backoff: Duration::from_millis(200) }
    }
}
