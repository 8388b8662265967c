use std::time::{Duration, Instant};

/// Wall-clock budget threaded through every blocking primitive.
///
/// A budget is either unbounded (the original operation surface's
/// `timeout <= 0`) or anchored to a deadline. Each blocking step re-derives
/// the remaining time from the wall clock, so time consumed by earlier steps
/// within the same call is never spent twice; a non-positive remainder is a
/// timeout failure, not an infinite wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBudget {
    deadline: Option<Instant>,
}

impl TimeBudget {
    /// A budget that never expires.
    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    /// A budget expiring `limit` from now.
    pub fn bounded(limit: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + limit),
        }
    }

    /// Millisecond constructor matching the operation surface: a
    /// non-positive timeout waits indefinitely.
    pub fn from_millis(millis: i64) -> Self {
        if millis <= 0 {
            Self::unbounded()
        } else {
            Self::bounded(Duration::from_millis(millis as u64))
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.deadline.is_none()
    }

    /// Remaining wall-clock time. `None` means unbounded; `Some(ZERO)` means
    /// the budget is spent.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(remaining) if remaining.is_zero())
    }

    /// Remaining time for a single blocking step, capped at `cap` so pollable
    /// waits can re-check their condition periodically.
    pub fn remaining_capped(&self, cap: Duration) -> Duration {
        match self.remaining() {
            None => cap,
            Some(remaining) => remaining.min(cap),
        }
    }
}
