//! Poll-with-deadline primitive
//!
//! Every "wait" in this crate is a loop of non-blocking checks separated by
//! sleeps. [`Poll`] owns the interval, the optional deadline and the
//! cancellation token, so each loop only states its stop condition.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of one poll sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Slept a full (or deadline-clipped) interval; check again
    Ready,
    /// The deadline has passed
    Expired,
    /// The cancellation token fired during the sleep
    Interrupted,
}

/// Sleep scheduler for one polling loop
#[derive(Debug, Clone)]
pub struct Poll {
    interval: Duration,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Poll {
    /// Poll every `interval` with no deadline
    pub fn new(interval: Duration, cancel: &CancellationToken) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            deadline: None,
            cancel: cancel.clone(),
        }
    }

    /// Stop after `max_wait` measured from now; `None` waits indefinitely
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.deadline = max_wait.map(|wait| Instant::now() + wait);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleep one interval, clipped so the deadline is never overshot
    pub async fn sleep(&self) -> Wake {
        if self.cancel.is_cancelled() {
            return Wake::Interrupted;
        }

        let nap = match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Wake::Expired;
                }
                remaining.min(self.interval)
            }
            None => self.interval,
        };

        tokio::select! {
            _ = tokio::time::sleep(nap) => {
                if self.is_expired() {
                    Wake::Expired
                } else {
                    Wake::Ready
                }
            }
            _ = self.cancel.cancelled() => Wake::Interrupted,
        }
    }
}

/// Map the millisecond convention where `-1` means wait forever
pub fn max_wait_from_millis(millis: i64) -> Option<Duration> {
    u64::try_from(millis).ok().map(Duration::from_millis)
}
