//! The restart policy loop run against a device that has entered `Failed`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::blueprint::RestartPolicy;
use crate::ports::Clock;

/// Tracks restart attempts for one device across its lifetime, resetting on
/// a successful start if the policy asks for it.
pub struct RestartTracker {
    policy: RestartPolicy,
    clock: Arc<dyn Clock>,
    attempts: Mutex<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Caller should wait `delay`, then post `Reset` followed by `Start`.
    RetryAfter { attempt: u32 },
    /// `maxAttempts` exhausted; the device remains `Failed`.
    Exhausted,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock, attempts: Mutex::new(0) }
    }

    /// Called when the device enters `Failed`. Returns the outcome and, if
    /// retrying, waits out the backoff before returning.
    pub async fn on_failure(&self) -> RestartOutcome {
        let attempt = {
            let mut attempts = self.attempts.lock();
            *attempts += 1;
            *attempts
        };
        if attempt > self.policy.max_attempts {
            return RestartOutcome::Exhausted;
        }
        let delay = self.policy.strategy.delay_for_attempt(attempt);
        self.clock.sleep(chrono::Duration::from_std(delay).unwrap_or_default()).await;
        RestartOutcome::RetryAfter { attempt }
    }

    /// Called when a start succeeds after one or more failed attempts.
    pub fn on_success(&self) {
        if self.policy.reset_on_success {
            *self.attempts.lock() = 0;
        }
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::BackoffStrategy;
    use crate::ports::TestClock;
    use std::time::Duration;

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let policy = RestartPolicy::new(2, BackoffStrategy::Fixed(Duration::from_millis(10)), true);
        let tracker = RestartTracker::new(policy, clock.clone());

        let clock2 = clock.clone();
        let advance_task = tokio::spawn(async move {
            for _ in 0..3 {
                tokio::task::yield_now().await;
                clock2.advance(chrono::Duration::milliseconds(10)).await;
            }
        });

        assert_eq!(tracker.on_failure().await, RestartOutcome::RetryAfter { attempt: 1 });
        assert_eq!(tracker.on_failure().await, RestartOutcome::RetryAfter { attempt: 2 });
        assert_eq!(tracker.on_failure().await, RestartOutcome::Exhausted);
        advance_task.await.unwrap();
    }

    #[tokio::test]
    async fn reset_on_success_clears_attempts() {
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let policy = RestartPolicy::new(3, BackoffStrategy::Fixed(Duration::from_millis(5)), true);
        let tracker = RestartTracker::new(policy, clock.clone());
        {
            let mut attempts = tracker.attempts.lock();
            *attempts = 2;
        }
        tracker.on_success();
        assert_eq!(tracker.attempts(), 0);
    }
}
