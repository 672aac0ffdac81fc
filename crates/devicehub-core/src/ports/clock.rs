//! [`Clock`]: the single source of time injected throughout the runtime so
//! tests can drive guards, retries, and restart backoff deterministically.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A source of wall-clock time and sleep.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Suspend for `duration`. `TestClock` resolves this as soon as the test
    /// advances virtual time past the deadline, rather than actually
    /// sleeping.
    async fn sleep(&self, duration: chrono::Duration);
}

/// Real time, backed by the OS clock and `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: chrono::Duration) {
        let std_duration = duration.to_std().unwrap_or(std::time::Duration::ZERO);
        tokio::time::sleep(std_duration).await;
    }
}

struct TestClockState {
    now: DateTime<Utc>,
    waiters: Vec<(DateTime<Utc>, tokio::sync::oneshot::Sender<()>)>,
}

/// A deterministic clock for tests: time only advances when [`TestClock::advance`]
/// is called, so guard/retry/restart timing assertions are exact instead of
/// racing real wall-clock sleeps.
#[derive(Clone)]
pub struct TestClock {
    state: Arc<Mutex<TestClockState>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TestClockState {
                now: start,
                waiters: Vec::new(),
            })),
        }
    }

    /// Move virtual time forward by `duration`, waking any sleepers whose
    /// deadline has now passed.
    pub async fn advance(&self, duration: chrono::Duration) {
        let mut state = self.state.lock().await;
        state.now += duration;
        let now = state.now;
        let mut remaining = Vec::new();
        for (deadline, tx) in state.waiters.drain(..) {
            if deadline <= now {
                let _ = tx.send(());
            } else {
                remaining.push((deadline, tx));
            }
        }
        state.waiters = remaining;
    }
}

#[async_trait::async_trait]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.try_lock().map(|s| s.now).unwrap_or_else(|_| Utc::now())
    }

    async fn sleep(&self, duration: chrono::Duration) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        {
            let mut state = self.state.lock().await;
            let deadline = state.now + duration;
            if deadline <= state.now {
                return;
            }
            state.waiters.push((deadline, tx));
        }
        let _ = rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clock_wakes_sleeper_on_advance() {
        let clock = TestClock::new(Utc::now());
        let clock2 = clock.clone();
        let handle = tokio::spawn(async move {
            clock2.sleep(chrono::Duration::milliseconds(50)).await;
        });
        tokio::task::yield_now().await;
        clock.advance(chrono::Duration::milliseconds(100)).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn system_clock_now_increases() {
        let clock = SystemClock;
        let a = clock.now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = clock.now();
        assert!(b >= a);
    }
}
