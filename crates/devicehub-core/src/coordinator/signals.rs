//! The signal table backing `AwaitSignal`: external callers release a named
//! signal, waking every plan run currently blocked on it.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SignalError {
    #[error("timed out waiting for signal")]
    Timeout,
    #[error("signal table shut down")]
    Closed,
}

/// A table of named one-shot-per-wait signals. Lazily creates a broadcast
/// channel per id on first use; `release` wakes every waiter subscribed at
/// that moment.
#[derive(Default)]
pub struct SignalTable {
    channels: DashMap<String, broadcast::Sender<()>>,
}

impl SignalTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, id: &str) -> broadcast::Sender<()> {
        self.channels.entry(id.to_string()).or_insert_with(|| broadcast::channel(16).0).clone()
    }

    /// Blocks until `release(id)` is called, or `timeout` elapses.
    pub async fn await_signal(&self, id: &str, clock: &dyn crate::ports::Clock, timeout: Option<Duration>) -> Result<(), SignalError> {
        let mut rx = self.channel(id).subscribe();
        let recv = async {
            rx.recv().await.map(|_| ()).map_err(|_| SignalError::Closed)
        };
        match timeout {
            None => recv.await,
            Some(duration) => {
                let sleep = clock.sleep(chrono::Duration::from_std(duration).unwrap_or_default());
                tokio::pin!(recv);
                tokio::pin!(sleep);
                tokio::select! {
                    result = &mut recv => result,
                    _ = &mut sleep => Err(SignalError::Timeout),
                }
            }
        }
    }

    /// Wakes every current waiter for `id`.
    pub fn release(&self, id: &str) {
        if let Some(tx) = self.channels.get(id) {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{SystemClock, TestClock};
    use std::sync::Arc;

    #[tokio::test]
    async fn release_wakes_waiting_call() {
        let table = Arc::new(SignalTable::new());
        let clock = Arc::new(SystemClock);
        let waiter = {
            let table = table.clone();
            let clock = clock.clone();
            tokio::spawn(async move { table.await_signal("done", clock.as_ref(), None).await })
        };
        tokio::task::yield_now().await;
        table.release("done");
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn timeout_elapses_without_release() {
        let table = SignalTable::new();
        let clock = TestClock::new(chrono::Utc::now());
        let waiter = {
            let clock = clock.clone();
            async move { table.await_signal("never", &clock, Some(Duration::from_secs(1))).await }
        };
        tokio::pin!(waiter);
        tokio::task::yield_now().await;
        clock.advance(chrono::Duration::seconds(2)).await;
        let result = waiter.await;
        assert!(matches!(result, Err(SignalError::Timeout)));
    }
}
