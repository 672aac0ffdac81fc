//! Graceful shutdown: a broadcast of intent to stop, observed by every
//! spawned background task (property bindings, the derived-property
//! scheduler, guards, and in-flight transaction runs) so a `Hub` shutdown
//! tears down cleanly instead of leaving orphaned tasks behind.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

/// What triggered a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Manual,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Manual => write!(f, "manual"),
        }
    }
}

/// A cheap, cloneable handle that reports whether shutdown has started.
#[derive(Clone)]
pub struct ShutdownToken {
    receiver: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&mut self) {
        let _ = self.receiver.wait_for(|shutdown| *shutdown).await;
    }
}

/// Coordinates graceful shutdown for one `Hub`: device scopes (bindings,
/// derived scheduler, guards) and in-flight transaction runs all hold a
/// [`ShutdownToken`] and race it against their own work, so a single
/// `shutdown()` call tears the whole runtime down.
pub struct GracefulShutdown {
    timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (shutdown_tx, _rx) = watch::channel(false);
        let (signal_tx, _rx) = broadcast::channel(16);
        Self { timeout, shutdown_tx, signal_tx }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken { receiver: self.shutdown_tx.subscribe() }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    /// Trigger shutdown. Idempotent: a second call is a no-op other than
    /// re-broadcasting the signal.
    pub fn shutdown(&self, signal: ShutdownSignal) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.signal_tx.send(signal);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Runs `future` until it completes or shutdown is requested first,
    /// whichever comes first.
    pub async fn run_until_shutdown<F, T>(&self, future: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let mut token = self.token();
        tokio::select! {
            result = future => Some(result),
            _ = token.cancelled() => None,
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns named, shutdown-aware background tasks and tracks their handles
/// so a caller can wait for them to finish unwinding after `shutdown()`.
pub struct ShutdownAwareTaskSpawner {
    shutdown: Arc<GracefulShutdown>,
}

impl ShutdownAwareTaskSpawner {
    pub fn new(shutdown: Arc<GracefulShutdown>) -> Self {
        Self { shutdown }
    }

    pub fn shutdown(&self) -> &Arc<GracefulShutdown> {
        &self.shutdown
    }

    /// Spawns `future`, which is cancelled (dropped mid-poll) as soon as
    /// shutdown is requested rather than racing it cooperatively; callers
    /// that need to run compensation or cleanup on shutdown should observe
    /// a [`ShutdownToken`] themselves instead of relying on this spawn.
    pub fn spawn<F>(&self, task_name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut token = self.shutdown.token();
        let task_name = task_name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = future => {
                    #[cfg(feature = "otel")]
                    tracing::debug!(task = %task_name, "task completed normally");
                }
                _ = token.cancelled() => {
                    #[cfg(feature = "otel")]
                    tracing::info!(task = %task_name, "task cancelled due to shutdown");
                }
            }
            #[cfg(not(feature = "otel"))]
            let _ = task_name;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_reports_shutdown_after_trigger() {
        let shutdown = GracefulShutdown::new();
        let token = shutdown.token();
        assert!(!token.is_shutdown());
        shutdown.shutdown(ShutdownSignal::Manual);
        assert!(token.is_shutdown());
    }

    #[tokio::test]
    async fn cancelled_resolves_once_shutdown_triggers() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let mut token = shutdown.token();
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });
        tokio::task::yield_now().await;
        shutdown.shutdown(ShutdownSignal::Terminate);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn run_until_shutdown_returns_none_when_cancelled_first() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let shutdown2 = shutdown.clone();
        let run = tokio::spawn(async move { shutdown2.run_until_shutdown(std::future::pending::<()>()).await });
        tokio::task::yield_now().await;
        shutdown.shutdown(ShutdownSignal::Manual);
        let result = run.await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn spawner_task_completes_normally_without_shutdown() {
        let shutdown = Arc::new(GracefulShutdown::new());
        let spawner = ShutdownAwareTaskSpawner::new(shutdown);
        let handle = spawner.spawn("noop", async {});
        handle.await.unwrap();
    }
}
