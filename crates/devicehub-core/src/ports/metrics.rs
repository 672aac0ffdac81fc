//! [`MetricCollector`]: the hook through which the runtime emits counters
//! and timings without depending on any particular metrics backend.

#[async_trait::async_trait]
pub trait MetricCollector: Send + Sync {
    async fn increment(&self, name: &str, tags: &[(&str, &str)]);

    async fn record_duration(&self, name: &str, duration: std::time::Duration, tags: &[(&str, &str)]);
}

/// Discards everything. The default when no observability sink is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricCollector;

#[async_trait::async_trait]
impl MetricCollector for NoopMetricCollector {
    async fn increment(&self, _name: &str, _tags: &[(&str, &str)]) {}

    async fn record_duration(&self, _name: &str, _duration: std::time::Duration, _tags: &[(&str, &str)]) {}
}
