//! [`TaskExecutor`]: runs a named, out-of-band unit of work on behalf of a
//! `RunTask` plan node — the escape hatch for work that isn't a device
//! action (batch jobs, external API calls, scripted procedures).

use dashmap::DashMap;

use crate::meta::Meta;
use crate::ports::PortError;

#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Runs the task named `blueprint_id` with `input`, returning its output
    /// value for the plan's `outputKey` binding.
    async fn run_task(&self, blueprint_id: &str, input: Meta) -> Result<Meta, PortError>;
}

/// A task executor backed by a fixed table of closures, registered by id.
/// Suitable for tests and for deployments where the task catalogue is
/// known at startup.
pub struct InMemoryTaskExecutor {
    tasks: DashMap<String, Box<dyn Fn(Meta) -> Result<Meta, PortError> + Send + Sync>>,
}

impl Default for InMemoryTaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskExecutor {
    pub fn new() -> Self {
        Self { tasks: DashMap::new() }
    }

    pub fn with_task(
        self,
        blueprint_id: impl Into<String>,
        task: impl Fn(Meta) -> Result<Meta, PortError> + Send + Sync + 'static,
    ) -> Self {
        self.tasks.insert(blueprint_id.into(), Box::new(task));
        self
    }
}

#[async_trait::async_trait]
impl TaskExecutor for InMemoryTaskExecutor {
    async fn run_task(&self, blueprint_id: &str, input: Meta) -> Result<Meta, PortError> {
        let task = self
            .tasks
            .get(blueprint_id)
            .ok_or_else(|| PortError::Storage(format!("no task registered for {blueprint_id}")))?;
        task(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_task_runs_and_returns_output() {
        let executor = InMemoryTaskExecutor::new()
            .with_task("double", |input| Ok(Meta::leaf(input.as_f64().unwrap_or(0.0) * 2.0)));
        let output = executor.run_task("double", Meta::leaf(21.0)).await.unwrap();
        assert_eq!(output, Meta::leaf(42.0));
    }

    #[tokio::test]
    async fn unknown_task_is_a_storage_error() {
        let executor = InMemoryTaskExecutor::new();
        let result = executor.run_task("ghost", Meta::empty()).await;
        assert!(matches!(result, Err(PortError::Storage(_))));
    }
}
