//! The `TransactionPlan` tree: a serializable workflow description the
//! [`super::Coordinator`] walks against the Hub.

use std::time::Duration;

use crate::blueprint::BackoffStrategy;
use crate::meta::Meta;
use crate::naming::Name;

/// Backoff plus bounds, shared shape with [`crate::blueprint::RestartPolicy`]
/// but scoped to a single plan node's retry behaviour.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub jitter: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff, jitter: None }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Delay before `attempt` (1-indexed). A caller after exact timing
    /// (tests) should leave `jitter` unset, since it draws from the thread
    /// RNG rather than the injected `Clock`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.backoff.delay_for_attempt(attempt);
        match self.jitter {
            Some(bound) if bound > Duration::ZERO => {
                use rand::Rng;
                let extra_nanos = rand::thread_rng().gen_range(0..=bound.as_nanos() as u64);
                base + Duration::from_nanos(extra_nanos)
            }
            _ => base,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureStrategy {
    FailFast,
    CollectAll,
    BestEffort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompensationOrder {
    SequentialReverse,
    Parallel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompensationPolicy {
    /// Stop unwinding the rest of the compensation stack.
    Abort,
    /// Record the failure and keep unwinding.
    ContinueAndFlag,
    /// Run the same compensation exactly once more, then give up either way.
    Retry,
}

impl Default for CompensationPolicy {
    fn default() -> Self {
        CompensationPolicy::Abort
    }
}

/// Options shared by every plan node: `(key?, compensation?, compensationPolicy, timeout?, retry?)`.
#[derive(Clone, Debug, Default)]
pub struct NodeOptions {
    pub key: Option<String>,
    pub compensation: Option<Box<PlanNode>>,
    pub compensation_policy: CompensationPolicy,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl NodeOptions {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_compensation(mut self, node: PlanNode) -> Self {
        self.compensation = Some(Box::new(node));
        self
    }

    pub fn with_compensation_policy(mut self, policy: CompensationPolicy) -> Self {
        self.compensation_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[derive(Clone, Debug)]
pub enum PlanAction {
    Sequence(Vec<PlanNode>),
    Parallel {
        children: Vec<PlanNode>,
        failure_strategy: FailureStrategy,
        compensation_order: CompensationOrder,
    },
    Attach {
        device: Name,
        blueprint_id: crate::blueprint::BlueprintId,
    },
    Detach {
        device: Name,
    },
    Start {
        device: Name,
    },
    Stop {
        device: Name,
    },
    WriteProperty {
        device: Name,
        property: Name,
        value: Meta,
    },
    Invoke {
        device: Name,
        action: Name,
        input: Meta,
        output_key: Option<String>,
    },
    Delay {
        duration: Duration,
    },
    AwaitPredicate {
        device: Name,
        predicate: Name,
        await_timeout: Option<Duration>,
    },
    AwaitSignal {
        signal_id: String,
        await_timeout: Option<Duration>,
        description: Option<String>,
    },
    Condition {
        device: Name,
        predicate: Name,
        expected_value: Meta,
        then: Box<PlanNode>,
        otherwise: Option<Box<PlanNode>>,
    },
    Loop {
        iterable_key: String,
        loop_var: String,
        body: Box<PlanNode>,
    },
    RunTask {
        blueprint_id: String,
        input: Meta,
        output_key: String,
    },
}

#[derive(Clone, Debug)]
pub struct PlanNode {
    pub action: PlanAction,
    pub options: NodeOptions,
}

impl PlanNode {
    fn new(action: PlanAction) -> Self {
        Self { action, options: NodeOptions::default() }
    }

    pub fn sequence(children: impl IntoIterator<Item = PlanNode>) -> Self {
        Self::new(PlanAction::Sequence(children.into_iter().collect()))
    }

    pub fn parallel(children: impl IntoIterator<Item = PlanNode>, failure_strategy: FailureStrategy, compensation_order: CompensationOrder) -> Self {
        Self::new(PlanAction::Parallel { children: children.into_iter().collect(), failure_strategy, compensation_order })
    }

    pub fn attach(device: Name, blueprint_id: impl Into<crate::blueprint::BlueprintId>) -> Self {
        Self::new(PlanAction::Attach { device, blueprint_id: blueprint_id.into() })
    }

    pub fn detach(device: Name) -> Self {
        Self::new(PlanAction::Detach { device })
    }

    pub fn start(device: Name) -> Self {
        Self::new(PlanAction::Start { device })
    }

    pub fn stop(device: Name) -> Self {
        Self::new(PlanAction::Stop { device })
    }

    pub fn write_property(device: Name, property: Name, value: Meta) -> Self {
        Self::new(PlanAction::WriteProperty { device, property, value })
    }

    pub fn invoke(device: Name, action: Name, input: Meta) -> Self {
        Self::new(PlanAction::Invoke { device, action, input, output_key: None })
    }

    pub fn invoke_with_output(device: Name, action: Name, input: Meta, output_key: impl Into<String>) -> Self {
        Self::new(PlanAction::Invoke { device, action, input, output_key: Some(output_key.into()) })
    }

    pub fn delay(duration: Duration) -> Self {
        Self::new(PlanAction::Delay { duration })
    }

    pub fn await_predicate(device: Name, predicate: Name, await_timeout: Option<Duration>) -> Self {
        Self::new(PlanAction::AwaitPredicate { device, predicate, await_timeout })
    }

    pub fn await_signal(signal_id: impl Into<String>, await_timeout: Option<Duration>) -> Self {
        Self::new(PlanAction::AwaitSignal { signal_id: signal_id.into(), await_timeout, description: None })
    }

    pub fn condition(device: Name, predicate: Name, expected_value: Meta, then: PlanNode, otherwise: Option<PlanNode>) -> Self {
        Self::new(PlanAction::Condition { device, predicate, expected_value, then: Box::new(then), otherwise: otherwise.map(Box::new) })
    }

    pub fn plan_loop(iterable_key: impl Into<String>, loop_var: impl Into<String>, body: PlanNode) -> Self {
        Self::new(PlanAction::Loop { iterable_key: iterable_key.into(), loop_var: loop_var.into(), body: Box::new(body) })
    }

    pub fn run_task(blueprint_id: impl Into<String>, input: Meta, output_key: impl Into<String>) -> Self {
        Self::new(PlanAction::RunTask { blueprint_id: blueprint_id.into(), input, output_key: output_key.into() })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.options = self.options.with_key(key);
        self
    }

    pub fn with_compensation(mut self, node: PlanNode) -> Self {
        self.options = self.options.with_compensation(node);
        self
    }

    pub fn with_compensation_policy(mut self, policy: CompensationPolicy) -> Self {
        self.options = self.options.with_compensation_policy(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_timeout(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.options = self.options.with_retry(retry);
        self
    }

    /// A short human-readable label for error messages and tracing.
    pub fn label(&self) -> String {
        match &self.action {
            PlanAction::Sequence(_) => "Sequence".to_string(),
            PlanAction::Parallel { .. } => "Parallel".to_string(),
            PlanAction::Attach { device, .. } => format!("Attach({device})"),
            PlanAction::Detach { device } => format!("Detach({device})"),
            PlanAction::Start { device } => format!("Start({device})"),
            PlanAction::Stop { device } => format!("Stop({device})"),
            PlanAction::WriteProperty { device, property, .. } => format!("WriteProperty({device}.{property})"),
            PlanAction::Invoke { device, action, .. } => format!("Invoke({device}.{action})"),
            PlanAction::Delay { .. } => "Delay".to_string(),
            PlanAction::AwaitPredicate { device, predicate, .. } => format!("AwaitPredicate({device}.{predicate})"),
            PlanAction::AwaitSignal { signal_id, .. } => format!("AwaitSignal({signal_id})"),
            PlanAction::Condition { device, predicate, .. } => format!("Condition({device}.{predicate})"),
            PlanAction::Loop { iterable_key, .. } => format!("Loop({iterable_key})"),
            PlanAction::RunTask { blueprint_id, .. } => format!("RunTask({blueprint_id})"),
        }
    }
}

/// Interprets an output `Meta` as the iterable a `Loop` node walks: a struct
/// whose children are all numeric-token keys is treated as an ordered list
/// (sorted numerically); anything else is a single-item iterable.
pub fn meta_as_list(meta: &Meta) -> Vec<Meta> {
    if meta.is_leaf() || meta.children.is_empty() {
        return vec![meta.clone()];
    }
    let mut indexed: Vec<(u64, &Meta)> = Vec::new();
    for (key, value) in &meta.children {
        match key.parse::<u64>() {
            Ok(index) => indexed.push((index, value)),
            Err(_) => return vec![meta.clone()],
        }
    }
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, value)| value.clone()).collect()
}

/// A complete, runnable plan: its root node plus an optional absolute
/// wall-clock cutoff for the whole run.
#[derive(Clone, Debug)]
pub struct TransactionPlan {
    pub root: PlanNode,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
}

impl TransactionPlan {
    pub fn new(root: PlanNode) -> Self {
        Self { root, deadline: None }
    }

    pub fn with_deadline(mut self, deadline: chrono::DateTime<chrono::Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_as_list_sorts_numeric_children() {
        let meta = Meta::struct_of([("1", Meta::leaf(2i64)), ("0", Meta::leaf(1i64))]);
        let list = meta_as_list(&meta);
        assert_eq!(list, vec![Meta::leaf(1i64), Meta::leaf(2i64)]);
    }

    #[test]
    fn meta_as_list_treats_leaf_as_single_item() {
        let meta = Meta::leaf(7i64);
        assert_eq!(meta_as_list(&meta), vec![Meta::leaf(7i64)]);
    }

    #[test]
    fn retry_policy_respects_backoff() {
        let retry = RetryPolicy::new(3, BackoffStrategy::Fixed(Duration::from_millis(10)));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(10));
    }
}
