//! The Transaction Coordinator: a workflow engine that executes
//! serializable [`TransactionPlan`] trees against the [`crate::hub::Hub`]
//! atomically, in the Saga sense — every successful step that declares a
//! compensation is unwound on failure.

mod cache;
mod plan;
mod signals;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::blueprint::ExecutionContext;
use crate::error::{HubFault, SerializableDeviceFailure};
use crate::hub::events::DeviceMessageBody;
use crate::hub::Hub;
use crate::meta::Meta;
use crate::naming::{CorrelationIdFactory, Name};
use crate::ports::{Clock, TaskExecutor};

pub use cache::ActionResultCache;
pub use plan::{
    CompensationOrder, CompensationPolicy, FailureStrategy, NodeOptions, PlanAction, PlanNode, RetryPolicy, TransactionPlan,
};
pub use signals::{SignalError, SignalTable};

/// The outcome of running a plan to completion.
#[derive(Debug, Clone)]
pub enum TransactionResult {
    Success(HashMap<String, Meta>),
    Failure(SerializableDeviceFailure),
}

impl TransactionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TransactionResult::Success(_))
    }
}

#[derive(Clone)]
enum CompensationEntry {
    Single { node: PlanNode, policy: CompensationPolicy },
    Group { entries: Vec<CompensationEntry>, order: CompensationOrder },
}

/// Per-run scratch state: the idempotency table, the run-scoped output
/// bindings (`outputKey`/loop variables), and the compensation stack.
struct RunState {
    idempotency: Mutex<HashMap<String, Option<Meta>>>,
    outputs: Mutex<HashMap<String, Meta>>,
    compensation_stack: Mutex<Vec<CompensationEntry>>,
}

impl RunState {
    fn new() -> Self {
        Self { idempotency: Mutex::new(HashMap::new()), outputs: Mutex::new(HashMap::new()), compensation_stack: Mutex::new(Vec::new()) }
    }

    async fn idempotent_result(&self, key: &str) -> Option<Option<Meta>> {
        self.idempotency.lock().await.get(key).cloned()
    }

    async fn record_idempotent(&self, key: String, value: Option<Meta>) {
        self.idempotency.lock().await.insert(key, value);
    }

    async fn bind_output(&self, key: String, value: Meta) {
        self.outputs.lock().await.insert(key, value);
    }

    async fn read_output(&self, key: &str) -> Option<Meta> {
        self.outputs.lock().await.get(key).cloned()
    }

    async fn outputs_snapshot(&self) -> HashMap<String, Meta> {
        self.outputs.lock().await.clone()
    }

    async fn push_compensation(&self, node: PlanNode, policy: CompensationPolicy) {
        self.compensation_stack.lock().await.push(CompensationEntry::Single { node, policy });
    }

    async fn len(&self) -> usize {
        self.compensation_stack.lock().await.len()
    }

    async fn drain_since(&self, since: usize) -> Vec<CompensationEntry> {
        let mut stack = self.compensation_stack.lock().await;
        stack.split_off(since)
    }

    async fn push_group(&self, entries: Vec<CompensationEntry>, order: CompensationOrder) {
        if entries.is_empty() {
            return;
        }
        self.compensation_stack.lock().await.push(CompensationEntry::Group { entries, order });
    }

    async fn pop_compensation(&self) -> Option<CompensationEntry> {
        self.compensation_stack.lock().await.pop()
    }
}

/// Executes [`TransactionPlan`]s against one [`Hub`]. Owns the signal table
/// and action result cache for its lifetime; a background task keeps the
/// cache consistent with the hub's property-change stream.
pub struct Coordinator {
    hub: Arc<Hub>,
    clock: Arc<dyn Clock>,
    correlation_factory: Arc<dyn CorrelationIdFactory>,
    task_executor: Arc<dyn TaskExecutor>,
    cache: Arc<ActionResultCache>,
    signals: Arc<SignalTable>,
    cache_invalidator: JoinHandle<()>,
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.cache_invalidator.abort();
    }
}

impl Coordinator {
    pub fn new(hub: Arc<Hub>, clock: Arc<dyn Clock>, correlation_factory: Arc<dyn CorrelationIdFactory>, task_executor: Arc<dyn TaskExecutor>) -> Arc<Self> {
        let cache = Arc::new(ActionResultCache::new());
        let signals = Arc::new(SignalTable::new());
        let mut events = hub.events();
        let cache_for_invalidation = cache.clone();
        let cache_invalidator = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let DeviceMessageBody::PropertyChanged { property, .. } = &event.message.body {
                            cache_for_invalidation.invalidate(&event.message.source_device.device, property);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });
        Arc::new(Self { hub, clock, correlation_factory, task_executor, cache, signals, cache_invalidator })
    }

    /// The signal table, so callers outside a plan run can `release` an
    /// `AwaitSignal` node by id.
    pub fn signals(&self) -> &Arc<SignalTable> {
        &self.signals
    }

    fn effective_deadline(&self, plan: &TransactionPlan, ctx: &ExecutionContext) -> Option<chrono::DateTime<chrono::Utc>> {
        match (plan.deadline, ctx.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Runs `plan` to completion: either every step succeeded (`Success`,
    /// carrying the run's `outputKey` bindings) or it failed and every
    /// completed step with a declared compensation was rolled back
    /// (`Failure`).
    pub async fn run(self: &Arc<Self>, plan: TransactionPlan, ctx: ExecutionContext) -> TransactionResult {
        let mut run_ctx = ctx;
        run_ctx.correlation_id = self.correlation_factory.next();
        let run = Arc::new(RunState::new());
        let deadline = self.effective_deadline(&plan, &run_ctx);

        let exec = Self::execute_node(self.clone(), plan.root.clone(), run_ctx.clone(), run.clone());
        let mut shutdown = self.hub.shutdown_token();
        tokio::pin!(exec);
        let outcome = match deadline {
            None => {
                tokio::select! {
                    result = &mut exec => result,
                    _ = shutdown.cancelled() => Err(SerializableDeviceFailure::from_hub_fault(&HubFault::Internal("hub shut down mid-transaction".to_string()))),
                }
            }
            Some(cutoff) => {
                let budget = (cutoff - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
                let deadline_sleep = self.clock.sleep(chrono::Duration::from_std(budget).unwrap_or_default());
                tokio::pin!(deadline_sleep);
                tokio::select! {
                    result = &mut exec => result,
                    _ = &mut deadline_sleep => Err(SerializableDeviceFailure::from_hub_fault(&HubFault::DeadlineExceeded)),
                    _ = shutdown.cancelled() => Err(SerializableDeviceFailure::from_hub_fault(&HubFault::Internal("hub shut down mid-transaction".to_string()))),
                }
            }
        };

        match outcome {
            Ok(_) => TransactionResult::Success(run.outputs_snapshot().await),
            Err(failure) => {
                self.rollback(&run, &run_ctx).await;
                TransactionResult::Failure(failure)
            }
        }
    }

    fn execute_node(coordinator: Arc<Self>, node: PlanNode, ctx: ExecutionContext, run: Arc<RunState>) -> BoxFuture<'static, Result<Option<Meta>, SerializableDeviceFailure>> {
        async move { coordinator.execute_with_retry(node, ctx, run).await }.boxed()
    }

    async fn execute_with_retry(self: Arc<Self>, node: PlanNode, ctx: ExecutionContext, run: Arc<RunState>) -> Result<Option<Meta>, SerializableDeviceFailure> {
        if let Some(key) = node.options.key.clone() {
            if let Some(cached) = run.idempotent_result(&key).await {
                return Ok(cached);
            }
        }

        let max_attempts = node.options.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1).max(1);
        let mut last_failure = None;
        for attempt in 1..=max_attempts {
            let outcome = self.clone().run_once_with_timeout(node.clone(), ctx.clone(), run.clone()).await;
            match outcome {
                Ok(value) => {
                    if let Some(key) = &node.options.key {
                        run.record_idempotent(key.clone(), value.clone()).await;
                    }
                    if let Some(compensation) = &node.options.compensation {
                        run.push_compensation((**compensation).clone(), node.options.compensation_policy).await;
                    }
                    return Ok(value);
                }
                Err(failure) => {
                    last_failure = Some(failure);
                    if attempt < max_attempts {
                        if let Some(retry) = &node.options.retry {
                            let delay = retry.delay_for_attempt(attempt);
                            self.clock.sleep(chrono::Duration::from_std(delay).unwrap_or_default()).await;
                        }
                    }
                }
            }
        }
        Err(last_failure.expect("at least one attempt always runs"))
    }

    async fn run_once_with_timeout(self: Arc<Self>, node: PlanNode, ctx: ExecutionContext, run: Arc<RunState>) -> Result<Option<Meta>, SerializableDeviceFailure> {
        let label = node.label();
        let timeout = node.options.timeout;
        let body = self.clone().execute_leaf(node, ctx, run);
        match timeout {
            None => body.await,
            Some(duration) => {
                let sleep = self.clock.sleep(chrono::Duration::from_std(duration).unwrap_or_default());
                tokio::pin!(body);
                tokio::pin!(sleep);
                tokio::select! {
                    result = &mut body => result,
                    _ = &mut sleep => Err(SerializableDeviceFailure::from_hub_fault(&HubFault::TransactionTimeout(label))),
                }
            }
        }
    }

    fn execute_leaf(self: Arc<Self>, node: PlanNode, ctx: ExecutionContext, run: Arc<RunState>) -> BoxFuture<'static, Result<Option<Meta>, SerializableDeviceFailure>> {
        async move {
            match node.action {
                PlanAction::Sequence(children) => {
                    for child in children {
                        Self::execute_node(self.clone(), child, ctx.clone(), run.clone()).await?;
                    }
                    Ok(None)
                }
                PlanAction::Parallel { children, failure_strategy, compensation_order } => {
                    self.execute_parallel(children, failure_strategy, compensation_order, ctx, run).await
                }
                PlanAction::Attach { device, blueprint_id } => {
                    self.hub.attach(device, blueprint_id, &ctx).await.map_err(|e| SerializableDeviceFailure::from_hub_fault(&e))?;
                    Ok(None)
                }
                PlanAction::Detach { device } => {
                    self.hub.detach(&device, &ctx).await.map_err(|e| SerializableDeviceFailure::from_hub_fault(&e))?;
                    Ok(None)
                }
                PlanAction::Start { device } => {
                    self.hub.start(&device, &ctx).await.map_err(|e| SerializableDeviceFailure::from_hub_fault(&e))?;
                    Ok(None)
                }
                PlanAction::Stop { device } => {
                    self.hub.stop(&device, &ctx).await.map_err(|e| SerializableDeviceFailure::from_hub_fault(&e))?;
                    Ok(None)
                }
                PlanAction::WriteProperty { device, property, value } => {
                    self.hub.write_property(&device, &property, value, &ctx).await.map_err(|e| SerializableDeviceFailure::from_hub_fault(&e))?;
                    Ok(None)
                }
                PlanAction::Invoke { device, action, input, output_key } => {
                    let result = self.invoke_cached(&device, &action, input, &ctx).await?;
                    if let (Some(key), Some(value)) = (&output_key, &result) {
                        run.bind_output(key.clone(), value.clone()).await;
                    }
                    Ok(result)
                }
                PlanAction::Delay { duration } => {
                    self.clock.sleep(chrono::Duration::from_std(duration).unwrap_or_default()).await;
                    Ok(None)
                }
                PlanAction::AwaitPredicate { device, predicate, await_timeout } => {
                    self.await_predicate(&device, &predicate, await_timeout, &ctx).await?;
                    Ok(None)
                }
                PlanAction::AwaitSignal { signal_id, await_timeout, .. } => {
                    self.signals
                        .await_signal(&signal_id, self.clock.as_ref(), await_timeout)
                        .await
                        .map_err(|e| SerializableDeviceFailure::from_hub_fault(&HubFault::Internal(e.to_string())))?;
                    Ok(None)
                }
                PlanAction::Condition { device, predicate, expected_value, then, otherwise } => {
                    let actual = self
                        .hub
                        .read_property(&device, &predicate, &ctx)
                        .await
                        .map_err(|e| SerializableDeviceFailure::from_hub_fault(&e))?;
                    match (actual == expected_value, otherwise) {
                        (true, _) => Self::execute_node(self.clone(), *then, ctx, run).await,
                        (false, Some(otherwise)) => Self::execute_node(self.clone(), *otherwise, ctx, run).await,
                        (false, None) => Ok(None),
                    }
                }
                PlanAction::Loop { iterable_key, loop_var, body } => {
                    let Some(iterable) = run.read_output(&iterable_key).await else {
                        return Err(SerializableDeviceFailure::from_hub_fault(&HubFault::Internal(format!("no bound output named {iterable_key}"))));
                    };
                    for item in plan::meta_as_list(&iterable) {
                        run.bind_output(loop_var.clone(), item).await;
                        Self::execute_node(self.clone(), (*body).clone(), ctx.clone(), run.clone()).await?;
                    }
                    Ok(None)
                }
                PlanAction::RunTask { blueprint_id, input, output_key } => {
                    let output = self
                        .task_executor
                        .run_task(&blueprint_id, input)
                        .await
                        .map_err(|e| SerializableDeviceFailure::from_hub_fault(&HubFault::Port(e)))?;
                    run.bind_output(output_key, output.clone()).await;
                    Ok(Some(output))
                }
            }
        }
        .boxed()
    }

    async fn invoke_cached(self: &Arc<Self>, device: &Name, action: &Name, input: Meta, ctx: &ExecutionContext) -> Result<Option<Meta>, SerializableDeviceFailure> {
        let found = self.hub.find_device(&crate::naming::Address::new(self.hub_id(), device.clone())).await;
        let cache_policy = found.as_ref().and_then(|d| d.blueprint.actions.get(action)).and_then(|a| a.cache_policy.clone());

        if let Some(policy) = &cache_policy {
            if let Some(cached) = self.cache.get(device, action, &input, policy, ctx.principal.as_deref(), self.clock.now()) {
                return Ok(Some(cached));
            }
        }

        let result = self.hub.execute(device, action, input.clone(), ctx).await.map_err(|e| SerializableDeviceFailure::from_hub_fault(&e))?;

        if let (Some(policy), Some(value)) = (&cache_policy, &result) {
            self.cache.put(device, action, &input, policy, ctx.principal.as_deref(), value.clone(), self.clock.now());
        }
        Ok(result)
    }

    async fn await_predicate(self: &Arc<Self>, device: &Name, predicate: &Name, await_timeout: Option<Duration>, ctx: &ExecutionContext) -> Result<(), SerializableDeviceFailure> {
        let Some(found) = self.hub.find_device(&crate::naming::Address::new(self.hub_id(), device.clone())).await else {
            return Err(SerializableDeviceFailure::from_hub_fault(&HubFault::DeviceNotFound(device.clone())));
        };
        if found.read_property(predicate, ctx).await.ok().and_then(|m| m.as_bool()) == Some(true) {
            return Ok(());
        }
        let mut messages = found.subscribe_messages();
        let wait = async {
            loop {
                match messages.recv().await {
                    Ok(message) => {
                        if let DeviceMessageBody::PredicateChanged { predicate: changed, value: true } = &message.body {
                            if changed == predicate {
                                return Ok(());
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Err(SerializableDeviceFailure::from_hub_fault(&HubFault::Internal("device closed".to_string()))),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        };
        match await_timeout {
            None => wait.await,
            Some(duration) => {
                let sleep = self.clock.sleep(chrono::Duration::from_std(duration).unwrap_or_default());
                tokio::pin!(wait);
                tokio::pin!(sleep);
                tokio::select! {
                    result = &mut wait => result,
                    _ = &mut sleep => Err(SerializableDeviceFailure::from_hub_fault(&HubFault::TransactionTimeout(format!("AwaitPredicate({device}.{predicate})")))),
                }
            }
        }
    }

    fn hub_id(&self) -> Arc<str> {
        self.hub.hub_id()
    }

    async fn execute_parallel(
        self: &Arc<Self>,
        children: Vec<PlanNode>,
        failure_strategy: FailureStrategy,
        compensation_order: CompensationOrder,
        ctx: ExecutionContext,
        run: Arc<RunState>,
    ) -> Result<Option<Meta>, SerializableDeviceFailure> {
        let since = run.len().await;
        let result = match failure_strategy {
            FailureStrategy::CollectAll => {
                let handles: Vec<_> = children.into_iter().map(|child| tokio::spawn(Self::execute_node(self.clone(), child, ctx.clone(), run.clone()))).collect();
                let mut failure = None;
                for handle in handles {
                    if let Err(e) = handle.await.expect("parallel child task panicked") {
                        failure.get_or_insert(e);
                    }
                }
                failure.map_or(Ok(None), Err)
            }
            FailureStrategy::BestEffort => {
                let handles: Vec<_> = children.into_iter().map(|child| tokio::spawn(Self::execute_node(self.clone(), child, ctx.clone(), run.clone()))).collect();
                let mut successes = 0;
                let mut last_failure = None;
                for handle in handles {
                    match handle.await.expect("parallel child task panicked") {
                        Ok(_) => successes += 1,
                        Err(e) => last_failure = Some(e),
                    }
                }
                if successes > 0 {
                    Ok(None)
                } else {
                    Err(last_failure.unwrap_or_else(|| SerializableDeviceFailure::from_hub_fault(&HubFault::Internal("parallel node had no children".to_string()))))
                }
            }
            FailureStrategy::FailFast => {
                let mut handles: Vec<_> = children.into_iter().map(|child| tokio::spawn(Self::execute_node(self.clone(), child, ctx.clone(), run.clone()))).collect();
                let mut outcome = Ok(None);
                while !handles.is_empty() {
                    let (finished, _index, rest) = futures::future::select_all(handles).await;
                    handles = rest;
                    match finished.expect("parallel child task panicked") {
                        Ok(_) => continue,
                        Err(e) => {
                            outcome = Err(e);
                            break;
                        }
                    }
                }
                for handle in handles {
                    handle.abort();
                }
                outcome
            }
        };

        // Regroup whatever compensations this node's children pushed onto
        // the shared stack according to this node's own compensation order,
        // so a later rollback unwinds them together rather than interleaved
        // with siblings from an enclosing Sequence.
        let pushed = run.drain_since(since).await;
        run.push_group(pushed, compensation_order).await;

        result
    }

    async fn rollback(self: &Arc<Self>, run: &Arc<RunState>, ctx: &ExecutionContext) {
        loop {
            let Some(entry) = run.pop_compensation().await else { break };
            if !self.run_compensation_entry(entry, ctx.clone(), run.clone()).await {
                break;
            }
        }
    }

    fn run_compensation_entry(self: &Arc<Self>, entry: CompensationEntry, ctx: ExecutionContext, run: Arc<RunState>) -> BoxFuture<'static, bool> {
        let coordinator = self.clone();
        async move {
            match entry {
                CompensationEntry::Single { node, policy } => coordinator.run_one_compensation(node, policy, ctx, run).await,
                CompensationEntry::Group { entries, order } => {
                    match order {
                        CompensationOrder::SequentialReverse => {
                            for entry in entries.into_iter().rev() {
                                coordinator.run_compensation_entry(entry, ctx.clone(), run.clone()).await;
                            }
                        }
                        CompensationOrder::Parallel => {
                            let handles: Vec<_> = entries
                                .into_iter()
                                .map(|entry| {
                                    let coordinator = coordinator.clone();
                                    let ctx = ctx.clone();
                                    let run = run.clone();
                                    tokio::spawn(async move { coordinator.run_compensation_entry(entry, ctx, run).await })
                                })
                                .collect();
                            for handle in handles {
                                let _ = handle.await;
                            }
                        }
                    }
                    true
                }
            }
        }
        .boxed()
    }

    /// Runs one compensation's plan node, honouring its policy on failure.
    /// Returns whether the caller should keep unwinding the rest of the
    /// stack (`false` only for a failed `Abort`, which we scope to this
    /// single entry rather than nested groups, since a group unwinding
    /// concurrently has no single well-ordered point to stop at).
    async fn run_one_compensation(self: &Arc<Self>, node: PlanNode, policy: CompensationPolicy, ctx: ExecutionContext, run: Arc<RunState>) -> bool {
        let outcome = Self::execute_node(self.clone(), node.clone(), ctx.clone(), run.clone()).await;
        match (outcome, policy) {
            (Ok(_), _) => true,
            (Err(_), CompensationPolicy::ContinueAndFlag) => true,
            (Err(_), CompensationPolicy::Retry) => {
                let _ = Self::execute_node(self.clone(), node, ctx, run).await;
                true
            }
            (Err(_), CompensationPolicy::Abort) => false,
        }
    }
}

#[cfg(test)]
mod tests;
