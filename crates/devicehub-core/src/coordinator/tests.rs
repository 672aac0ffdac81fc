use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::blueprint::descriptor::{ActionDescriptor, PropertyDescriptor};
use crate::blueprint::BlueprintBuilder;
use crate::error::DeviceFault;
use crate::naming::{CorrelationId, Name, UuidCorrelationIdFactory};
use crate::ports::{AllowAllAuthorization, InMemoryTaskExecutor, StaticBlueprintRegistry, SystemClock, TestClock};

fn ctx() -> ExecutionContext {
    ExecutionContext::new(CorrelationId::new("test"))
}

fn hub_with(registry: StaticBlueprintRegistry, clock: Arc<dyn Clock>) -> Arc<Hub> {
    Arc::new(Hub::new("hub-1", Arc::new(registry), Arc::new(AllowAllAuthorization), clock))
}

fn coordinator(hub: Arc<Hub>, clock: Arc<dyn Clock>) -> Arc<Coordinator> {
    Coordinator::new(hub, clock, Arc::new(UuidCorrelationIdFactory), Arc::new(InMemoryTaskExecutor::new()))
}

#[tokio::test]
async fn sequence_attaches_writes_and_invokes() {
    let blueprint = BlueprintBuilder::new("motor")
        .property(PropertyDescriptor::logical("setpoint", "double").mutable(), None, None)
        .action(
            ActionDescriptor::new("calibrate"),
            Arc::new(|_input, _ctx| Ok(Some(Meta::leaf("calibrated")))),
        )
        .build()
        .unwrap();
    let registry = StaticBlueprintRegistry::new().with_blueprint(blueprint);
    let hub = hub_with(registry, Arc::new(SystemClock));
    let coordinator = coordinator(hub, Arc::new(SystemClock));

    let device = Name::single("m1");
    let plan = TransactionPlan::new(PlanNode::sequence([
        PlanNode::attach(device.clone(), "motor"),
        PlanNode::write_property(device.clone(), Name::single("setpoint"), Meta::leaf(9.0)),
        PlanNode::invoke_with_output(device.clone(), Name::single("calibrate"), Meta::empty(), "result"),
    ]));

    let result = coordinator.run(plan, ctx()).await;
    match result {
        TransactionResult::Success(outputs) => assert_eq!(outputs.get("result"), Some(&Meta::leaf("calibrated"))),
        TransactionResult::Failure(f) => panic!("expected success, got {f:?}"),
    }
}

#[tokio::test]
async fn retry_recovers_after_transient_failure() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_for_handle = attempts.clone();
    let blueprint = BlueprintBuilder::new("flaky")
        .action(
            ActionDescriptor::new("ping"),
            Arc::new(move |_input, _ctx| {
                if attempts_for_handle.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DeviceFault::new("TRANSIENT", "not ready yet"))
                } else {
                    Ok(Some(Meta::leaf("pong")))
                }
            }),
        )
        .build()
        .unwrap();
    let registry = StaticBlueprintRegistry::new().with_blueprint(blueprint);
    let clock = Arc::new(TestClock::new(chrono::Utc::now()));
    let hub = hub_with(registry, clock.clone());
    let coordinator = coordinator(hub, clock.clone());

    let device = Name::single("d1");
    let plan = TransactionPlan::new(PlanNode::sequence([
        PlanNode::attach(device.clone(), "flaky"),
        PlanNode::invoke(device.clone(), Name::single("ping"), Meta::empty())
            .with_retry(RetryPolicy::new(2, crate::blueprint::BackoffStrategy::Fixed(Duration::ZERO))),
    ]));

    let run = tokio::spawn(async move { coordinator.run(plan, ctx()).await });
    tokio::task::yield_now().await;
    clock.advance(chrono::Duration::milliseconds(1)).await;
    let result = run.await.unwrap();

    assert!(result.is_success());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_step_rolls_back_attach_via_compensation() {
    let blueprint = BlueprintBuilder::new("motor").build().unwrap();
    let registry = StaticBlueprintRegistry::new().with_blueprint(blueprint);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hub = hub_with(registry, clock.clone());
    let coordinator = coordinator(hub.clone(), clock);

    let device = Name::single("m1");
    let plan = TransactionPlan::new(PlanNode::sequence([
        PlanNode::attach(device.clone(), "motor").with_compensation(PlanNode::detach(device.clone())),
        PlanNode::invoke(device.clone(), Name::single("no-such-action"), Meta::empty()),
    ]));

    let result = coordinator.run(plan, ctx()).await;
    assert!(!result.is_success());
    assert!(hub.find_device(&crate::naming::Address::new("hub-1", device)).await.is_none());
}

#[tokio::test]
async fn parallel_fail_fast_reports_failure() {
    let blueprint = BlueprintBuilder::new("motor").build().unwrap();
    let registry = StaticBlueprintRegistry::new().with_blueprint(blueprint);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hub = hub_with(registry, clock.clone());
    let coordinator = coordinator(hub, clock);

    let device = Name::single("m1");
    let plan = TransactionPlan::new(PlanNode::sequence([
        PlanNode::attach(device.clone(), "motor"),
        PlanNode::parallel(
            [
                PlanNode::delay(Duration::from_millis(5)),
                PlanNode::invoke(device.clone(), Name::single("missing"), Meta::empty()),
            ],
            FailureStrategy::FailFast,
            CompensationOrder::SequentialReverse,
        ),
    ]));

    let result = coordinator.run(plan, ctx()).await;
    assert!(!result.is_success());
}

#[tokio::test]
async fn invoke_result_is_cached_until_property_invalidates_it() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_for_handle = calls.clone();
    let mut action = ActionDescriptor::new("reading");
    action.cache_policy = Some(crate::blueprint::CachePolicy {
        ttl: Duration::from_secs(60),
        scope: crate::blueprint::CacheScope::Global,
        invalidate_on: vec![Name::single("setpoint")],
    });
    let blueprint = BlueprintBuilder::new("sensor")
        .property(PropertyDescriptor::logical("setpoint", "double").mutable(), None, None)
        .action(
            action,
            Arc::new(move |_input, _ctx| {
                calls_for_handle.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Meta::leaf(42i64)))
            }),
        )
        .build()
        .unwrap();
    let registry = StaticBlueprintRegistry::new().with_blueprint(blueprint);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hub = hub_with(registry, clock.clone());
    let coordinator = coordinator(hub, clock);

    let device = Name::single("s1");
    let attach = TransactionPlan::new(PlanNode::attach(device.clone(), "sensor"));
    assert!(coordinator.run(attach, ctx()).await.is_success());

    let read_twice = TransactionPlan::new(PlanNode::sequence([
        PlanNode::invoke(device.clone(), Name::single("reading"), Meta::empty()),
        PlanNode::invoke(device.clone(), Name::single("reading"), Meta::empty()),
    ]));
    assert!(coordinator.run(read_twice, ctx()).await.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second invoke should hit the cache");

    let invalidate = TransactionPlan::new(PlanNode::write_property(device.clone(), Name::single("setpoint"), Meta::leaf(1.0)));
    assert!(coordinator.run(invalidate, ctx()).await.is_success());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let read_again = TransactionPlan::new(PlanNode::invoke(device, Name::single("reading"), Meta::empty()));
    assert!(coordinator.run(read_again, ctx()).await.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 2, "property change should invalidate the cached result");
}

#[tokio::test]
async fn await_signal_unblocks_once_released() {
    let blueprint = BlueprintBuilder::new("motor").build().unwrap();
    let registry = StaticBlueprintRegistry::new().with_blueprint(blueprint);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let hub = hub_with(registry, clock.clone());
    let coordinator = coordinator(hub, clock);
    let coordinator_for_run = coordinator.clone();

    let plan = TransactionPlan::new(PlanNode::await_signal("deploy-approved", None));
    let run = tokio::spawn(async move { coordinator_for_run.run(plan, ctx()).await });
    tokio::task::yield_now().await;
    coordinator.signals().release("deploy-approved");

    assert!(run.await.unwrap().is_success());
}
