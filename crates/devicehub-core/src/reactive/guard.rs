//! Timed guards: rules that watch a predicate cell and post an event to the
//! operational FSM once the predicate has held `true` for long enough.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::blueprint::OperationalState;
use crate::device::Device;
use crate::hub::events::DeviceMessageBody;
use crate::meta::Meta;
use crate::naming::Name;
use crate::ports::Clock;
use crate::state::StateValue;

/// `(predicateName, holdFor, postEventType, eventMeta, onlyInStates)`.
#[derive(Clone)]
pub struct GuardConfig {
    pub predicate_name: Name,
    pub hold_for: Duration,
    pub post_event_type: String,
    pub event_meta: Option<Meta>,
    pub only_in_states: Vec<OperationalState>,
}

impl GuardConfig {
    pub fn new(predicate_name: Name, hold_for: Duration, post_event_type: impl Into<String>) -> Self {
        Self {
            predicate_name,
            hold_for,
            post_event_type: post_event_type.into(),
            event_meta: None,
            only_in_states: Vec::new(),
        }
    }

    pub fn only_in(mut self, states: Vec<OperationalState>) -> Self {
        self.only_in_states = states;
        self
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.event_meta = Some(meta);
        self
    }
}

/// A running guard, cancelled on drop.
pub struct Guard {
    handle: JoinHandle<()>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn a guard against `device`. Subscribes to the named predicate's
/// `PredicateChanged` messages; each transition to `true` starts a
/// `holdFor` timer, a transition to `false` within the window cancels it,
/// and expiry (with the operational FSM in an allowed state, if any are
/// named) posts `postEventType`.
pub fn spawn_guard(device: Arc<Device>, config: GuardConfig, clock: Arc<dyn Clock>) -> Guard {
    let handle = tokio::spawn(async move {
        let mut timer: Option<JoinHandle<()>> = None;
        let mut messages = device.subscribe_messages();
        loop {
            let message = match messages.recv().await {
                Ok(message) => message,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            };
            let DeviceMessageBody::PredicateChanged { predicate, value } = &message.body else { continue };
            if predicate != &config.predicate_name {
                continue;
            }
            if *value {
                if timer.as_ref().is_some_and(|h| !h.is_finished()) {
                    continue;
                }
                let device = device.clone();
                let config = config.clone();
                let clock = clock.clone();
                timer = Some(tokio::spawn(async move {
                    clock.sleep(chrono::Duration::from_std(config.hold_for).unwrap_or_default()).await;
                    fire(&device, &config);
                }));
            } else if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    });
    Guard { handle }
}

fn fire(device: &Device, config: &GuardConfig) {
    if !config.only_in_states.is_empty() {
        let current = device.operational_state();
        if !current.is_some_and(|s| config.only_in_states.contains(&s)) {
            return;
        }
    }
    let mut event = crate::blueprint::OperationalEvent::new(config.post_event_type.clone());
    if let Some(meta) = &config.event_meta {
        event = event.with_meta(meta.clone());
    }
    device.post_signal(event);
}

/// A guard over a named historical predicate evaluated against a sliding
/// window of the last `N` `StateValue`s observed for a property, rather
/// than a single instantaneous predicate cell.
pub struct ValueChangeGuard {
    handle: JoinHandle<()>,
}

impl Drop for ValueChangeGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub type HistoricalPredicate = Arc<dyn Fn(&[StateValue<Meta>]) -> bool + Send + Sync>;

pub fn spawn_value_change_guard(
    device: Arc<Device>,
    source_property: Name,
    window_size: usize,
    predicate: HistoricalPredicate,
    post_event_type: String,
) -> ValueChangeGuard {
    let window: Arc<Mutex<VecDeque<StateValue<Meta>>>> = Arc::new(Mutex::new(VecDeque::with_capacity(window_size)));
    let handle = tokio::spawn(async move {
        let mut messages = device.subscribe_messages();
        loop {
            let message = match messages.recv().await {
                Ok(message) => message,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            };
            let DeviceMessageBody::PropertyChanged { property, value, quality, origin_time, server_time } = message.body else { continue };
            if property != source_property {
                continue;
            }
            let mut window = window.lock().await;
            if window.len() == window_size {
                window.pop_front();
            }
            window.push_back(StateValue::new(value, origin_time, server_time, quality));
            let snapshot: Vec<_> = window.iter().cloned().collect();
            drop(window);
            if predicate(&snapshot) {
                device.post_signal(crate::blueprint::OperationalEvent::new(post_event_type.clone()));
            }
        }
    });
    ValueChangeGuard { handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::descriptor::PropertyDescriptor;
    use crate::blueprint::lifecycle::OperationalFsmBuilder;
    use crate::blueprint::{BlueprintBuilder, ExecutionContext};
    use crate::naming::{Address, CorrelationId};
    use crate::ports::TestClock;

    fn motor_blueprint() -> crate::blueprint::Blueprint {
        BlueprintBuilder::new("motor")
            .property(PropertyDescriptor::logical("temperature", "double").mutable(), None, None)
            .derived_property(
                PropertyDescriptor::predicate("overTemp"),
                vec![Name::single("temperature")],
                Arc::new(|values: &[Meta]| Ok(Meta::leaf(values[0].as_f64().unwrap_or(0.0) > 80.0))),
            )
            .operational_fsm(
                OperationalFsmBuilder::new()
                    .initial("Running")
                    .on("Running", "Cooldown", "CoolingDown"),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn guard_fires_after_hold_for_elapses() {
        let clock = Arc::new(TestClock::new(chrono::Utc::now()));
        let device = Arc::new(Device::new(Address::new("hub", Name::single("m1")), motor_blueprint(), clock.clone()));
        let _derived = crate::reactive::derived::spawn_derived_scheduler(device.clone());
        let config = GuardConfig::new(Name::single("overTemp"), Duration::from_secs(2), "Cooldown");
        let _guard = spawn_guard(device.clone(), config, clock.clone());

        let ctx = ExecutionContext::new(CorrelationId::new("t"));
        for temp in [70.0, 85.0, 85.0, 85.0] {
            device.write_property(&Name::single("temperature"), Meta::leaf(temp), &ctx).await.unwrap();
            tokio::task::yield_now().await;
            clock.advance(chrono::Duration::seconds(1)).await;
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        assert_eq!(device.operational_state(), Some(Arc::from("CoolingDown")));
    }
}
