//! The Device Runtime Instance: the live embodiment of a blueprint.

pub mod locks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout as tokio_timeout;

use crate::blueprint::{
    Blueprint, ExecutionContext, LifecycleEvent, LifecycleFsm, LifecycleState, OperationalEvent,
    OperationalFsm, PropertyKind,
};
use crate::blueprint::lifecycle::new_lifecycle_fsm;
use crate::error::{DeviceFault, HubFault};
use crate::meta::Meta;
use crate::naming::{Address, Name};
use crate::ports::Clock;
use crate::state::{Cell, Quality, StateValue};

use self::locks::LockTable;
use crate::hub::events::{DeviceMessage, DeviceMessageBody};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Error surfaced from a property read, distinguishing the reasons named in
/// the spec from a generic `HubFault`.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("no such property {0}")]
    PropertyNotFound(Name),
    #[error("property {0} is not readable")]
    NotReadable(Name),
    #[error("permission denied reading {0}")]
    PermissionDenied(Name),
    #[error("timed out reading {0}")]
    Timeout(Name),
    #[error(transparent)]
    Fault(#[from] DeviceFault),
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("no such property {0}")]
    PropertyNotFound(Name),
    #[error("property {0} is not mutable")]
    NotMutable(Name),
    #[error("validation failed for {0}: {1}")]
    ValidationError(Name, String),
    #[error("timed out writing {0}")]
    Timeout(Name),
    #[error("permission denied writing {0}")]
    PermissionDenied(Name),
    #[error(transparent)]
    Fault(#[from] DeviceFault),
    #[error(transparent)]
    Lock(#[from] HubFault),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("no such action {0}")]
    ActionNotFound(Name),
    #[error("precondition not met for {0}")]
    PreconditionNotMet(Name),
    #[error("timed out executing {0}")]
    Timeout(Name),
    #[error(transparent)]
    Fault(#[from] DeviceFault),
    #[error(transparent)]
    Lock(#[from] HubFault),
}

/// A live instance of a [`Blueprint`]: owns its cells, descriptors, message
/// flow, and the two FSMs every device runs.
pub struct Device {
    pub address: Address,
    pub blueprint: Blueprint,
    cells: HashMap<Name, Cell<Meta>>,
    locks: LockTable,
    lifecycle: LifecycleFsm,
    operational: Option<OperationalFsm>,
    messages: broadcast::Sender<DeviceMessage>,
    clock: Arc<dyn Clock>,
}

impl Device {
    /// Instantiate a device from a blueprint. Every declared property
    /// starts `UNCERTAIN(INITIAL)` with the blueprint's declared meta as its
    /// initial value, per §3's cell birth invariant.
    pub fn new(address: Address, blueprint: Blueprint, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let mut cells = HashMap::new();
        for name in blueprint.properties.keys() {
            let initial = StateValue::new(Meta::empty(), now, now, Quality::uncertain("INITIAL"));
            cells.insert(name.clone(), Cell::new(initial));
        }
        let operational = blueprint.operational_fsm.as_ref().map(|spec| spec.instantiate());
        let (messages, _rx) = broadcast::channel(256);
        Self {
            address,
            blueprint,
            cells,
            locks: LockTable::new(),
            lifecycle: new_lifecycle_fsm(),
            operational,
            messages,
            clock,
        }
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.current()
    }

    pub fn subscribe_lifecycle(&self) -> tokio::sync::watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<DeviceMessage> {
        self.messages.subscribe()
    }

    pub fn post_lifecycle_event(&self, event: LifecycleEvent) -> Option<LifecycleState> {
        let from = self.lifecycle.current();
        let to = self.lifecycle.post(&event)?;
        if to != from {
            let _ = self.messages.send(DeviceMessage::new(
                self.clock.now(),
                self.address.clone(),
                DeviceMessageBody::LifecycleStateChanged { from, to },
            ));
        }
        Some(to)
    }

    /// `postSignal`: fires a signal into the operational FSM. Returns
    /// `false` if no transition accepts it from the current state.
    pub fn post_signal(&self, event: OperationalEvent) -> bool {
        match &self.operational {
            Some(fsm) => {
                let predicate_name = event.name.clone();
                let accepted = fsm.post(&event).is_some();
                if accepted {
                    let _ = self.messages.send(DeviceMessage::new(
                        self.clock.now(),
                        self.address.clone(),
                        DeviceMessageBody::PredicateChanged { predicate: Name::single(predicate_name), value: true },
                    ));
                }
                accepted
            }
            None => false,
        }
    }

    pub fn operational_state(&self) -> Option<crate::blueprint::OperationalState> {
        self.operational.as_ref().map(|fsm| fsm.current())
    }

    fn cell(&self, name: &Name) -> Option<&Cell<Meta>> {
        self.cells.get(name)
    }

    /// `readProperty(name, exec_ctx) → Meta | Fault`.
    pub async fn read_property(&self, name: &Name, ctx: &ExecutionContext) -> Result<Meta, ReadError> {
        let descriptor = self
            .blueprint
            .properties
            .get(name)
            .ok_or_else(|| ReadError::PropertyNotFound(name.clone()))?;
        if !descriptor.readable {
            return Err(ReadError::NotReadable(name.clone()));
        }
        let run = async {
            match descriptor.kind {
                PropertyKind::Physical => {
                    let handle = self
                        .blueprint
                        .read_handles
                        .get(name)
                        .ok_or_else(|| ReadError::PropertyNotFound(name.clone()))?;
                    Ok(handle(ctx)?)
                }
                PropertyKind::Logical | PropertyKind::Derived | PropertyKind::Predicate => {
                    let cell = self.cell(name).ok_or_else(|| ReadError::PropertyNotFound(name.clone()))?;
                    Ok(cell.get().value)
                }
            }
        };
        match descriptor.timeout {
            Some(timeout) => tokio_timeout(timeout, run).await.map_err(|_| ReadError::Timeout(name.clone()))?,
            None => run.await,
        }
    }

    /// `writeProperty(name, value, exec_ctx) → () | Fault`.
    pub async fn write_property(&self, name: &Name, value: Meta, ctx: &ExecutionContext) -> Result<(), WriteError> {
        let descriptor = self
            .blueprint
            .properties
            .get(name)
            .ok_or_else(|| WriteError::PropertyNotFound(name.clone()))?;
        if !descriptor.mutable {
            return Err(WriteError::NotMutable(name.clone()));
        }
        for rule in &descriptor.validation_rules {
            if let Err(e) = rule.check(&value) {
                return Err(WriteError::ValidationError(name.clone(), e.to_string()));
            }
        }

        let run = async {
            let _guard = self.locks.acquire_all(&descriptor.required_locks, DEFAULT_LOCK_TIMEOUT).await?;
            if let Some(handle) = self.blueprint.write_handles.get(name) {
                handle(&value, ctx)?;
            }
            if matches!(descriptor.kind, PropertyKind::Logical) {
                if let Some(cell) = self.cell(name) {
                    let now = self.clock.now();
                    cell.update_value(value.clone(), now, now);
                    let _ = self.messages.send(DeviceMessage::new(
                        now,
                        self.address.clone(),
                        DeviceMessageBody::PropertyChanged {
                            property: name.clone(),
                            value,
                            quality: Quality::Good,
                            origin_time: now,
                            server_time: now,
                        },
                    ));
                }
            }
            Ok::<(), WriteError>(())
        };

        match descriptor.timeout {
            Some(t) => tokio_timeout(t, run).await.map_err(|_| WriteError::Timeout(name.clone()))?,
            None => run.await,
        }
    }

    /// `execute(action, input, exec_ctx) → Meta? | Fault`.
    pub async fn execute(&self, action: &Name, input: Meta, ctx: &ExecutionContext) -> Result<Option<Meta>, ExecuteError> {
        let descriptor = self
            .blueprint
            .actions
            .get(action)
            .ok_or_else(|| ExecuteError::ActionNotFound(action.clone()))?;

        for predicate in &descriptor.required_predicates {
            let holds = self.cell(predicate).map(|c| c.get().value.as_bool().unwrap_or(false)).unwrap_or(false);
            if !holds {
                return Err(ExecuteError::PreconditionNotMet(action.clone()));
            }
        }

        if let Some(event_name) = &descriptor.operational_event_types.on_invoke {
            self.post_signal(OperationalEvent::new(event_name.clone()));
        }

        let handle = self
            .blueprint
            .action_handles
            .get(action)
            .ok_or_else(|| ExecuteError::ActionNotFound(action.clone()))?
            .clone();
        let input_clone = input.clone();
        let run = async {
            let _guard = self.locks.acquire_all(&descriptor.required_locks, DEFAULT_LOCK_TIMEOUT).await?;
            Ok::<_, ExecuteError>(handle(&input_clone, ctx)?)
        };

        let outcome = match descriptor.default_timeout {
            Some(t) => tokio_timeout(t, run).await.map_err(|_| ExecuteError::Timeout(action.clone()))?,
            None => run.await,
        };

        match &outcome {
            Ok(_) => {
                if let Some(event_name) = &descriptor.operational_event_types.on_success {
                    self.post_signal(OperationalEvent::new(event_name.clone()));
                }
            }
            Err(_) => {
                if let Some(event_name) = &descriptor.operational_event_types.on_failure {
                    self.post_signal(OperationalEvent::new(event_name.clone()));
                }
            }
        }
        outcome
    }

    /// Recompute a derived cell from its sources' current values, applying
    /// the worst-of quality and max-of-timestamp rules. On handler panic or
    /// error the cell is reset to quality `BAD("COMPUTE_ERROR")`. Emits
    /// `PropertyChanged`, and `PredicateChanged` as well for a predicate
    /// property, so downstream derived properties and guards observe the
    /// update through the same message flow as a physical write.
    pub fn recompute_derived(&self, name: &Name, sources: &[Name]) {
        let Some(factory) = self.blueprint.derived_factories.get(name) else { return };
        let Some(target_cell) = self.cell(name) else { return };
        let mut values = Vec::with_capacity(sources.len());
        let mut worst_quality = Quality::Good;
        let mut max_ts = None;
        for source in sources {
            let Some(cell) = self.cell(source) else { return };
            let state = cell.get();
            worst_quality = worst_quality.combine(&state.quality);
            max_ts = Some(max_ts.map_or(state.server_time, |t: chrono::DateTime<chrono::Utc>| t.max(state.server_time)));
            values.push(state.value);
        }
        let now = max_ts.unwrap_or_else(|| self.clock.now());
        let (value, quality) = match factory(&values) {
            Ok(value) => (value, worst_quality),
            Err(_) => (Meta::empty(), Quality::bad("COMPUTE_ERROR")),
        };
        target_cell.set(StateValue::new(value.clone(), now, now, quality.clone()));
        let _ = self.messages.send(DeviceMessage::new(
            now,
            self.address.clone(),
            DeviceMessageBody::PropertyChanged {
                property: name.clone(),
                value: value.clone(),
                quality,
                origin_time: now,
                server_time: now,
            },
        ));
        if self.blueprint.properties.get(name).map(|d| d.kind) == Some(PropertyKind::Predicate) {
            let _ = self.messages.send(DeviceMessage::new(
                now,
                self.address.clone(),
                DeviceMessageBody::PredicateChanged { predicate: name.clone(), value: value.as_bool().unwrap_or(false) },
            ));
        }
    }

    /// The dependency lists declared for this device's derived and
    /// predicate properties, used by the reactive graph scheduler.
    pub fn derived_dependencies(&self) -> &std::collections::BTreeMap<Name, Vec<Name>> {
        &self.blueprint.derived_dependencies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::descriptor::PropertyDescriptor;
    use crate::blueprint::BlueprintBuilder;
    use crate::naming::CorrelationId;
    use crate::ports::SystemClock;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(CorrelationId::new("test"))
    }

    #[tokio::test]
    async fn write_then_read_logical_property() {
        let blueprint = BlueprintBuilder::new("test")
            .property(PropertyDescriptor::logical("setpoint", "double").mutable(), None, None)
            .build()
            .unwrap();
        let device = Device::new(Address::new("hub", Name::single("dev")), blueprint, Arc::new(SystemClock));
        let name = Name::single("setpoint");
        device.write_property(&name, Meta::leaf(42.0), &ctx()).await.unwrap();
        let value = device.read_property(&name, &ctx()).await.unwrap();
        assert_eq!(value, Meta::leaf(42.0));
    }

    #[tokio::test]
    async fn write_to_immutable_property_fails() {
        let blueprint = BlueprintBuilder::new("test")
            .property(PropertyDescriptor::logical("ro", "double"), None, None)
            .build()
            .unwrap();
        let device = Device::new(Address::new("hub", Name::single("dev")), blueprint, Arc::new(SystemClock));
        let result = device.write_property(&Name::single("ro"), Meta::leaf(1.0), &ctx()).await;
        assert!(matches!(result, Err(WriteError::NotMutable(_))));
    }

    #[tokio::test]
    async fn validation_rule_rejects_write() {
        let blueprint = BlueprintBuilder::new("test")
            .property(
                PropertyDescriptor::logical("pct", "double")
                    .mutable()
                    .with_validation(crate::blueprint::ValidationRule::Range { min: Some(0.0), max: Some(100.0) }),
                None,
                None,
            )
            .build()
            .unwrap();
        let device = Device::new(Address::new("hub", Name::single("dev")), blueprint, Arc::new(SystemClock));
        let result = device.write_property(&Name::single("pct"), Meta::leaf(200.0), &ctx()).await;
        assert!(matches!(result, Err(WriteError::ValidationError(_, _))));
    }

    #[tokio::test]
    async fn lifecycle_transitions_emit_messages() {
        let blueprint = BlueprintBuilder::new("test").build().unwrap();
        let device = Device::new(Address::new("hub", Name::single("dev")), blueprint, Arc::new(SystemClock));
        let mut messages = device.subscribe_messages();
        device.post_lifecycle_event(LifecycleEvent::Attach);
        device.post_lifecycle_event(LifecycleEvent::Attach);
        let msg = messages.recv().await.unwrap();
        assert!(matches!(msg.body, DeviceMessageBody::LifecycleStateChanged { .. }));
    }

    #[tokio::test]
    async fn derived_cell_recomputes_worst_quality() {
        let blueprint = BlueprintBuilder::new("test")
            .property(PropertyDescriptor::logical("a", "double").mutable(), None, None)
            .property(PropertyDescriptor::logical("b", "double").mutable(), None, None)
            .derived_property(
                PropertyDescriptor::derived("sum", "double"),
                vec![Name::single("a"), Name::single("b")],
                Arc::new(|values: &[Meta]| {
                    let total: f64 = values.iter().filter_map(Meta::as_f64).sum();
                    Ok(Meta::leaf(total))
                }),
            )
            .build()
            .unwrap();
        let device = Device::new(Address::new("hub", Name::single("dev")), blueprint, Arc::new(SystemClock));
        device.write_property(&Name::single("a"), Meta::leaf(2.0), &ctx()).await.unwrap();
        device.write_property(&Name::single("b"), Meta::leaf(3.0), &ctx()).await.unwrap();
        device.recompute_derived(&Name::single("sum"), &[Name::single("a"), Name::single("b")]);
        let result = device.read_property(&Name::single("sum"), &ctx()).await.unwrap();
        assert_eq!(result, Meta::leaf(5.0));
    }
}
