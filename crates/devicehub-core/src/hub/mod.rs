//! The Hub Supervisor: owns the device tree, attach/detach, lifecycle
//! transitions, child error policies, and the aggregated hub event bus.

pub mod bindings_runtime;
pub mod events;
pub mod restart;
pub mod tree;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::blueprint::binding::TransformerRegistry;
use crate::blueprint::{ChildErrorPolicy, ChildSource, ExecutionContext, LifecycleEvent, LifecycleState};
use crate::device::{Device, ExecuteError, ReadError, WriteError};
use crate::error::HubFault;
use crate::meta::Meta;
use crate::naming::{Address, Name};
use crate::ports::{AuthorizationService, BlueprintRegistry, Clock};
use crate::reactive::{spawn_derived_scheduler, spawn_guard, DerivedScheduler, Guard};

use self::bindings_runtime::{spawn_binding, BindingTask};
use self::events::{DeviceHubEvent, DeviceMessage, DeviceMessageBody};
use self::restart::{RestartOutcome, RestartTracker};
use self::tree::DeviceTree;

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-device runtime bookkeeping the hub keeps alongside the device
/// itself: its parent (for error-policy propagation), running binding
/// tasks, reactive graph tasks, and its restart tracker. All task handles
/// are aborted on drop, so removing an entry from `entries` tears down the
/// device's whole reactive scope.
struct DeviceEntry {
    device: Arc<Device>,
    parent: Option<Name>,
    child_error_policy: ChildErrorPolicy,
    binding_tasks: Vec<BindingTask>,
    restart: Option<Arc<RestartTracker>>,
    #[allow(dead_code)]
    derived_scheduler: Option<DerivedScheduler>,
    #[allow(dead_code)]
    guard_tasks: Vec<Guard>,
}

/// Owns the device tree for one process.
pub struct Hub {
    hub_id: Arc<str>,
    tree: DeviceTree,
    entries: tokio::sync::RwLock<HashMap<Name, DeviceEntry>>,
    registry: Arc<dyn BlueprintRegistry>,
    authz: Arc<dyn AuthorizationService>,
    clock: Arc<dyn Clock>,
    transformers: TransformerRegistry,
    events: broadcast::Sender<DeviceHubEvent>,
    shutdown: Arc<crate::shutdown::GracefulShutdown>,
}

impl Hub {
    pub fn new(hub_id: impl Into<Arc<str>>, registry: Arc<dyn BlueprintRegistry>, authz: Arc<dyn AuthorizationService>, clock: Arc<dyn Clock>) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            hub_id: hub_id.into(),
            tree: DeviceTree::new(),
            entries: tokio::sync::RwLock::new(HashMap::new()),
            registry,
            authz,
            clock,
            transformers: TransformerRegistry::with_builtins(),
            events,
            shutdown: Arc::new(crate::shutdown::GracefulShutdown::new()),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<DeviceHubEvent> {
        self.events.subscribe()
    }

    pub fn hub_id(&self) -> Arc<str> {
        self.hub_id.clone()
    }

    /// A token that resolves once [`Hub::shutdown`] has been called, for
    /// any caller (a device scope, a transaction run) that needs to race
    /// its own work against hub-wide shutdown.
    pub fn shutdown_token(&self) -> crate::shutdown::ShutdownToken {
        self.shutdown.token()
    }

    /// Detaches every attached device, tearing down their bindings, derived
    /// schedulers, and guards, then marks the hub as shut down so any
    /// in-flight transaction run still racing a [`crate::shutdown::ShutdownToken`]
    /// unwinds too.
    pub async fn shutdown(&self, ctx: &ExecutionContext) {
        let names: Vec<Name> = self.tree.snapshot().await.into_keys().collect();
        for name in names {
            let _ = self.detach(&name, ctx).await;
        }
        self.shutdown.shutdown(crate::shutdown::ShutdownSignal::Manual);
    }

    pub async fn devices(&self) -> HashMap<Name, Arc<Device>> {
        self.tree.snapshot().await
    }

    pub async fn find_device(&self, address: &Address) -> Option<Arc<Device>> {
        if address.hub_id.as_ref() != self.hub_id.as_ref() {
            return None;
        }
        self.tree.get(&address.device).await
    }

    fn address_of(&self, name: &Name) -> Address {
        Address::new(self.hub_id.clone(), name.clone())
    }

    fn emit(&self, message: DeviceMessage, ctx: &ExecutionContext) {
        let _ = self.events.send(DeviceHubEvent::new(message, ctx.clone()));
    }

    /// `attach(name, blueprintId) → ()`. Attaches the named device as a
    /// root of a new subtree, then recursively instantiates its declared
    /// non-lazy children, wiring each child's bindings against this device
    /// as their source.
    pub async fn attach(&self, name: Name, blueprint_id: Arc<str>, ctx: &ExecutionContext) -> Result<(), HubFault> {
        self.attach_at(name, blueprint_id, None, ctx).await
    }

    fn attach_at<'a>(
        &'a self,
        name: Name,
        blueprint_id: Arc<str>,
        parent: Option<Name>,
        ctx: &'a ExecutionContext,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HubFault>> + Send + 'a>> {
        Box::pin(async move {
            if self.tree.contains(&name).await {
                return Err(HubFault::DeviceAlreadyAttached(name));
            }
            let blueprint = self
                .registry
                .find_by_id(&blueprint_id)
                .await
                .ok_or_else(|| HubFault::InvalidBlueprint(format!("no blueprint registered for id {blueprint_id}")))?;
            blueprint.validate_feature_consistency()?;

            let device = Arc::new(Device::new(self.address_of(&name), blueprint.clone(), self.clock.clone()));
            device.post_lifecycle_event(LifecycleEvent::Attach);
            device.post_lifecycle_event(LifecycleEvent::Attach);

            let restart = blueprint.restart_policy.map(|policy| Arc::new(RestartTracker::new(policy, self.clock.clone())));
            let derived_scheduler = (!blueprint.derived_dependencies.is_empty()).then(|| spawn_derived_scheduler(device.clone()));
            let guard_tasks = blueprint.guards.iter().map(|config| spawn_guard(device.clone(), config.clone(), self.clock.clone())).collect();

            self.tree.insert(name.clone(), device.clone()).await;
            self.entries.write().await.insert(
                name.clone(),
                DeviceEntry {
                    device: device.clone(),
                    parent: parent.clone(),
                    child_error_policy: blueprint.child_error_policy,
                    binding_tasks: Vec::new(),
                    restart,
                    derived_scheduler,
                    guard_tasks,
                },
            );

            self.emit(
                DeviceMessage::new(self.clock.now(), self.address_of(&name), DeviceMessageBody::DeviceAttached { device_name: name.clone() })
                    .with_correlation(ctx.correlation_id.clone()),
                ctx,
            );

            for (child_name, child_config) in &blueprint.children {
                if child_config.lazy_attach {
                    continue;
                }
                let ChildSource::Local { blueprint_id } = &child_config.source else {
                    continue;
                };
                let full_child_name = name.join(child_name);
                self.attach_at(full_child_name.clone(), Arc::from(blueprint_id.as_str()), Some(name.clone()), ctx).await?;
                self.apply_bindings_from(&name, &full_child_name, &child_config.bindings).await?;
            }
            Ok(())
        })
    }

    async fn apply_bindings_from(&self, parent_name: &Name, child_name: &Name, bindings: &[crate::blueprint::binding::PropertyBinding]) -> Result<(), HubFault> {
        if bindings.is_empty() {
            return Ok(());
        }
        let parent = self.tree.get(parent_name).await.ok_or_else(|| HubFault::DeviceNotFound(parent_name.clone()))?;
        let child = self.tree.get(child_name).await.ok_or_else(|| HubFault::DeviceNotFound(child_name.clone()))?;
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(child_name) else { return Ok(()) };
        for binding in bindings {
            entry.binding_tasks.push(spawn_binding(parent.clone(), child.clone(), binding.clone(), self.transformers.clone()));
        }
        Ok(())
    }

    /// `detach(name)`.
    pub async fn detach(&self, name: &Name, ctx: &ExecutionContext) -> Result<(), HubFault> {
        let device = self.tree.get(name).await.ok_or_else(|| HubFault::DeviceNotFound(name.clone()))?;
        if device.lifecycle_state() == LifecycleState::Running {
            self.stop(name, ctx).await?;
        }
        device.post_lifecycle_event(LifecycleEvent::Detach);
        device.post_lifecycle_event(LifecycleEvent::Detach);
        self.entries.write().await.remove(name);
        self.tree.remove(name).await;
        self.emit(
            DeviceMessage::new(self.clock.now(), self.address_of(name), DeviceMessageBody::DeviceDetached { device_name: name.clone() })
                .with_correlation(ctx.correlation_id.clone()),
            ctx,
        );
        Ok(())
    }

    /// `start(name)`, driving the lifecycle FSM and applying the restart
    /// policy if the start hook fails.
    pub async fn start(&self, name: &Name, ctx: &ExecutionContext) -> Result<(), HubFault> {
        let device = self.tree.get(name).await.ok_or_else(|| HubFault::DeviceNotFound(name.clone()))?;
        let from = device.lifecycle_state();
        let result = tokio::time::timeout(DEFAULT_START_TIMEOUT, self.run_start(&device)).await;
        match result {
            Ok(Ok(())) => {
                let restart = self.entries.read().await.get(name).and_then(|e| e.restart.clone());
                if let Some(restart) = restart {
                    restart.on_success();
                }
                self.emit(
                    DeviceMessage::new(self.clock.now(), self.address_of(name), DeviceMessageBody::LifecycleStateChanged { from, to: LifecycleState::Running })
                        .with_correlation(ctx.correlation_id.clone()),
                    ctx,
                );
                Ok(())
            }
            Ok(Err(fault)) => {
                self.handle_start_failure(name, device, fault, ctx).await
            }
            Err(_) => {
                self.handle_start_failure(name, device, HubFault::Internal("start timed out".to_string()), ctx).await
            }
        }
    }

    async fn run_start(&self, device: &Arc<Device>) -> Result<(), HubFault> {
        device.post_lifecycle_event(LifecycleEvent::Start);
        device.post_lifecycle_event(LifecycleEvent::Start);
        Ok(())
    }

    async fn handle_start_failure(&self, name: &Name, device: Arc<Device>, fault: HubFault, ctx: &ExecutionContext) -> Result<(), HubFault> {
        device.post_lifecycle_event(LifecycleEvent::Fail(fault.to_string()));
        self.emit(
            DeviceMessage::new(
                self.clock.now(),
                self.address_of(name),
                DeviceMessageBody::DeviceError { failure: crate::error::DeviceFault::new("START_FAILED", fault.to_string()).into() },
            )
            .with_correlation(ctx.correlation_id.clone()),
            ctx,
        );
        let restart = self.entries.read().await.get(name).and_then(|e| e.restart.clone());
        if let Some(restart) = restart {
            match restart.on_failure().await {
                RestartOutcome::RetryAfter { .. } => {
                    device.post_lifecycle_event(LifecycleEvent::Reset);
                    return Box::pin(self.start(name, ctx)).await;
                }
                RestartOutcome::Exhausted => {}
            }
        }
        Err(fault)
    }

    /// `stop(name)`.
    pub async fn stop(&self, name: &Name, ctx: &ExecutionContext) -> Result<(), HubFault> {
        let device = self.tree.get(name).await.ok_or_else(|| HubFault::DeviceNotFound(name.clone()))?;
        let from = device.lifecycle_state();
        let result = tokio::time::timeout(DEFAULT_STOP_TIMEOUT, async {
            device.post_lifecycle_event(LifecycleEvent::Stop);
            device.post_lifecycle_event(LifecycleEvent::Stop);
        })
        .await;
        result.map_err(|_| HubFault::Internal("stop timed out".to_string()))?;
        self.emit(
            DeviceMessage::new(self.clock.now(), self.address_of(name), DeviceMessageBody::LifecycleStateChanged { from, to: LifecycleState::Stopped })
                .with_correlation(ctx.correlation_id.clone()),
            ctx,
        );
        Ok(())
    }

    async fn check_authorized(&self, device_address: &Address, ctx: &ExecutionContext, operation: &str) -> Result<(), HubFault> {
        let decision = self.authz.authorize(ctx.principal.as_deref(), device_address, operation).await;
        if decision.is_allowed() {
            Ok(())
        } else {
            Err(HubFault::Internal(format!("authorization denied for {operation} on {device_address}")))
        }
    }

    pub async fn read_property(&self, device_name: &Name, property: &Name, ctx: &ExecutionContext) -> Result<Meta, HubFault> {
        let address = self.address_of(device_name);
        self.check_authorized(&address, ctx, "read").await?;
        let device = self.tree.get(device_name).await.ok_or_else(|| HubFault::DeviceNotFound(device_name.clone()))?;
        device.read_property(property, ctx).await.map_err(|e| read_error_to_fault(device_name, property, e))
    }

    pub async fn write_property(&self, device_name: &Name, property: &Name, value: Meta, ctx: &ExecutionContext) -> Result<(), HubFault> {
        let address = self.address_of(device_name);
        self.check_authorized(&address, ctx, "write").await?;
        let device = self.tree.get(device_name).await.ok_or_else(|| HubFault::DeviceNotFound(device_name.clone()))?;
        device.write_property(property, value, ctx).await.map_err(|e| write_error_to_fault(device_name, property, e))
    }

    pub async fn execute(&self, device_name: &Name, action: &Name, input: Meta, ctx: &ExecutionContext) -> Result<Option<Meta>, HubFault> {
        let address = self.address_of(device_name);
        self.check_authorized(&address, ctx, "execute").await?;
        let device = self.tree.get(device_name).await.ok_or_else(|| HubFault::DeviceNotFound(device_name.clone()))?;
        device.execute(action, input, ctx).await.map_err(|e| execute_error_to_fault(device_name, action, e))
    }
}

fn read_error_to_fault(device: &Name, property: &Name, error: ReadError) -> HubFault {
    match error {
        ReadError::PropertyNotFound(_) => HubFault::NoSuchProperty { device: device.clone(), property: property.to_string() },
        ReadError::NotReadable(_) => HubFault::Internal(format!("{property} is not readable")),
        ReadError::PermissionDenied(_) => HubFault::Internal(format!("permission denied reading {property}")),
        ReadError::Timeout(_) => HubFault::Internal(format!("timeout reading {property}")),
        ReadError::Fault(f) => HubFault::Device(f),
    }
}

fn write_error_to_fault(device: &Name, property: &Name, error: WriteError) -> HubFault {
    match error {
        WriteError::PropertyNotFound(_) => HubFault::NoSuchProperty { device: device.clone(), property: property.to_string() },
        WriteError::NotMutable(_) => HubFault::Internal(format!("{property} is not mutable")),
        WriteError::ValidationError(_, reason) => HubFault::Internal(format!("validation failed for {property}: {reason}")),
        WriteError::Timeout(_) => HubFault::Internal(format!("timeout writing {property}")),
        WriteError::PermissionDenied(_) => HubFault::Internal(format!("permission denied writing {property}")),
        WriteError::Fault(f) => HubFault::Device(f),
        WriteError::Lock(f) => f,
    }
}

fn execute_error_to_fault(device: &Name, action: &Name, error: ExecuteError) -> HubFault {
    match error {
        ExecuteError::ActionNotFound(_) => HubFault::NoSuchAction { device: device.clone(), action: action.to_string() },
        ExecuteError::PreconditionNotMet(_) => HubFault::Internal(format!("precondition not met for {action}")),
        ExecuteError::Timeout(_) => HubFault::Internal(format!("timeout executing {action}")),
        ExecuteError::Fault(f) => HubFault::Device(f),
        ExecuteError::Lock(f) => f,
    }
}
