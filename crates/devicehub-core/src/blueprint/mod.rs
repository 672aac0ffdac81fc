//! The immutable, serializable device specification: descriptors, features,
//! children, bindings, and the lifecycle/operational FSM builders.

pub mod binding;
pub mod builder;
pub mod descriptor;
pub mod lifecycle;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{DeviceFault, HubFault};
use crate::meta::Meta;
use crate::naming::{CorrelationId, Name};

pub use builder::{BlueprintBuilder, SpecificationFragment};
pub use descriptor::{
    ActionDescriptor, ActionMap, BackoffStrategy, CachePolicy, CacheScope, ChildConfig, ChildErrorPolicy,
    ChildMap, ChildSource, LifecycleMode, PeerBlueprint, PeerMap, PropertyDescriptor, PropertyKind,
    PropertyMap, RestartPolicy, StreamMap, StreamSpec, ValidationRule, ValidationRuleError,
};
pub use lifecycle::{LifecycleEvent, LifecycleFsm, LifecycleState, OperationalEvent, OperationalFsm, OperationalFsmBuilder, OperationalFsmSpec, OperationalState};

pub type BlueprintId = Arc<str>;

/// Who is asking, and under what deadline/trace — threaded through every
/// device runtime and coordinator call.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub correlation_id: CorrelationId,
    pub principal: Option<String>,
    pub deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub trace_context: Meta,
}

impl ExecutionContext {
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self { correlation_id, principal: None, deadline: None, trace_context: Meta::empty() }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_deadline(mut self, deadline: chrono::DateTime<chrono::Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

pub type ActionResult = Result<Option<Meta>, DeviceFault>;

/// A blueprint's read logic for one physical property.
pub type ReadHandle = Arc<dyn Fn(&ExecutionContext) -> Result<Meta, DeviceFault> + Send + Sync>;
/// A blueprint's write logic for one mutable property, run after validation
/// rules pass and required locks are held.
pub type WriteHandle = Arc<dyn Fn(&Meta, &ExecutionContext) -> Result<(), DeviceFault> + Send + Sync>;
/// A blueprint's action logic.
pub type ActionHandle = Arc<dyn Fn(&Meta, &ExecutionContext) -> ActionResult + Send + Sync>;
/// Computes a derived property's value from its current source values, in
/// the order the property declared its dependencies.
pub type DerivedFactory = Arc<dyn Fn(&[Meta]) -> Result<Meta, String> + Send + Sync>;

/// An immutable, serializable device specification.
#[derive(Clone)]
pub struct Blueprint {
    pub id: BlueprintId,
    pub version: u32,
    pub tags: Vec<String>,
    pub properties: PropertyMap,
    pub actions: ActionMap,
    pub streams: StreamMap,
    pub children: ChildMap,
    pub peers: PeerMap,
    pub meta: Meta,
    pub driver: Option<String>,
    pub child_error_policy: ChildErrorPolicy,
    pub restart_policy: Option<RestartPolicy>,
    pub read_handles: Arc<BTreeMap<Name, ReadHandle>>,
    pub write_handles: Arc<BTreeMap<Name, WriteHandle>>,
    pub action_handles: Arc<BTreeMap<Name, ActionHandle>>,
    pub derived_factories: Arc<BTreeMap<Name, DerivedFactory>>,
    pub derived_dependencies: Arc<BTreeMap<Name, Vec<Name>>>,
    pub operational_fsm: Option<OperationalFsmSpec>,
    pub guards: Vec<crate::reactive::GuardConfig>,
}

impl Blueprint {
    pub fn builder(id: impl Into<BlueprintId>) -> BlueprintBuilder {
        BlueprintBuilder::new(id)
    }

    /// Invariant 3 (§3): no cycle in child composition. Validated by
    /// walking child configs transitively against a registry; a blueprint
    /// with only local child ids can be checked directly against the set of
    /// already-visited ids passed in by the caller (the registry owns the
    /// full transitive walk).
    pub fn validate_no_self_cycle(&self, ancestors: &[BlueprintId]) -> Result<(), HubFault> {
        if ancestors.contains(&self.id) {
            return Err(HubFault::InvalidBlueprint(format!(
                "cycle in child composition: {} appears in its own ancestry",
                self.id
            )));
        }
        Ok(())
    }

    /// Invariant 4 (§3): declaring actions with a cache policy implies no
    /// extra feature (cache is ambient); declaring a blueprint with
    /// children implies nothing extra either — the hub always carries a
    /// `PlanExecutor`. Kept as an explicit check so blueprint authors get a
    /// validation error instead of a silent no-op at run time.
    pub fn validate_feature_consistency(&self) -> Result<(), HubFault> {
        for (name, action) in &self.actions {
            if !self.action_handles.contains_key(name) {
                return Err(HubFault::InvalidBlueprint(format!("action {name} declared without a handle")));
            }
            let _ = action;
        }
        for (name, property) in &self.properties {
            if property.kind == PropertyKind::Derived && !self.derived_factories.contains_key(name) {
                return Err(HubFault::InvalidBlueprint(format!("derived property {name} declared without a factory")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blueprint_rejects_action_without_handle() {
        let blueprint = BlueprintBuilder::new("test")
            .build()
            .unwrap();
        assert!(blueprint.validate_feature_consistency().is_ok());
    }

    #[test]
    fn self_cycle_detected() {
        let blueprint = BlueprintBuilder::new("loopy").build().unwrap();
        let ancestors = vec![blueprint.id.clone()];
        assert!(blueprint.validate_no_self_cycle(&ancestors).is_err());
    }
}
