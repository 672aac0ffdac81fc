//! Composing a [`Blueprint`] from reusable [`SpecificationFragment`]s,
//! replacing the inheritance hierarchies of the source with composition
//! over a builder.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::HubFault;
use crate::meta::Meta;
use crate::naming::Name;

use super::descriptor::{
    ActionDescriptor, ActionMap, ChildConfig, ChildMap, ChildErrorPolicy, PeerBlueprint, PeerMap,
    PropertyDescriptor, PropertyMap, RestartPolicy, StreamMap, StreamSpec,
};
use super::lifecycle::{OperationalFsmBuilder, OperationalFsmSpec};
use super::{Blueprint, BlueprintId, DerivedFactory, ReadHandle, WriteHandle, ActionHandle};

/// A reusable chunk of blueprint configuration (a feature's properties,
/// actions, and logic handles) applied to a builder in sequence. Fragments
/// replace the role base classes play in the source: composition, not
/// runtime polymorphism.
pub trait SpecificationFragment: Send + Sync {
    fn apply(&self, builder: BlueprintBuilder) -> BlueprintBuilder;
}

/// Builds a [`Blueprint`] by accumulating properties, actions, children,
/// and logic handles, then freezing everything into an immutable value.
pub struct BlueprintBuilder {
    id: BlueprintId,
    version: u32,
    tags: Vec<String>,
    properties: PropertyMap,
    actions: ActionMap,
    streams: StreamMap,
    children: ChildMap,
    peers: PeerMap,
    meta: Meta,
    driver: Option<String>,
    child_error_policy: ChildErrorPolicy,
    restart_policy: Option<RestartPolicy>,
    read_handles: BTreeMap<Name, ReadHandle>,
    write_handles: BTreeMap<Name, WriteHandle>,
    action_handles: BTreeMap<Name, ActionHandle>,
    derived_factories: BTreeMap<Name, DerivedFactory>,
    derived_dependencies: BTreeMap<Name, Vec<Name>>,
    operational_fsm: Option<OperationalFsmSpec>,
    guards: Vec<crate::reactive::GuardConfig>,
}

impl BlueprintBuilder {
    pub fn new(id: impl Into<BlueprintId>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            tags: Vec::new(),
            properties: PropertyMap::new(),
            actions: ActionMap::new(),
            streams: StreamMap::new(),
            children: ChildMap::new(),
            peers: PeerMap::new(),
            meta: Meta::empty(),
            driver: None,
            child_error_policy: ChildErrorPolicy::Restart,
            restart_policy: None,
            read_handles: BTreeMap::new(),
            write_handles: BTreeMap::new(),
            action_handles: BTreeMap::new(),
            derived_factories: BTreeMap::new(),
            derived_dependencies: BTreeMap::new(),
            operational_fsm: None,
            guards: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    pub fn child_error_policy(mut self, policy: ChildErrorPolicy) -> Self {
        self.child_error_policy = policy;
        self
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = Some(policy);
        self
    }

    pub fn property(mut self, descriptor: PropertyDescriptor, read: Option<ReadHandle>, write: Option<WriteHandle>) -> Self {
        let name = descriptor.name.clone();
        self.properties.insert(name.clone(), descriptor);
        if let Some(read) = read {
            self.read_handles.insert(name.clone(), read);
        }
        if let Some(write) = write {
            self.write_handles.insert(name, write);
        }
        self
    }

    /// Declares a derived (or predicate) property computed from `dependencies`,
    /// in the order their values are passed to `factory`.
    pub fn derived_property(mut self, descriptor: PropertyDescriptor, dependencies: Vec<Name>, factory: DerivedFactory) -> Self {
        let name = descriptor.name.clone();
        self.properties.insert(name.clone(), descriptor);
        self.derived_factories.insert(name.clone(), factory);
        self.derived_dependencies.insert(name, dependencies);
        self
    }

    pub fn action(mut self, descriptor: ActionDescriptor, handle: ActionHandle) -> Self {
        let name = descriptor.name.clone();
        self.actions.insert(name.clone(), descriptor);
        self.action_handles.insert(name, handle);
        self
    }

    pub fn stream(mut self, spec: StreamSpec) -> Self {
        self.streams.insert(spec.name.clone(), spec);
        self
    }

    pub fn child(mut self, name: impl Into<Name>, config: ChildConfig) -> Self {
        self.children.insert(name.into(), config);
        self
    }

    pub fn peer(mut self, name: impl Into<Name>, peer: PeerBlueprint) -> Self {
        self.peers.insert(name.into(), peer);
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn operational_fsm(mut self, builder: OperationalFsmBuilder) -> Self {
        self.operational_fsm = Some(builder.build());
        self
    }

    /// Declares a timed guard watching a predicate cell, spawned alongside
    /// the device at attach time.
    pub fn guard(mut self, config: crate::reactive::GuardConfig) -> Self {
        self.guards.push(config);
        self
    }

    /// Apply a reusable fragment of configuration.
    pub fn apply_fragment(self, fragment: &dyn SpecificationFragment) -> Self {
        fragment.apply(self)
    }

    pub fn build(self) -> Result<Blueprint, HubFault> {
        validate_disjoint_names(&self.properties, &self.actions, &self.streams, &self.children, &self.peers)?;
        Ok(Blueprint {
            id: self.id,
            version: self.version,
            tags: self.tags,
            properties: self.properties,
            actions: self.actions,
            streams: self.streams,
            children: self.children,
            peers: self.peers,
            meta: self.meta,
            driver: self.driver,
            child_error_policy: self.child_error_policy,
            restart_policy: self.restart_policy,
            read_handles: Arc::new(self.read_handles),
            write_handles: Arc::new(self.write_handles),
            action_handles: Arc::new(self.action_handles),
            derived_factories: Arc::new(self.derived_factories),
            derived_dependencies: Arc::new(self.derived_dependencies),
            operational_fsm: self.operational_fsm,
            guards: self.guards,
        })
    }
}

/// Invariant 1 (§3): within one device, `properties ∪ actions ∪ streams ∪
/// children ∪ peers` names are pairwise disjoint.
fn validate_disjoint_names(
    properties: &PropertyMap,
    actions: &ActionMap,
    streams: &StreamMap,
    children: &ChildMap,
    peers: &PeerMap,
) -> Result<(), HubFault> {
    let mut seen = std::collections::HashSet::new();
    for name in properties.keys().chain(actions.keys()).chain(streams.keys()).chain(children.keys()).chain(peers.keys()) {
        if !seen.insert(name.clone()) {
            return Err(HubFault::InvalidBlueprint(format!("duplicate name {name} across properties/actions/streams/children/peers")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::descriptor::PropertyDescriptor;

    #[test]
    fn builder_rejects_duplicate_names() {
        let result = BlueprintBuilder::new("test")
            .property(PropertyDescriptor::logical("setpoint", "double"), None, None)
            .child("setpoint", ChildConfig::local("other"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_succeeds_with_disjoint_names() {
        let result = BlueprintBuilder::new("test")
            .property(PropertyDescriptor::logical("setpoint", "double"), None, None)
            .child("child1", ChildConfig::local("other"))
            .build();
        assert!(result.is_ok());
    }
}
