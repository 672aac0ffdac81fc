//! The derived-property scheduler: recomputes derived and predicate
//! properties when any of their declared dependencies change, coalescing
//! near-simultaneous source updates into a single recomputation per tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::device::Device;
use crate::hub::events::DeviceMessageBody;
use crate::naming::Name;

/// Owns the background task that keeps one device's derived graph up to
/// date. Aborted on drop, matching [`crate::hub::bindings_runtime::BindingTask`].
pub struct DerivedScheduler {
    handle: JoinHandle<()>,
}

impl Drop for DerivedScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn the scheduler for `device`. Builds a reverse index from source
/// property to the derived properties that depend on it, then drives
/// recomputation off the device's own message flow so no other component
/// needs to know the dependency graph exists.
pub fn spawn_derived_scheduler(device: Arc<Device>) -> DerivedScheduler {
    let mut reverse: HashMap<Name, Vec<Name>> = HashMap::new();
    for (derived, dependencies) in device.derived_dependencies() {
        for dep in dependencies {
            reverse.entry(dep.clone()).or_default().push(derived.clone());
        }
    }
    let dependencies = device.derived_dependencies().clone();

    let handle = tokio::spawn(async move {
        if reverse.is_empty() {
            return;
        }
        let mut messages = device.subscribe_messages();
        loop {
            let mut dirty: HashSet<Name> = HashSet::new();
            match messages.recv().await {
                Ok(message) => mark_dirty(&reverse, &message.body, &mut dirty),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
            // Drain whatever else already queued up so a burst of near
            // simultaneous source writes collapses into one recompute pass.
            loop {
                match messages.try_recv() {
                    Ok(message) => mark_dirty(&reverse, &message.body, &mut dirty),
                    Err(_) => break,
                }
            }
            for name in &dirty {
                if let Some(sources) = dependencies.get(name) {
                    device.recompute_derived(name, sources);
                }
            }
        }
    });
    DerivedScheduler { handle }
}

fn mark_dirty(reverse: &HashMap<Name, Vec<Name>>, body: &DeviceMessageBody, dirty: &mut HashSet<Name>) {
    let changed = match body {
        DeviceMessageBody::PropertyChanged { property, .. } => Some(property),
        DeviceMessageBody::PredicateChanged { predicate, .. } => Some(predicate),
        _ => None,
    };
    if let Some(changed) = changed {
        if let Some(dependents) = reverse.get(changed) {
            dirty.extend(dependents.iter().cloned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::descriptor::PropertyDescriptor;
    use crate::blueprint::{BlueprintBuilder, ExecutionContext};
    use crate::meta::Meta;
    use crate::naming::{Address, CorrelationId};
    use crate::ports::SystemClock;

    #[tokio::test]
    async fn recomputes_when_a_dependency_changes() {
        let blueprint = BlueprintBuilder::new("test")
            .property(PropertyDescriptor::logical("a", "double").mutable(), None, None)
            .derived_property(
                PropertyDescriptor::derived("doubled", "double"),
                vec![Name::single("a")],
                Arc::new(|values: &[Meta]| Ok(Meta::leaf(values[0].as_f64().unwrap_or(0.0) * 2.0))),
            )
            .build()
            .unwrap();
        let device = Arc::new(Device::new(Address::new("hub", Name::single("dev")), blueprint, Arc::new(SystemClock)));
        let _scheduler = spawn_derived_scheduler(device.clone());

        let ctx = ExecutionContext::new(CorrelationId::new("t"));
        device.write_property(&Name::single("a"), Meta::leaf(21.0), &ctx).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let doubled = device.read_property(&Name::single("doubled"), &ctx).await.unwrap();
        assert_eq!(doubled, Meta::leaf(42.0));
    }
}
