//! Binding propagation: one task per [`PropertyBinding`], cancelled on child
//! detach.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::blueprint::{ExecutionContext, PropertyBinding};
use crate::device::Device;
use crate::meta::Meta;
use crate::naming::CorrelationId;

/// A running binding propagation task, dropped (and thereby aborted) on
/// child detach.
pub struct BindingTask {
    handle: JoinHandle<()>,
}

impl Drop for BindingTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn the task that realizes one binding between a parent and child
/// device.
pub fn spawn_binding(parent: Arc<Device>, child: Arc<Device>, binding: PropertyBinding, transformers: crate::blueprint::binding::TransformerRegistry) -> BindingTask {
    let handle = tokio::spawn(async move {
        match &binding {
            PropertyBinding::Const { target, value } => {
                let ctx = ExecutionContext::new(CorrelationId::new("binding"));
                let _ = child.write_property(target, value.clone(), &ctx).await;
            }
            PropertyBinding::Source { source, target } => {
                propagate_source(&parent, &child, source, target, None, &transformers).await;
            }
            PropertyBinding::Transformed { source, target, transformer_id, meta } => {
                propagate_source(&parent, &child, source, target, Some((transformer_id.clone(), meta.clone())), &transformers).await;
            }
        }
    });
    BindingTask { handle }
}

async fn propagate_source(
    parent: &Arc<Device>,
    child: &Arc<Device>,
    source: &crate::naming::Name,
    target: &crate::naming::Name,
    transform: Option<(String, Meta)>,
    transformers: &crate::blueprint::binding::TransformerRegistry,
) {
    let ctx = ExecutionContext::new(CorrelationId::new("binding"));
    // Write the current value immediately so a late-joining binding
    // observes the parent's present state, then keep writing on every
    // subsequent change.
    if let Ok(initial) = parent.read_property(source, &ctx).await {
        write_transformed(child, target, initial, &transform, transformers, &ctx).await;
    }
    let mut messages = parent.subscribe_messages();
    while let Ok(message) = messages.recv().await {
        if let crate::hub::events::DeviceMessageBody::PropertyChanged { property, value, .. } = message.body {
            if &property == source {
                write_transformed(child, target, value, &transform, transformers, &ctx).await;
            }
        }
    }
}

async fn write_transformed(
    child: &Arc<Device>,
    target: &crate::naming::Name,
    value: Meta,
    transform: &Option<(String, Meta)>,
    transformers: &crate::blueprint::binding::TransformerRegistry,
    ctx: &ExecutionContext,
) {
    let value = match transform {
        Some((transformer_id, params)) => transformers.apply(transformer_id, &value, params).unwrap_or(value),
        None => value,
    };
    let _ = child.write_property(target, value, ctx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::descriptor::PropertyDescriptor;
    use crate::blueprint::BlueprintBuilder;
    use crate::naming::{Address, Name};
    use crate::ports::SystemClock;

    #[tokio::test]
    async fn source_binding_propagates_initial_value() {
        let parent_bp = BlueprintBuilder::new("parent")
            .property(PropertyDescriptor::logical("target", "double").mutable(), None, None)
            .build()
            .unwrap();
        let child_bp = BlueprintBuilder::new("child")
            .property(PropertyDescriptor::logical("setpoint", "double").mutable(), None, None)
            .build()
            .unwrap();
        let parent = Arc::new(Device::new(Address::new("hub", Name::single("parent")), parent_bp, Arc::new(SystemClock)));
        let child = Arc::new(Device::new(Address::new("hub", Name::single("child")), child_bp, Arc::new(SystemClock)));

        let ctx = ExecutionContext::new(CorrelationId::new("t"));
        parent.write_property(&Name::single("target"), Meta::leaf(42.0), &ctx).await.unwrap();

        let binding = PropertyBinding::Source { source: Name::single("target"), target: Name::single("setpoint") };
        let _task = spawn_binding(parent.clone(), child.clone(), binding, crate::blueprint::binding::TransformerRegistry::with_builtins());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let value = child.read_property(&Name::single("setpoint"), &ctx).await.unwrap();
        assert_eq!(value, Meta::leaf(42.0));
    }
}
