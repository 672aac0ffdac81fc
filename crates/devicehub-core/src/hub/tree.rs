//! The hub's device tree: reader-preferring storage keyed by [`Name`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::device::Device;
use crate::naming::Name;

/// Owns the device tree for one hub process. A `tokio::sync::RwLock`
/// models the reader-preferring policy required by §5: concurrent reads
/// (`findDevice`, `devices`) don't block each other, while `attach`/`detach`
/// take the writer lock.
#[derive(Default)]
pub struct DeviceTree {
    devices: RwLock<HashMap<Name, Arc<Device>>>,
}

impl DeviceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, name: Name, device: Arc<Device>) {
        self.devices.write().await.insert(name, device);
    }

    pub async fn remove(&self, name: &Name) -> Option<Arc<Device>> {
        self.devices.write().await.remove(name)
    }

    pub async fn get(&self, name: &Name) -> Option<Arc<Device>> {
        self.devices.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &Name) -> bool {
        self.devices.read().await.contains_key(name)
    }

    pub async fn snapshot(&self) -> HashMap<Name, Arc<Device>> {
        self.devices.read().await.clone()
    }
}
