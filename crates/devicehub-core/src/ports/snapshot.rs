//! [`SnapshotStore`]: atomic persistence of a device's declared persistent
//! state.

use dashmap::DashMap;

use crate::meta::Meta;
use crate::naming::Name;
use crate::ports::PortError;

#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub meta: Meta,
    pub blobs: std::collections::BTreeMap<Name, Vec<u8>>,
}

#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, name: &Name, snapshot: Snapshot) -> Result<(), PortError>;

    async fn load(&self, name: &Name) -> Result<Option<Snapshot>, PortError>;

    async fn delete(&self, name: &Name) -> Result<(), PortError>;
}

/// In-memory snapshot store. Each `save` atomically replaces the prior
/// snapshot for `name`, matching the write-temp-then-rename contract of a
/// real filesystem-backed store without needing one.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: DashMap<Name, Snapshot>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, name: &Name, snapshot: Snapshot) -> Result<(), PortError> {
        self.snapshots.insert(name.clone(), snapshot);
        Ok(())
    }

    async fn load(&self, name: &Name) -> Result<Option<Snapshot>, PortError> {
        Ok(self.snapshots.get(name).map(|entry| entry.clone()))
    }

    async fn delete(&self, name: &Name) -> Result<(), PortError> {
        self.snapshots.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = InMemorySnapshotStore::new();
        let name = Name::single("device-1");
        let snapshot = Snapshot {
            meta: Meta::leaf(true),
            blobs: Default::default(),
        };
        store.save(&name, snapshot.clone()).await.unwrap();
        assert_eq!(store.load(&name).await.unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn delete_clears_snapshot() {
        let store = InMemorySnapshotStore::new();
        let name = Name::single("device-1");
        store
            .save(&name, Snapshot { meta: Meta::empty(), blobs: Default::default() })
            .await
            .unwrap();
        store.delete(&name).await.unwrap();
        assert_eq!(store.load(&name).await.unwrap(), None);
    }
}
