//! [`BlueprintRegistry`]: resolves a blueprint id to its definition.

use dashmap::DashMap;

use crate::blueprint::{Blueprint, BlueprintId};

#[async_trait::async_trait]
pub trait BlueprintRegistry: Send + Sync {
    async fn find_by_id(&self, id: &BlueprintId) -> Option<Blueprint>;
}

/// A registry preloaded with a fixed set of blueprints, suitable for tests
/// and statically-configured deployments.
#[derive(Default)]
pub struct StaticBlueprintRegistry {
    blueprints: DashMap<BlueprintId, Blueprint>,
}

impl StaticBlueprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blueprint(self, blueprint: Blueprint) -> Self {
        self.blueprints.insert(blueprint.id.clone(), blueprint);
        self
    }

    pub fn register(&self, blueprint: Blueprint) {
        self.blueprints.insert(blueprint.id.clone(), blueprint);
    }
}

#[async_trait::async_trait]
impl BlueprintRegistry for StaticBlueprintRegistry {
    async fn find_by_id(&self, id: &BlueprintId) -> Option<Blueprint> {
        self.blueprints.get(id).map(|entry| entry.clone())
    }
}
