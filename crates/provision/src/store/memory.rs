//! In-process store, used by tests and single-node deployments.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::traits::{bump_version, Kind, Store, StoreResult};

/// Map-backed [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<Kind, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch_all(&self, kind: Kind) -> StoreResult<Vec<Value>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&kind)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_by_uuid(&self, kind: Kind, uuid: &str) -> StoreResult<Option<Value>> {
        let collections = self.collections.read().await;
        Ok(collections.get(&kind).and_then(|c| c.get(uuid)).cloned())
    }

    async fn persist(&self, kind: Kind, uuid: &str, mut doc: Value) -> StoreResult<Value> {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(kind).or_default();
        bump_version(collection.get(uuid), &mut doc);
        collection.insert(uuid.to_string(), doc.clone());
        Ok(doc)
    }

    async fn delete(&self, kind: Kind, uuid: &str) -> StoreResult<bool> {
        let mut collections = self.collections.write().await;
        Ok(collections
            .get_mut(&kind)
            .is_some_and(|c| c.remove(uuid).is_some()))
    }
}
