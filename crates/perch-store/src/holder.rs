//! A named set of collections: the root's databases, a document's children.

use bytes::Bytes;
use perch_index::IndexedMap;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::collection::Collection;
use crate::error::{StoreError, StoreResult};
use crate::path::ResourceKind;

/// Maps collection names to collections.
///
/// The process-wide root holds the databases; every document embeds one for
/// its nested collections. Cloning shares the underlying map.
#[derive(Clone, Default, Debug)]
pub struct CollectionHolder {
    collections: Arc<IndexedMap<String, Arc<Collection>>>,
}

impl CollectionHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty collection under `name`; names are never reused while
    /// taken.
    pub fn put(&self, name: &str) -> StoreResult<()> {
        self.collections
            .upsert(name.to_string(), |_, current| {
                if current.is_some() {
                    return Err(StoreError::CollectionExists);
                }
                Ok(Arc::new(Collection::new()))
            })
            .map(|_| ())?;
        info!(name, "collection created");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.find(&name.to_string())
    }

    /// Remove the collection under `name` and tell its remaining subscribers
    /// it is gone.
    pub async fn delete(&self, name: &str, uri: &str) -> StoreResult<()> {
        let Some(removed) = self.collections.remove(&name.to_string()) else {
            return Err(StoreError::Absent(ResourceKind::Collection));
        };

        info!(name, "collection deleted");
        let event = json!({ "action": "delete", "document": uri });
        if let Ok(payload) = serde_json::to_vec(&event) {
            removed.notify_delete(Bytes::from(payload), "general").await;
        }
        Ok(())
    }
}
