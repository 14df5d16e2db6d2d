//! Collections known to this client, resolvable by name

use dashmap::DashMap;
use proven_kv::Collection;

/// Maps collection names recorded in ATRs and envelopes back to handles
#[derive(Default)]
pub(crate) struct CollectionRegistry {
    collections: DashMap<String, Collection>,
}

impl CollectionRegistry {
    /// Remember `collection`; the first handle registered under a name wins
    pub fn register(&self, collection: &Collection) {
        if !self.collections.contains_key(collection.name()) {
            tracing::debug!("Registering collection {}", collection.name());
            self.collections
                .entry(collection.name().to_string())
                .or_insert_with(|| collection.clone());
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Collection> {
        self.collections.get(name).map(|c| c.clone())
    }

    /// Snapshot of every registered collection, sorted by name
    pub fn all(&self) -> Vec<Collection> {
        let mut collections: Vec<Collection> =
            self.collections.iter().map(|e| e.value().clone()).collect();
        collections.sort_by(|a, b| a.name().cmp(b.name()));
        collections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proven_kv::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn test_first_registration_wins() {
        let registry = CollectionRegistry::default();
        let first = Arc::new(MemoryStore::new());
        let second = Arc::new(MemoryStore::new());

        registry.register(&Collection::new("users", first.clone()));
        registry.register(&Collection::new("users", second));
        registry.register(&Collection::new("orders", first));

        assert_eq!(registry.all().len(), 2);
        assert_eq!(registry.all()[0].name(), "orders");
        assert!(registry.resolve("users").is_some());
        assert!(registry.resolve("missing").is_none());
    }
}
