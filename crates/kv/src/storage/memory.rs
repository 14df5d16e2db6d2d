//! In-memory document store
//!
//! Single-document operations are atomic with respect to each other: each
//! one holds the shard lock for its key for the duration of the CAS check
//! and write.

use super::fault::{Fault, FaultInjector, StoreOp, Triggered};
use crate::error::{Result, StoreError};
use crate::store::DocumentStore;
use crate::types::{Cas, Document, DocumentContent, Durability};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
struct StoredDocument {
    body: Option<Vec<u8>>,
    xattr: Option<Vec<u8>>,
    cas: Cas,
}

impl StoredDocument {
    fn to_document(&self, key: &str) -> Document {
        Document {
            key: key.to_string(),
            body: self.body.clone(),
            xattr: self.xattr.clone(),
            cas: self.cas,
        }
    }
}

/// Document store held in process memory
pub struct MemoryStore {
    documents: DashMap<String, StoredDocument>,

    /// Monotonic CAS source shared by every key
    next_cas: AtomicU64,

    /// Simulated replica count, used to decide which durability levels are achievable
    replicas: usize,

    /// Whether the simulated nodes have disks to persist to
    persistent: bool,

    /// Durability requested by the most recent mutation of each key
    durability_log: DashMap<String, Durability>,

    faults: FaultInjector,
}

impl MemoryStore {
    /// Create an empty store with one simulated replica
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            next_cas: AtomicU64::new(1),
            replicas: 1,
            persistent: true,
            durability_log: DashMap::new(),
            faults: FaultInjector::default(),
        }
    }

    /// Set the simulated replica count
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Simulate nodes without persistent storage
    pub fn without_persistence(mut self) -> Self {
        self.persistent = false;
        self
    }

    /// Script a failure for upcoming operations
    pub fn inject(&self, fault: Fault) {
        self.faults.push(fault);
    }

    /// Drop every scripted failure that has not fired yet
    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    /// All keys currently stored, shadow documents included, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.documents.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Durability requested by the last mutation of `key`
    pub fn last_durability(&self, key: &str) -> Option<Durability> {
        self.durability_log.get(key).map(|d| *d)
    }

    fn allocate_cas(&self) -> Cas {
        Cas::new(self.next_cas.fetch_add(1, Ordering::SeqCst))
    }

    fn check_durability(&self, level: Durability) -> Result<()> {
        if level.min_replicas() > self.replicas {
            return Err(StoreError::DurabilityImpossible {
                level,
                reason: format!("{} replica(s) configured", self.replicas),
            });
        }
        if level.requires_persistence() && !self.persistent {
            return Err(StoreError::DurabilityImpossible {
                level,
                reason: "no persistent storage configured".to_string(),
            });
        }
        Ok(())
    }

    /// Consult the injector; an error is returned now unless the fault
    /// applies the mutation first
    fn pre_check(&self, op: StoreOp, key: &str) -> Result<Option<Triggered>> {
        match self.faults.check(op, key) {
            Some(t) if !t.apply_first => {
                tracing::debug!("Injected {:?} failure on {}: {}", op, key, t.error);
                Err(t.error)
            }
            other => Ok(other),
        }
    }

    fn finish<T>(&self, value: T, deferred: Option<Triggered>) -> Result<T> {
        match deferred {
            Some(t) => Err(t.error),
            None => Ok(value),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Document> {
        self.pre_check(StoreOp::Get, key)?;

        self.documents
            .get(key)
            .map(|doc| doc.to_document(key))
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn insert(
        &self,
        key: &str,
        content: DocumentContent,
        durability: Durability,
    ) -> Result<Cas> {
        self.check_durability(durability)?;
        let deferred = self.pre_check(StoreOp::Insert, key)?;

        let cas = match self.documents.entry(key.to_string()) {
            Entry::Occupied(_) => return Err(StoreError::AlreadyExists(key.to_string())),
            Entry::Vacant(slot) => {
                let cas = self.allocate_cas();
                slot.insert(StoredDocument {
                    body: content.body,
                    xattr: content.xattr,
                    cas,
                });
                cas
            }
        };

        self.durability_log.insert(key.to_string(), durability);
        self.finish(cas, deferred)
    }

    async fn replace(
        &self,
        key: &str,
        content: DocumentContent,
        cas: Cas,
        durability: Durability,
    ) -> Result<Cas> {
        self.check_durability(durability)?;
        let deferred = self.pre_check(StoreOp::Replace, key)?;

        let new_cas = match self.documents.entry(key.to_string()) {
            Entry::Vacant(_) => return Err(StoreError::NotFound(key.to_string())),
            Entry::Occupied(mut slot) => {
                if slot.get().cas != cas {
                    return Err(StoreError::CasMismatch(key.to_string()));
                }
                let new_cas = self.allocate_cas();
                slot.insert(StoredDocument {
                    body: content.body,
                    xattr: content.xattr,
                    cas: new_cas,
                });
                new_cas
            }
        };

        self.durability_log.insert(key.to_string(), durability);
        self.finish(new_cas, deferred)
    }

    async fn remove(&self, key: &str, cas: Cas, durability: Durability) -> Result<()> {
        self.check_durability(durability)?;
        let deferred = self.pre_check(StoreOp::Remove, key)?;

        match self.documents.entry(key.to_string()) {
            Entry::Vacant(_) => return Err(StoreError::NotFound(key.to_string())),
            Entry::Occupied(slot) => {
                if slot.get().cas != cas {
                    return Err(StoreError::CasMismatch(key.to_string()));
                }
                slot.remove();
            }
        }

        self.durability_log.insert(key.to_string(), durability);
        self.finish((), deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_get_replace_remove() {
        let store = MemoryStore::new();

        let cas = store
            .insert("a", DocumentContent::body("one"), Durability::None)
            .await
            .unwrap();
        let doc = store.get("a").await.unwrap();
        assert_eq!(doc.body.as_deref(), Some(&b"one"[..]));
        assert_eq!(doc.cas, cas);

        let cas2 = store
            .replace("a", DocumentContent::body("two"), cas, Durability::None)
            .await
            .unwrap();
        assert_ne!(cas, cas2);

        store.remove("a", cas2, Durability::None).await.unwrap();
        assert_eq!(
            store.get("a").await.unwrap_err(),
            StoreError::NotFound("a".into())
        );
    }

    #[tokio::test]
    async fn test_insert_existing_fails() {
        let store = MemoryStore::new();
        store
            .insert("a", DocumentContent::shadow("meta"), Durability::None)
            .await
            .unwrap();

        let err = store
            .insert("a", DocumentContent::body("x"), Durability::None)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists("a".into()));
    }

    #[tokio::test]
    async fn test_stale_cas_rejected() {
        let store = MemoryStore::new();
        let cas = store
            .insert("a", DocumentContent::body("one"), Durability::None)
            .await
            .unwrap();
        store
            .replace("a", DocumentContent::body("two"), cas, Durability::None)
            .await
            .unwrap();

        let err = store
            .replace("a", DocumentContent::body("three"), cas, Durability::None)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::CasMismatch("a".into()));

        let err = store.remove("a", cas, Durability::None).await.unwrap_err();
        assert_eq!(err, StoreError::CasMismatch("a".into()));
    }

    #[tokio::test]
    async fn test_durability_needs_replicas() {
        let store = MemoryStore::new().with_replicas(0);

        let err = store
            .insert("a", DocumentContent::body("x"), Durability::Majority)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DurabilityImpossible { .. }));

        store
            .insert("a", DocumentContent::body("x"), Durability::None)
            .await
            .unwrap();
        assert_eq!(store.last_durability("a"), Some(Durability::None));
    }

    #[tokio::test]
    async fn test_persistence_levels_need_disks() {
        let store = MemoryStore::new().without_persistence();

        store
            .insert("a", DocumentContent::body("x"), Durability::Majority)
            .await
            .unwrap();
        for level in [
            Durability::MajorityAndPersistOnMaster,
            Durability::PersistToMajority,
        ] {
            let err = store
                .insert("b", DocumentContent::body("x"), level)
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::DurabilityImpossible { .. }));
        }
        assert!(store.get("b").await.is_err());
    }

    #[tokio::test]
    async fn test_ambiguous_fault_applies_write() {
        let store = MemoryStore::new();
        store.inject(
            Fault::new(StoreError::Transient("timeout".into()))
                .on(StoreOp::Insert)
                .after_applying(),
        );

        let err = store
            .insert("a", DocumentContent::body("x"), Durability::None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store.get("a").await.is_ok());
    }
}
