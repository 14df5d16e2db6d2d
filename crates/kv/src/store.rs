//! Store contract and collection handles

use crate::error::{Result, StoreError};
use crate::types::{Cas, Document, DocumentContent, Durability};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Key-value store primitives the coordinator is layered on
///
/// Implementations provide single-document atomicity only; every
/// cross-document guarantee is built by the caller out of CAS checks.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document, including shadow documents and extended attributes
    async fn get(&self, key: &str) -> Result<Document>;

    /// Create a document; fails with `AlreadyExists` if any document (shadow
    /// or not) is present under the key
    async fn insert(
        &self,
        key: &str,
        content: DocumentContent,
        durability: Durability,
    ) -> Result<Cas>;

    /// Overwrite a document whose current CAS is `cas`
    async fn replace(
        &self,
        key: &str,
        content: DocumentContent,
        cas: Cas,
        durability: Durability,
    ) -> Result<Cas>;

    /// Delete a document whose current CAS is `cas`
    async fn remove(&self, key: &str, cas: Cas, durability: Durability) -> Result<()>;
}

/// A named handle to a document store
///
/// Transactions address documents as (collection, key). The name is what
/// gets recorded in transaction metadata so that cleanup running in another
/// process can find the same collection again.
#[derive(Clone)]
pub struct Collection {
    name: Arc<str>,
    store: Arc<dyn DocumentStore>,
}

impl Collection {
    pub fn new(name: impl Into<Arc<str>>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Raw read, including shadow documents and metadata
    pub async fn lookup(&self, key: &str) -> Result<Document> {
        self.store.get(key).await
    }

    /// Transaction-unaware read: shadow documents are reported as missing
    pub async fn get(&self, key: &str) -> Result<Document> {
        let document = self.store.get(key).await?;
        if document.is_shadow() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(document)
    }

    /// Non-transactional insert of a plain document
    pub async fn insert(&self, key: &str, body: impl Into<Vec<u8>>) -> Result<Cas> {
        self.store
            .insert(key, DocumentContent::body(body), Durability::None)
            .await
    }

    /// Non-transactional replace; any transaction metadata on the document is dropped
    pub async fn replace(&self, key: &str, body: impl Into<Vec<u8>>, cas: Cas) -> Result<Cas> {
        self.store
            .replace(key, DocumentContent::body(body), cas, Durability::None)
            .await
    }

    /// Non-transactional remove
    pub async fn remove(&self, key: &str, cas: Cas) -> Result<()> {
        self.store.remove(key, cas, Durability::None).await
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
