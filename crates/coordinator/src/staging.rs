//! Staging model
//!
//! A staged mutation is written into the target document's extended
//! attribute as a [`StagingEnvelope`], leaving the committed body untouched.
//! Staged inserts create a shadow document with no body. Readers that do not
//! understand envelopes therefore keep seeing the last committed value.
//!
//! Unstaging and reverting only ever touch a document that still carries an
//! envelope of the attempt being resolved, and always write against the CAS
//! just read, so the coordinator and any number of cleanup processes can
//! race on the same document safely.

use proven_common::{AttemptId, TransactionId};
use proven_kv::{Cas, Collection, Document, DocumentContent, Durability, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Re-reads allowed when a document changes under an unstage or revert
const MAX_RESOLVE_ROUNDS: usize = 16;

/// A document address that survives process boundaries
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId {
    pub collection: String,
    pub key: String,
}

impl DocId {
    pub fn new(collection: &Collection, key: &str) -> Self {
        Self {
            collection: collection.name().to_string(),
            key: key.to_string(),
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Insert,
    Replace,
    Remove,
}

/// Where an attempt's ATR entry lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtrLocation {
    pub collection: String,
    pub key: String,
}

impl fmt::Display for AtrLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

/// Transaction metadata carried by a document while a mutation is staged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingEnvelope {
    pub transaction_id: TransactionId,
    pub attempt_id: AttemptId,
    pub atr: AtrLocation,
    pub kind: MutationKind,
    /// New value for inserts and replaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<Vec<u8>>,
}

impl StagingEnvelope {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Envelope carried by `document`, if any
    pub fn read(document: &Document) -> serde_json::Result<Option<Self>> {
        document
            .xattr
            .as_deref()
            .map(serde_json::from_slice)
            .transpose()
    }

    pub fn belongs_to(&self, attempt_id: AttemptId) -> bool {
        self.attempt_id == attempt_id
    }

    /// Store content that holds this staged mutation on top of `committed_body`
    pub fn staged_content(&self, committed_body: Option<Vec<u8>>) -> serde_json::Result<DocumentContent> {
        let content = match self.kind {
            MutationKind::Insert => DocumentContent::shadow(self.encode()?),
            MutationKind::Replace | MutationKind::Remove => DocumentContent {
                body: committed_body,
                xattr: Some(self.encode()?),
            },
        };
        Ok(content)
    }
}

/// A mutation held in an attempt's buffer
#[derive(Debug, Clone)]
pub struct StagedMutation {
    pub kind: MutationKind,
    pub collection: Collection,
    pub key: String,
    /// Staged value, `None` for removes
    pub content: Option<Vec<u8>>,
    /// CAS of the document as written by the staging write
    pub cas: Cas,
    /// Committed body preserved underneath the envelope
    pub committed_body: Option<Vec<u8>>,
}

impl StagedMutation {
    pub fn doc_id(&self) -> DocId {
        DocId::new(&self.collection, &self.key)
    }
}

/// What happened when resolving a staged document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This call wrote the final (or reverted) state
    Applied,
    /// The document no longer carries this attempt's envelope
    AlreadyResolved,
}

/// Envelope carried by `document`; unreadable metadata is logged and ignored
pub(crate) fn envelope_of(document: &Document) -> Option<StagingEnvelope> {
    match StagingEnvelope::read(document) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Ignoring unreadable staging metadata on {}: {}", document.key, e);
            None
        }
    }
}

/// Make `attempt_id`'s staged mutation on `key` the committed state
pub async fn unstage(
    collection: &Collection,
    key: &str,
    attempt_id: AttemptId,
    durability: Durability,
) -> Result<Resolution, StoreError> {
    for _ in 0..MAX_RESOLVE_ROUNDS {
        let document = match collection.lookup(key).await {
            Ok(d) => d,
            Err(StoreError::NotFound(_)) => return Ok(Resolution::AlreadyResolved),
            Err(e) => return Err(e),
        };

        let Some(envelope) = envelope_of(&document) else {
            return Ok(Resolution::AlreadyResolved);
        };
        if !envelope.belongs_to(attempt_id) {
            return Ok(Resolution::AlreadyResolved);
        }

        let result = match envelope.kind {
            MutationKind::Insert | MutationKind::Replace => {
                let body = envelope.staged.unwrap_or_default();
                collection
                    .store()
                    .replace(key, DocumentContent::body(body), document.cas, durability)
                    .await
                    .map(|_| ())
            }
            MutationKind::Remove => {
                collection
                    .store()
                    .remove(key, document.cas, durability)
                    .await
            }
        };

        match result {
            Ok(()) => return Ok(Resolution::Applied),
            Err(StoreError::CasMismatch(_)) | Err(StoreError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::Transient(format!(
        "document {} kept changing while unstaging",
        key
    )))
}

/// Undo `attempt_id`'s staged mutation on `key`
pub async fn revert(
    collection: &Collection,
    key: &str,
    attempt_id: AttemptId,
    durability: Durability,
) -> Result<Resolution, StoreError> {
    for _ in 0..MAX_RESOLVE_ROUNDS {
        let document = match collection.lookup(key).await {
            Ok(d) => d,
            Err(StoreError::NotFound(_)) => return Ok(Resolution::AlreadyResolved),
            Err(e) => return Err(e),
        };

        let Some(envelope) = envelope_of(&document) else {
            return Ok(Resolution::AlreadyResolved);
        };
        if !envelope.belongs_to(attempt_id) {
            return Ok(Resolution::AlreadyResolved);
        }

        let result = if document.is_shadow() {
            collection
                .store()
                .remove(key, document.cas, durability)
                .await
        } else {
            let content = DocumentContent {
                body: document.body.clone(),
                xattr: None,
            };
            collection
                .store()
                .replace(key, content, document.cas, durability)
                .await
                .map(|_| ())
        };

        match result {
            Ok(()) => return Ok(Resolution::Applied),
            Err(StoreError::CasMismatch(_)) | Err(StoreError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::Transient(format!(
        "document {} kept changing while reverting",
        key
    )))
}
