//! Active Transaction Records
//!
//! An ATR is an ordinary document holding one entry per attempt that has
//! staged something and not yet been cleaned up. Every write is a CAS-guarded
//! read-modify-write of the whole document, and every change is idempotent:
//! re-applying a transition that already happened is a no-op.

use crate::attempt::AttemptState;
use crate::error::AtrError;
use crate::staging::{AtrLocation, DocId};
use proven_common::{AttemptId, Timestamp, TransactionId};
use proven_kv::{Cas, Collection, DocumentContent, Durability, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key prefix of ATR documents
pub const ATR_KEY_PREFIX: &str = "_txn:atr-";

/// CAS retries before an ATR update is reported as contended
const MAX_UPDATE_ROUNDS: usize = 128;

type Result<T> = std::result::Result<T, AtrError>;

/// Key of the ATR with the given index
pub fn atr_key(index: usize) -> String {
    format!("{}{}", ATR_KEY_PREFIX, index)
}

/// Stable ATR index for an attempt whose first mutation targets `doc_key`
pub fn atr_index_for(doc_key: &str, num_atrs: usize) -> usize {
    let hash = doc_key
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
            (acc ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        });
    (hash % num_atrs.max(1) as u64) as usize
}

/// One attempt's record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtrEntry {
    pub transaction_id: TransactionId,
    pub state: AttemptState,
    pub started: Timestamp,
    pub expires: Timestamp,
    pub updated: Timestamp,
    /// Documents the attempt staged (or was about to stage), in order
    #[serde(default)]
    pub documents: Vec<DocId>,
}

impl AtrEntry {
    pub fn new(transaction_id: TransactionId, started: Timestamp, expires: Timestamp) -> Self {
        Self {
            transaction_id,
            state: AttemptState::InProgress,
            started,
            expires,
            updated: started,
            documents: Vec::new(),
        }
    }

    pub fn has_expired(&self) -> bool {
        self.expires.has_passed()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AtrDocument {
    #[serde(default)]
    attempts: BTreeMap<String, AtrEntry>,
}

impl AtrDocument {
    fn entry_mut(&mut self, attempt_id: AttemptId) -> Option<&mut AtrEntry> {
        self.attempts.get_mut(&attempt_id.to_string())
    }
}

/// Outcome of applying a change function to an ATR document
enum Change<T> {
    Write(T),
    Keep(T),
}

/// Reads and writes ATR documents
#[derive(Debug, Clone)]
pub struct AtrManager {
    durability: Durability,
    num_atrs: usize,
}

impl AtrManager {
    pub fn new(durability: Durability, num_atrs: usize) -> Self {
        Self {
            durability,
            num_atrs: num_atrs.max(1),
        }
    }

    pub fn num_atrs(&self) -> usize {
        self.num_atrs
    }

    /// ATR an attempt uses when its first mutation targets `doc_key` in `collection`
    pub fn location_for(&self, collection: &Collection, doc_key: &str) -> AtrLocation {
        AtrLocation {
            collection: collection.name().to_string(),
            key: atr_key(atr_index_for(doc_key, self.num_atrs)),
        }
    }

    async fn load(&self, collection: &Collection, key: &str) -> Result<Option<(AtrDocument, Cas)>> {
        let document = match collection.lookup(key).await {
            Ok(d) => d,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let body = document.body.unwrap_or_default();
        let atr = if body.is_empty() {
            AtrDocument::default()
        } else {
            serde_json::from_slice(&body).map_err(|e| AtrError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?
        };
        Ok(Some((atr, document.cas)))
    }

    async fn update<T, F>(&self, collection: &Collection, key: &str, mut change: F) -> Result<T>
    where
        F: FnMut(&mut AtrDocument) -> Result<Change<T>>,
    {
        for _ in 0..MAX_UPDATE_ROUNDS {
            let (mut atr, cas) = match self.load(collection, key).await? {
                Some((atr, cas)) => (atr, Some(cas)),
                None => (AtrDocument::default(), None),
            };

            let value = match change(&mut atr)? {
                Change::Keep(value) => return Ok(value),
                Change::Write(value) => value,
            };

            let body = serde_json::to_vec(&atr).map_err(|e| AtrError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
            let content = DocumentContent::body(body);

            let written = match cas {
                Some(cas) => collection
                    .store()
                    .replace(key, content, cas, self.durability)
                    .await
                    .map(|_| ()),
                None => collection
                    .store()
                    .insert(key, content, self.durability)
                    .await
                    .map(|_| ()),
            };

            match written {
                Ok(()) => return Ok(value),
                Err(StoreError::CasMismatch(_))
                | Err(StoreError::AlreadyExists(_))
                | Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Transient(format!("ATR {} is too contended", key)).into())
    }

    /// All entries of one ATR; a missing ATR has none
    pub async fn entries(
        &self,
        collection: &Collection,
        key: &str,
    ) -> Result<Vec<(AttemptId, AtrEntry)>> {
        let Some((atr, _)) = self.load(collection, key).await? else {
            return Ok(Vec::new());
        };

        atr.attempts
            .into_iter()
            .map(|(id, entry)| {
                AttemptId::parse(&id)
                    .map(|id| (id, entry))
                    .map_err(|reason| AtrError::Corrupt {
                        key: key.to_string(),
                        reason,
                    })
            })
            .collect()
    }

    pub async fn entry(
        &self,
        collection: &Collection,
        key: &str,
        attempt_id: AttemptId,
    ) -> Result<Option<AtrEntry>> {
        Ok(self
            .load(collection, key)
            .await?
            .and_then(|(mut atr, _)| atr.attempts.remove(&attempt_id.to_string())))
    }

    /// Record a new attempt, creating the ATR document if needed
    pub async fn begin(
        &self,
        collection: &Collection,
        key: &str,
        attempt_id: AttemptId,
        entry: AtrEntry,
    ) -> Result<()> {
        self.update(collection, key, |atr| {
            let id = attempt_id.to_string();
            if atr.attempts.contains_key(&id) {
                return Ok(Change::Keep(()));
            }
            atr.attempts.insert(id, entry.clone());
            Ok(Change::Write(()))
        })
        .await
    }

    /// Append a document to an in-progress attempt's list
    pub async fn add_document(
        &self,
        collection: &Collection,
        key: &str,
        attempt_id: AttemptId,
        doc: &DocId,
    ) -> Result<()> {
        self.update(collection, key, |atr| {
            let entry = atr
                .entry_mut(attempt_id)
                .ok_or_else(|| AtrError::EntryNotFound {
                    atr: key.to_string(),
                    attempt_id,
                })?;

            if entry.state != AttemptState::InProgress {
                return Err(AtrError::UnexpectedState {
                    attempt_id,
                    actual: entry.state,
                    expected: vec![AttemptState::InProgress],
                });
            }
            if entry.documents.contains(doc) {
                return Ok(Change::Keep(()));
            }
            entry.documents.push(doc.clone());
            entry.updated = Timestamp::now();
            Ok(Change::Write(()))
        })
        .await
    }

    /// Move an entry from one of `from` to `to`, returning the updated entry
    pub async fn transition(
        &self,
        collection: &Collection,
        key: &str,
        attempt_id: AttemptId,
        from: &[AttemptState],
        to: AttemptState,
    ) -> Result<AtrEntry> {
        self.update(collection, key, |atr| {
            let entry = atr
                .entry_mut(attempt_id)
                .ok_or_else(|| AtrError::EntryNotFound {
                    atr: key.to_string(),
                    attempt_id,
                })?;

            if entry.state == to {
                return Ok(Change::Keep(entry.clone()));
            }
            if !from.contains(&entry.state) {
                return Err(AtrError::UnexpectedState {
                    attempt_id,
                    actual: entry.state,
                    expected: from.to_vec(),
                });
            }

            entry.state = to;
            entry.updated = Timestamp::now();
            Ok(Change::Write(entry.clone()))
        })
        .await
    }

    /// Drop an entry; `false` if it was already gone
    pub async fn remove(
        &self,
        collection: &Collection,
        key: &str,
        attempt_id: AttemptId,
    ) -> Result<bool> {
        self.update(collection, key, |atr| {
            match atr.attempts.remove(&attempt_id.to_string()) {
                Some(_) => Ok(Change::Write(true)),
                None => Ok(Change::Keep(false)),
            }
        })
        .await
    }
}
