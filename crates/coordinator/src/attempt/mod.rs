//! Attempt context
//!
//! One [`AttemptContext`] exists per execution of a transaction's logic. It
//! buffers the attempt's staged mutations for read-your-writes, writes each
//! mutation to the store as a staged version as soon as it is issued, and
//! records every touched document in the attempt's ATR entry before the
//! staged write so that a crash at any point leaves enough behind for cleanup.
//!
//! Operations on one context are serialized; contexts of different attempts
//! never share state and only meet through the store's CAS checks.

mod commit;
mod document;
mod foreign;
mod state;

pub use document::TransactionGetResult;
pub use state::AttemptState;

use crate::atr::{AtrEntry, AtrManager};
use crate::backoff::retry_transient;
use crate::config::TransactionConfig;
use crate::error::{AtrError, OperationError, Result};
use crate::registry::CollectionRegistry;
use crate::staging::{self, AtrLocation, DocId, MutationKind, StagedMutation, StagingEnvelope};
use foreign::ForeignStatus;
use parking_lot::Mutex;
use proven_common::{AttemptId, Timestamp, TransactionId};
use proven_kv::{Cas, Collection, Document, DocumentContent, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Mutable attempt state, never held across an await
struct AttemptData {
    state: AttemptState,

    /// ATR holding this attempt's entry, set by the first mutation
    atr: Option<(Collection, AtrLocation)>,

    /// Staged mutations in staging order, at most one per document
    mutations: Vec<StagedMutation>,

    /// Every document registered in the ATR entry, whether or not its
    /// staged write is known to have landed
    touched: Vec<(Collection, String)>,

    /// Documents read but not mutated, with the CAS observed
    reads: HashMap<DocId, (Collection, Cas)>,

    /// First failure that rules out committing this attempt
    doomed: Option<Doomed>,

    unstaging_complete: bool,
    rolled_back_by_app: bool,
}

/// Failure that forces a fresh attempt even if logic swallows the error
#[derive(Debug, Clone)]
enum Doomed {
    Conflict { collection: String, key: String },
    Transient(String),
    Expired,
}

impl Doomed {
    fn of(error: &OperationError) -> Option<Self> {
        match error {
            OperationError::WriteWriteConflict { collection, key } => Some(Doomed::Conflict {
                collection: collection.clone(),
                key: key.clone(),
            }),
            OperationError::Expired => Some(Doomed::Expired),
            e if e.is_retryable() => Some(Doomed::Transient(e.to_string())),
            _ => None,
        }
    }

    fn error(&self) -> OperationError {
        match self {
            Doomed::Conflict { collection, key } => OperationError::conflict(collection, key),
            Doomed::Transient(reason) => {
                OperationError::Store(StoreError::Transient(reason.clone()))
            }
            Doomed::Expired => OperationError::Expired,
        }
    }
}

struct AttemptInner {
    transaction_id: TransactionId,
    attempt_id: AttemptId,
    deadline: Timestamp,
    config: Arc<TransactionConfig>,
    atr: AtrManager,
    registry: Arc<CollectionRegistry>,
    data: Mutex<AttemptData>,
    op_lock: AsyncMutex<()>,
}

/// Handle passed to transaction logic for one attempt
#[derive(Clone)]
pub struct AttemptContext {
    inner: Arc<AttemptInner>,
}

impl AttemptContext {
    pub(crate) fn new(
        transaction_id: TransactionId,
        deadline: Timestamp,
        config: Arc<TransactionConfig>,
        atr: AtrManager,
        registry: Arc<CollectionRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(AttemptInner {
                transaction_id,
                attempt_id: AttemptId::new(),
                deadline,
                config,
                atr,
                registry,
                data: Mutex::new(AttemptData {
                    state: AttemptState::NotStarted,
                    atr: None,
                    mutations: Vec::new(),
                    touched: Vec::new(),
                    reads: HashMap::new(),
                    doomed: None,
                    unstaging_complete: false,
                    rolled_back_by_app: false,
                }),
                op_lock: AsyncMutex::new(()),
            }),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.inner.transaction_id
    }

    pub fn attempt_id(&self) -> AttemptId {
        self.inner.attempt_id
    }

    pub fn state(&self) -> AttemptState {
        self.inner.data.lock().state
    }

    /// When the transaction this attempt belongs to expires
    pub fn deadline(&self) -> Timestamp {
        self.inner.deadline
    }

    /// ATR holding this attempt's entry, once something has been staged
    pub fn atr_location(&self) -> Option<AtrLocation> {
        self.inner.data.lock().atr.as_ref().map(|(_, l)| l.clone())
    }

    /// Read a document, failing with `DocumentNotFound` if it does not exist
    pub async fn get(&self, collection: &Collection, key: &str) -> Result<TransactionGetResult> {
        self.get_optional(collection, key)
            .await?
            .ok_or_else(|| OperationError::not_found(collection.name(), key))
    }

    /// Read a document
    ///
    /// This attempt's own staged mutations are visible. Mutations staged by
    /// other attempts are visible only once those attempts have passed
    /// their commit point.
    pub async fn get_optional(
        &self,
        collection: &Collection,
        key: &str,
    ) -> Result<Option<TransactionGetResult>> {
        let _guard = self.inner.op_lock.lock().await;
        let result = self.read(collection, key).await;
        self.track(result)
    }

    async fn read(
        &self,
        collection: &Collection,
        key: &str,
    ) -> Result<Option<TransactionGetResult>> {
        self.check_active()?;
        self.inner.registry.register(collection);

        let id = DocId::new(collection, key);
        if let Some(own) = self.find_mutation(&id) {
            return Ok(match own.kind {
                MutationKind::Remove => None,
                MutationKind::Insert | MutationKind::Replace => Some(self.own_result(
                    collection,
                    key,
                    own.content.unwrap_or_default(),
                    own.cas,
                    own.committed_body,
                )),
            });
        }

        let Some(document) = self.lookup(collection, key).await? else {
            return Ok(None);
        };
        let foreign = self.foreign_envelope(&document);

        let content = match &foreign {
            Some(envelope) => {
                let status = match foreign::check(
                    &self.inner.atr,
                    &self.inner.registry,
                    collection,
                    envelope,
                    false,
                )
                .await
                {
                    Ok(status) => status,
                    // Owner's outcome unknowable here; the committed value stands
                    Err(AtrError::UnknownCollection(_)) => ForeignStatus::Pending,
                    Err(e) => return Err(e.into()),
                };
                match (status, envelope.kind) {
                    (ForeignStatus::Committed, MutationKind::Remove) => None,
                    (ForeignStatus::Committed, _) => envelope.staged.clone(),
                    _ => document.body.clone(),
                }
            }
            None => document.body.clone(),
        };

        self.inner
            .data
            .lock()
            .reads
            .insert(id, (collection.clone(), document.cas));

        Ok(content.map(|content| TransactionGetResult {
            collection: collection.clone(),
            key: key.to_string(),
            content,
            cas: document.cas,
            committed_body: document.body,
            foreign,
        }))
    }

    /// Stage the creation of a document from a JSON-serializable value
    pub async fn insert<T: Serialize + ?Sized>(
        &self,
        collection: &Collection,
        key: &str,
        value: &T,
    ) -> Result<TransactionGetResult> {
        let content = serde_json::to_vec(value)?;
        self.insert_raw(collection, key, content).await
    }

    /// Stage the creation of a document
    ///
    /// Fails with `DocumentExists` if a committed document is present.
    pub async fn insert_raw(
        &self,
        collection: &Collection,
        key: &str,
        content: impl Into<Vec<u8>>,
    ) -> Result<TransactionGetResult> {
        let content = content.into();
        let _guard = self.inner.op_lock.lock().await;
        let result = self.stage_insert(collection, key, content).await;
        self.track(result)
    }

    async fn stage_insert(
        &self,
        collection: &Collection,
        key: &str,
        content: Vec<u8>,
    ) -> Result<TransactionGetResult> {
        self.check_active()?;
        self.inner.registry.register(collection);

        let id = DocId::new(collection, key);
        if let Some(own) = self.find_mutation(&id) {
            if own.kind != MutationKind::Remove {
                return Err(OperationError::exists(collection.name(), key));
            }
            // Removed earlier in this attempt: bring it back as a replace
            let cas = self
                .restage(&own, MutationKind::Replace, Some(content.clone()))
                .await?;
            return Ok(self.own_result(collection, key, content, cas, own.committed_body));
        }

        let location = self.prepare_write(collection, key, &id).await?;
        let envelope = self.envelope(location, MutationKind::Insert, Some(content.clone()));
        let staged = DocumentContent::shadow(envelope.encode()?);

        let written = collection
            .store()
            .insert(key, staged, self.inner.config.durability_level)
            .await;
        let cas = match written {
            Ok(cas) => cas,
            Err(StoreError::AlreadyExists(_)) => {
                self.insert_over_existing(collection, key, &envelope).await?
            }
            Err(e) => return Err(e.into()),
        };

        self.record_mutation(StagedMutation {
            kind: MutationKind::Insert,
            collection: collection.clone(),
            key: key.to_string(),
            content: Some(content.clone()),
            cas,
            committed_body: None,
        });
        tracing::debug!("Attempt {} staged insert of {}", self.attempt_id(), id);

        Ok(self.own_result(collection, key, content, cas, None))
    }

    /// Stage a new JSON-serializable value for a document read in this attempt
    pub async fn replace<T: Serialize + ?Sized>(
        &self,
        doc: &TransactionGetResult,
        value: &T,
    ) -> Result<TransactionGetResult> {
        let content = serde_json::to_vec(value)?;
        self.replace_raw(doc, content).await
    }

    /// Stage a new value for a document read in this attempt
    ///
    /// If this attempt already staged a mutation on the document, that
    /// mutation is updated in place whatever the handle's CAS.
    pub async fn replace_raw(
        &self,
        doc: &TransactionGetResult,
        content: impl Into<Vec<u8>>,
    ) -> Result<TransactionGetResult> {
        let content = content.into();
        let _guard = self.inner.op_lock.lock().await;
        let result = self.stage_replace(doc, content).await;
        self.track(result)
    }

    async fn stage_replace(
        &self,
        doc: &TransactionGetResult,
        content: Vec<u8>,
    ) -> Result<TransactionGetResult> {
        self.check_active()?;
        let collection = &doc.collection;
        self.inner.registry.register(collection);

        let id = doc.doc_id();
        if let Some(own) = self.find_mutation(&id) {
            if own.kind == MutationKind::Remove {
                return Err(OperationError::not_found(collection.name(), &doc.key));
            }
            let cas = self.restage(&own, own.kind, Some(content.clone())).await?;
            return Ok(self.own_result(collection, &doc.key, content, cas, own.committed_body));
        }

        self.check_foreign_for_write(doc).await?;
        let location = self.prepare_write(collection, &doc.key, &id).await?;
        let envelope = self.envelope(location, MutationKind::Replace, Some(content.clone()));
        let staged = envelope.staged_content(doc.committed_body.clone())?;

        let cas = collection
            .store()
            .replace(&doc.key, staged, doc.cas, self.inner.config.durability_level)
            .await
            .map_err(|e| staging_error(collection, &doc.key, e))?;

        self.record_mutation(StagedMutation {
            kind: MutationKind::Replace,
            collection: collection.clone(),
            key: doc.key.clone(),
            content: Some(content.clone()),
            cas,
            committed_body: doc.committed_body.clone(),
        });
        tracing::debug!("Attempt {} staged replace of {}", self.attempt_id(), id);

        Ok(self.own_result(collection, &doc.key, content, cas, doc.committed_body.clone()))
    }

    /// Stage the removal of a document read in this attempt
    pub async fn remove(&self, doc: &TransactionGetResult) -> Result<()> {
        let _guard = self.inner.op_lock.lock().await;
        let result = self.stage_remove(doc).await;
        self.track(result)
    }

    async fn stage_remove(&self, doc: &TransactionGetResult) -> Result<()> {
        self.check_active()?;
        let collection = &doc.collection;
        self.inner.registry.register(collection);

        let id = doc.doc_id();
        if let Some(own) = self.find_mutation(&id) {
            match own.kind {
                MutationKind::Remove => {
                    return Err(OperationError::not_found(collection.name(), &doc.key));
                }
                MutationKind::Insert => {
                    // Never visible to anyone else, so the shadow can simply go
                    match collection
                        .store()
                        .remove(&doc.key, own.cas, self.inner.config.durability_level)
                        .await
                    {
                        Ok(()) | Err(StoreError::NotFound(_)) => {}
                        Err(e) => return Err(staging_error(collection, &doc.key, e)),
                    }
                    self.inner.data.lock().mutations.retain(|m| m.doc_id() != id);
                    return Ok(());
                }
                MutationKind::Replace => {
                    self.restage(&own, MutationKind::Remove, None).await?;
                    return Ok(());
                }
            }
        }

        self.check_foreign_for_write(doc).await?;
        let location = self.prepare_write(collection, &doc.key, &id).await?;
        let envelope = self.envelope(location, MutationKind::Remove, None);
        let staged = envelope.staged_content(doc.committed_body.clone())?;

        let cas = collection
            .store()
            .replace(&doc.key, staged, doc.cas, self.inner.config.durability_level)
            .await
            .map_err(|e| staging_error(collection, &doc.key, e))?;

        self.record_mutation(StagedMutation {
            kind: MutationKind::Remove,
            collection: collection.clone(),
            key: doc.key.clone(),
            content: None,
            cas,
            committed_body: doc.committed_body.clone(),
        });
        tracing::debug!("Attempt {} staged remove of {}", self.attempt_id(), id);
        Ok(())
    }

    /// Commit now instead of when the logic returns
    pub async fn commit(&self) -> Result<()> {
        let _guard = self.inner.op_lock.lock().await;
        self.commit_attempt().await
    }

    /// Abandon the attempt, reverting everything it staged
    ///
    /// The transaction is not retried and `run` reports it as rolled back.
    pub async fn rollback(&self) -> Result<()> {
        let _guard = self.inner.op_lock.lock().await;
        let state = self.state();
        if !state.is_active() {
            return Err(OperationError::NotActive(state));
        }
        self.inner.data.lock().rolled_back_by_app = true;
        self.rollback_attempt().await
    }

    pub(crate) fn unstaging_complete(&self) -> bool {
        self.inner.data.lock().unstaging_complete
    }

    pub(crate) fn rolled_back_by_app(&self) -> bool {
        self.inner.data.lock().rolled_back_by_app
    }

    /// Conflict, transient or expiry failure already seen by this attempt
    fn doomed(&self) -> Option<OperationError> {
        self.inner.data.lock().doomed.as_ref().map(Doomed::error)
    }

    /// Remember a failure that rules out committing, then pass it on
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && let Some(doomed) = Doomed::of(e)
        {
            let mut data = self.inner.data.lock();
            if data.doomed.is_none() {
                tracing::debug!("Attempt {} can no longer commit: {}", self.inner.attempt_id, e);
                data.doomed = Some(doomed);
            }
        }
        result
    }

    fn check_active(&self) -> Result<()> {
        let state = self.state();
        if !state.is_active() {
            return Err(OperationError::NotActive(state));
        }
        if let Some(e) = self.doomed() {
            return Err(e);
        }
        if self.inner.deadline.has_passed() {
            return Err(OperationError::Expired);
        }
        Ok(())
    }

    fn set_state(&self, state: AttemptState) {
        self.inner.data.lock().state = state;
    }

    fn atr(&self) -> Option<(Collection, AtrLocation)> {
        self.inner.data.lock().atr.clone()
    }

    fn find_mutation(&self, id: &DocId) -> Option<StagedMutation> {
        self.inner
            .data
            .lock()
            .mutations
            .iter()
            .find(|m| m.collection.name() == id.collection && m.key == id.key)
            .cloned()
    }

    fn record_mutation(&self, mutation: StagedMutation) {
        let mut data = self.inner.data.lock();
        data.reads.remove(&mutation.doc_id());
        data.mutations.push(mutation);
    }

    fn envelope(
        &self,
        atr: AtrLocation,
        kind: MutationKind,
        staged: Option<Vec<u8>>,
    ) -> StagingEnvelope {
        StagingEnvelope {
            transaction_id: self.inner.transaction_id,
            attempt_id: self.inner.attempt_id,
            atr,
            kind,
            staged,
        }
    }

    fn own_result(
        &self,
        collection: &Collection,
        key: &str,
        content: Vec<u8>,
        cas: Cas,
        committed_body: Option<Vec<u8>>,
    ) -> TransactionGetResult {
        TransactionGetResult {
            collection: collection.clone(),
            key: key.to_string(),
            content,
            cas,
            committed_body,
            foreign: None,
        }
    }

    /// Envelope left on `document` by some other attempt
    fn foreign_envelope(&self, document: &Document) -> Option<StagingEnvelope> {
        staging::envelope_of(document).filter(|e| !e.belongs_to(self.inner.attempt_id))
    }

    async fn lookup(&self, collection: &Collection, key: &str) -> Result<Option<Document>> {
        match retry_transient(self.inner.deadline, move || collection.lookup(key)).await {
            Ok(document) => Ok(Some(document)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Make sure the ATR entry exists and lists `id` before `id` is staged
    async fn prepare_write(
        &self,
        collection: &Collection,
        key: &str,
        id: &DocId,
    ) -> Result<AtrLocation> {
        let atr = &self.inner.atr;
        let attempt_id = self.inner.attempt_id;
        let deadline = self.inner.deadline;

        let (atr_collection, location) = match self.atr() {
            Some(existing) => existing,
            None => {
                let location = atr.location_for(collection, key);
                let entry = AtrEntry::new(self.inner.transaction_id, Timestamp::now(), deadline);
                retry_transient(deadline, || {
                    atr.begin(collection, &location.key, attempt_id, entry.clone())
                })
                .await
                .map_err(atr_failure)?;

                let mut data = self.inner.data.lock();
                data.state = AttemptState::InProgress;
                data.atr = Some((collection.clone(), location.clone()));
                tracing::debug!("Attempt {} recorded in ATR {}", attempt_id, location);
                (collection.clone(), location)
            }
        };

        retry_transient(deadline, || {
            atr.add_document(&atr_collection, &location.key, attempt_id, id)
        })
        .await
        .map_err(atr_failure)?;

        self.inner
            .data
            .lock()
            .touched
            .push((collection.clone(), key.to_string()));
        Ok(location)
    }

    /// Write a new staged version over this attempt's own staged document
    async fn restage(
        &self,
        own: &StagedMutation,
        kind: MutationKind,
        content: Option<Vec<u8>>,
    ) -> Result<Cas> {
        let Some((_, location)) = self.atr() else {
            return Err(OperationError::NotActive(self.state()));
        };

        let envelope = self.envelope(location, kind, content.clone());
        let staged = envelope.staged_content(own.committed_body.clone())?;
        let cas = own
            .collection
            .store()
            .replace(&own.key, staged, own.cas, self.inner.config.durability_level)
            .await
            .map_err(|e| staging_error(&own.collection, &own.key, e))?;

        let id = own.doc_id();
        let mut data = self.inner.data.lock();
        if let Some(m) = data.mutations.iter_mut().find(|m| m.doc_id() == id) {
            m.kind = kind;
            m.content = content;
            m.cas = cas;
        }
        Ok(cas)
    }

    /// Insert hit an existing document: it may be a leftover shadow
    async fn insert_over_existing(
        &self,
        collection: &Collection,
        key: &str,
        envelope: &StagingEnvelope,
    ) -> Result<Cas> {
        let Some(document) = self.lookup(collection, key).await? else {
            return Err(OperationError::conflict(collection.name(), key));
        };
        let Some(foreign) = self.foreign_envelope(&document) else {
            return Err(OperationError::exists(collection.name(), key));
        };
        if !document.is_shadow() && foreign.kind != MutationKind::Remove {
            return Err(OperationError::exists(collection.name(), key));
        }

        match self.foreign_status(collection, &foreign).await? {
            ForeignStatus::Pending => Err(OperationError::conflict(collection.name(), key)),
            ForeignStatus::Committed => {
                self.help_unstage(collection, key, &foreign).await;
                Err(OperationError::conflict(collection.name(), key))
            }
            ForeignStatus::Abandoned if document.is_shadow() => {
                let staged = envelope.staged_content(None)?;
                let cas = collection
                    .store()
                    .replace(key, staged, document.cas, self.inner.config.durability_level)
                    .await
                    .map_err(|e| staging_error(collection, key, e))?;
                Ok(cas)
            }
            ForeignStatus::Abandoned => Err(OperationError::exists(collection.name(), key)),
        }
    }

    async fn check_foreign_for_write(&self, doc: &TransactionGetResult) -> Result<()> {
        let Some(foreign) = &doc.foreign else {
            return Ok(());
        };
        match self.foreign_status(&doc.collection, foreign).await? {
            ForeignStatus::Abandoned => Ok(()),
            ForeignStatus::Pending => Err(OperationError::conflict(
                doc.collection.name(),
                &doc.key,
            )),
            ForeignStatus::Committed => {
                self.help_unstage(&doc.collection, &doc.key, foreign).await;
                Err(OperationError::conflict(doc.collection.name(), &doc.key))
            }
        }
    }

    async fn foreign_status(
        &self,
        collection: &Collection,
        envelope: &StagingEnvelope,
    ) -> Result<ForeignStatus> {
        Ok(foreign::check(
            &self.inner.atr,
            &self.inner.registry,
            collection,
            envelope,
            true,
        )
        .await?)
    }

    /// Finish unstaging a document for an attempt past its commit point
    async fn help_unstage(&self, collection: &Collection, key: &str, envelope: &StagingEnvelope) {
        tracing::debug!(
            "Attempt {} unstaging {}/{} on behalf of committed attempt {}",
            self.inner.attempt_id,
            collection.name(),
            key,
            envelope.attempt_id
        );
        if let Err(e) = staging::unstage(
            collection,
            key,
            envelope.attempt_id,
            self.inner.config.durability_level,
        )
        .await
        {
            tracing::warn!("Failed to unstage {}/{}: {}", collection.name(), key, e);
        }
    }
}

/// Losing a CAS race while staging means another writer got there first
fn staging_error(collection: &Collection, key: &str, error: StoreError) -> OperationError {
    match error {
        StoreError::CasMismatch(_) | StoreError::NotFound(_) | StoreError::AlreadyExists(_) => {
            OperationError::conflict(collection.name(), key)
        }
        e => OperationError::Store(e),
    }
}

/// The only way an attempt's own entry disappears or leaves `InProgress`
/// behind its back is expiry followed by cleanup or a foreign abort
fn atr_failure(error: AtrError) -> OperationError {
    match error {
        AtrError::EntryNotFound { .. } | AtrError::UnexpectedState { .. } => {
            OperationError::Expired
        }
        e => OperationError::Atr(e),
    }
}
