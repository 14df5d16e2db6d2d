//! Cleanup of finished and lost attempts
//!
//! Two background tasks resolve ATR entries that no attempt will touch
//! again: a client worker fed by [`crate::Transactions::run`] with the
//! attempts it just finished, and a lost-attempt sweeper that periodically
//! scans every ATR of every known collection for expired entries.
//!
//! Resolution uses the same idempotent, CAS-guarded writes as the attempts
//! themselves, so any number of cleanup runs (in this process or others)
//! can race on the same entry. The loser finds the entry gone and moves on.

use crate::atr::{AtrEntry, AtrManager, atr_key};
use crate::attempt::AttemptState;
use crate::config::TransactionConfig;
use crate::error::AtrError;
use crate::registry::CollectionRegistry;
use crate::staging::{self, AtrLocation};
use parking_lot::Mutex;
use proven_common::AttemptId;
use proven_kv::{Collection, Durability, StoreError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Times an entry may change under a single resolution before giving up
const MAX_RESOLVE_ROUNDS: usize = 4;

/// What resolving one ATR entry did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The entry was already gone
    AlreadyResolved,
    /// The entry belongs to an attempt that may still be running
    NotExpired,
    /// Staged writes were unstaged and the entry removed
    Committed,
    /// Staged writes were reverted and the entry removed
    RolledBack,
    /// The entry was already terminal and has been removed
    Removed,
}

/// Running totals over the lifetime of a [`Cleanup`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub committed: u64,
    pub rolled_back: u64,
    pub removed: u64,
    pub already_resolved: u64,
    pub failed: u64,
    pub sweeps: u64,
}

#[derive(Default)]
struct StatsCounters {
    committed: AtomicU64,
    rolled_back: AtomicU64,
    removed: AtomicU64,
    already_resolved: AtomicU64,
    failed: AtomicU64,
    sweeps: AtomicU64,
}

impl StatsCounters {
    fn record(&self, result: &Result<CleanupOutcome, AtrError>) {
        let counter = match result {
            Ok(CleanupOutcome::Committed) => &self.committed,
            Ok(CleanupOutcome::RolledBack) => &self.rolled_back,
            Ok(CleanupOutcome::Removed) => &self.removed,
            Ok(CleanupOutcome::AlreadyResolved) => &self.already_resolved,
            Ok(CleanupOutcome::NotExpired) => return,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CleanupStats {
        CleanupStats {
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            already_resolved: self.already_resolved.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

/// Result of one pass over every ATR
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub atrs_scanned: usize,
    pub entries_seen: usize,
    pub not_expired: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub removed: usize,
    pub failed: usize,
}

/// A finished attempt whose entry should be resolved and removed
#[derive(Debug, Clone)]
pub(crate) struct CleanupRequest {
    pub atr: AtrLocation,
    pub attempt_id: AttemptId,
}

enum Message {
    Cleanup(CleanupRequest),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
struct Resolver {
    durability: Durability,
    atr: AtrManager,
    registry: Arc<CollectionRegistry>,
    stats: Arc<StatsCounters>,
}

impl Resolver {
    fn collection(&self, name: &str) -> Result<Collection, AtrError> {
        self.registry
            .resolve(name)
            .ok_or_else(|| AtrError::UnknownCollection(name.to_string()))
    }

    async fn resolve_counted(
        &self,
        location: &AtrLocation,
        attempt_id: AttemptId,
        force: bool,
    ) -> Result<CleanupOutcome, AtrError> {
        let result = self.resolve(location, attempt_id, force).await;
        self.stats.record(&result);
        match &result {
            Ok(CleanupOutcome::NotExpired) | Ok(CleanupOutcome::AlreadyResolved) => {}
            Ok(outcome) => {
                tracing::debug!("Cleanup of attempt {} in {}: {:?}", attempt_id, location, outcome)
            }
            Err(e) => tracing::warn!("Cleanup of attempt {} in {} failed: {}", attempt_id, location, e),
        }
        result
    }

    async fn resolve(
        &self,
        location: &AtrLocation,
        attempt_id: AttemptId,
        force: bool,
    ) -> Result<CleanupOutcome, AtrError> {
        let collection = self.collection(&location.collection)?;

        for _ in 0..MAX_RESOLVE_ROUNDS {
            let Some(entry) = self.atr.entry(&collection, &location.key, attempt_id).await? else {
                return Ok(CleanupOutcome::AlreadyResolved);
            };
            if !force && !entry.has_expired() {
                return Ok(CleanupOutcome::NotExpired);
            }

            let outcome = match entry.state {
                AttemptState::InProgress => {
                    // Fence the owner off from its commit point first
                    match self
                        .atr
                        .transition(
                            &collection,
                            &location.key,
                            attempt_id,
                            &[AttemptState::InProgress],
                            AttemptState::RollingBack,
                        )
                        .await
                    {
                        Ok(_) => {}
                        Err(AtrError::UnexpectedState { .. }) => continue,
                        Err(AtrError::EntryNotFound { .. }) => {
                            return Ok(CleanupOutcome::AlreadyResolved);
                        }
                        Err(e) => return Err(e),
                    }
                    self.roll_back(&collection, location, attempt_id, &entry).await?
                }
                AttemptState::RollingBack => {
                    self.roll_back(&collection, location, attempt_id, &entry).await?
                }
                AttemptState::Committing => {
                    self.roll_forward(&collection, location, attempt_id, &entry).await?
                }
                AttemptState::Committed
                | AttemptState::RolledBack
                | AttemptState::NotStarted
                | AttemptState::Failed => {
                    if !self.atr.remove(&collection, &location.key, attempt_id).await? {
                        return Ok(CleanupOutcome::AlreadyResolved);
                    }
                    CleanupOutcome::Removed
                }
            };
            return Ok(outcome);
        }

        Err(StoreError::Transient(format!(
            "ATR entry {} in {} kept changing",
            attempt_id, location
        ))
        .into())
    }

    async fn roll_forward(
        &self,
        collection: &Collection,
        location: &AtrLocation,
        attempt_id: AttemptId,
        entry: &AtrEntry,
    ) -> Result<CleanupOutcome, AtrError> {
        for doc in &entry.documents {
            let doc_collection = self.collection(&doc.collection)?;
            staging::unstage(&doc_collection, &doc.key, attempt_id, self.durability).await?;
        }
        self.finish(
            collection,
            location,
            attempt_id,
            AttemptState::Committing,
            AttemptState::Committed,
        )
        .await?;
        Ok(CleanupOutcome::Committed)
    }

    async fn roll_back(
        &self,
        collection: &Collection,
        location: &AtrLocation,
        attempt_id: AttemptId,
        entry: &AtrEntry,
    ) -> Result<CleanupOutcome, AtrError> {
        for doc in entry.documents.iter().rev() {
            let doc_collection = self.collection(&doc.collection)?;
            staging::revert(&doc_collection, &doc.key, attempt_id, self.durability).await?;
        }
        self.finish(
            collection,
            location,
            attempt_id,
            AttemptState::RollingBack,
            AttemptState::RolledBack,
        )
        .await?;
        Ok(CleanupOutcome::RolledBack)
    }

    /// Record the terminal state, then drop the entry
    async fn finish(
        &self,
        collection: &Collection,
        location: &AtrLocation,
        attempt_id: AttemptId,
        from: AttemptState,
        to: AttemptState,
    ) -> Result<(), AtrError> {
        match self
            .atr
            .transition(collection, &location.key, attempt_id, &[from], to)
            .await
        {
            Ok(_) | Err(AtrError::EntryNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        self.atr.remove(collection, &location.key, attempt_id).await?;
        Ok(())
    }

    async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for collection in self.registry.all() {
            for index in 0..self.atr.num_atrs() {
                let key = atr_key(index);
                let entries = match self.atr.entries(&collection, &key).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        tracing::warn!("Failed to read ATR {}/{}: {}", collection.name(), key, e);
                        report.failed += 1;
                        continue;
                    }
                };
                report.atrs_scanned += 1;

                for (attempt_id, entry) in entries {
                    report.entries_seen += 1;
                    if !entry.has_expired() {
                        report.not_expired += 1;
                        continue;
                    }

                    let location = AtrLocation {
                        collection: collection.name().to_string(),
                        key: key.clone(),
                    };
                    match self.resolve_counted(&location, attempt_id, false).await {
                        Ok(CleanupOutcome::Committed) => report.committed += 1,
                        Ok(CleanupOutcome::RolledBack) => report.rolled_back += 1,
                        Ok(CleanupOutcome::Removed) => report.removed += 1,
                        Ok(CleanupOutcome::NotExpired) => report.not_expired += 1,
                        Ok(CleanupOutcome::AlreadyResolved) => {}
                        Err(_) => report.failed += 1,
                    }
                }
            }
        }

        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
        report
    }
}

async fn client_worker(resolver: Resolver, mut receiver: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = receiver.recv().await {
        match message {
            Message::Cleanup(request) => {
                // Errors are logged and counted; the lost-attempt sweep retries
                let _ = resolver
                    .resolve_counted(&request.atr, request.attempt_id, true)
                    .await;
            }
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn lost_sweeper(resolver: Resolver, window: Duration) {
    let mut ticker = tokio::time::interval(window);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let report = resolver.sweep().await;
        if report.committed + report.rolled_back + report.removed + report.failed > 0 {
            tracing::info!("Lost-attempt sweep: {:?}", report);
        }
    }
}

/// Background and on-demand resolution of ATR entries
pub struct Cleanup {
    resolver: Resolver,
    client_queue: Option<mpsc::UnboundedSender<Message>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Cleanup {
    /// Start the background tasks enabled in `config`
    ///
    /// Outside a tokio runtime nothing is spawned and only the on-demand
    /// operations are available.
    pub(crate) fn start(
        config: &TransactionConfig,
        atr: AtrManager,
        registry: Arc<CollectionRegistry>,
    ) -> Self {
        let resolver = Resolver {
            durability: config.durability_level,
            atr,
            registry,
            stats: Arc::new(StatsCounters::default()),
        };

        let mut tasks = Vec::new();
        let mut client_queue = None;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                if config.cleanup_client_attempts {
                    let (sender, receiver) = mpsc::unbounded_channel();
                    tasks.push(runtime.spawn(client_worker(resolver.clone(), receiver)));
                    client_queue = Some(sender);
                }
                if config.cleanup_lost_attempts {
                    tasks.push(runtime.spawn(lost_sweeper(resolver.clone(), config.cleanup_window)));
                }
            }
            Err(_) => {
                if config.cleanup_client_attempts || config.cleanup_lost_attempts {
                    tracing::warn!("No tokio runtime, background cleanup disabled");
                }
            }
        }

        Self {
            resolver,
            client_queue,
            tasks: Mutex::new(tasks),
        }
    }

    /// Queue a finished attempt for the client worker
    pub(crate) fn enqueue(&self, request: CleanupRequest) {
        if let Some(queue) = &self.client_queue
            && queue.send(Message::Cleanup(request)).is_err()
        {
            tracing::debug!("Client cleanup has stopped, leaving entry to lost-attempt cleanup");
        }
    }

    /// Resolve one ATR entry now
    ///
    /// Unless `force` is set, entries that have not expired are left alone.
    pub async fn cleanup_entry(
        &self,
        location: &AtrLocation,
        attempt_id: AttemptId,
        force: bool,
    ) -> Result<CleanupOutcome, AtrError> {
        self.resolver
            .resolve_counted(location, attempt_id, force)
            .await
    }

    /// Scan every ATR of every registered collection once
    pub async fn sweep(&self) -> SweepReport {
        self.resolver.sweep().await
    }

    /// Wait until every attempt queued so far has been handled
    pub async fn flush(&self) {
        let Some(queue) = &self.client_queue else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if queue.send(Message::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn stats(&self) -> CleanupStats {
        self.resolver.stats.snapshot()
    }

    /// Drain the client queue, then stop the background tasks
    pub async fn close(&self) {
        self.flush().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::{DocId, MutationKind, StagingEnvelope};
    use proven_common::{Timestamp, TransactionId};
    use proven_kv::{DocumentContent, MemoryStore};

    struct Fixture {
        collection: Collection,
        cleanup: Cleanup,
        atr: AtrManager,
    }

    fn fixture() -> Fixture {
        let collection = Collection::new("default", Arc::new(MemoryStore::new()));
        let registry = Arc::new(CollectionRegistry::default());
        registry.register(&collection);
        let config = TransactionConfig::default()
            .with_durability_level(Durability::None)
            .with_cleanup_client_attempts(false)
            .with_cleanup_lost_attempts(false)
            .with_num_atrs(4);
        let atr = AtrManager::new(config.durability_level, config.num_atrs);
        let cleanup = Cleanup::start(&config, atr.clone(), registry);
        Fixture {
            collection,
            cleanup,
            atr,
        }
    }

    /// Stage a replace of `key` to `staged` by a fresh attempt in `state`
    async fn stage_replace(
        f: &Fixture,
        key: &str,
        staged: &str,
        state: AttemptState,
        expired: bool,
    ) -> (AtrLocation, AttemptId) {
        let location = f.atr.location_for(&f.collection, key);
        let attempt_id = AttemptId::new();
        let now = Timestamp::now();
        let expires = if expired {
            Timestamp::from_micros(1)
        } else {
            now.add_duration(Duration::from_secs(60))
        };
        let mut entry = AtrEntry::new(TransactionId::new(), now, expires);
        entry.documents.push(DocId::new(&f.collection, key));
        f.atr
            .begin(&f.collection, &location.key, attempt_id, entry.clone())
            .await
            .unwrap();
        if state != AttemptState::InProgress {
            f.atr
                .transition(
                    &f.collection,
                    &location.key,
                    attempt_id,
                    &[AttemptState::InProgress],
                    state,
                )
                .await
                .unwrap();
        }

        let envelope = StagingEnvelope {
            transaction_id: entry.transaction_id,
            attempt_id,
            atr: location.clone(),
            kind: MutationKind::Replace,
            staged: Some(staged.as_bytes().to_vec()),
        };
        let current = f.collection.lookup(key).await.unwrap();
        let content = DocumentContent::body(current.body.unwrap())
            .with_xattr(envelope.encode().unwrap());
        f.collection
            .store()
            .replace(key, content, current.cas, Durability::None)
            .await
            .unwrap();

        (location, attempt_id)
    }

    async fn body(f: &Fixture, key: &str) -> String {
        let doc = f.collection.lookup(key).await.unwrap();
        assert!(doc.xattr.is_none(), "{} still staged", key);
        String::from_utf8(doc.body.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_committing_entry_rolled_forward() {
        let f = fixture();
        f.collection.insert("doc", "old").await.unwrap();
        let (location, attempt_id) =
            stage_replace(&f, "doc", "new", AttemptState::Committing, true).await;

        let outcome = f
            .cleanup
            .cleanup_entry(&location, attempt_id, false)
            .await
            .unwrap();
        assert_eq!(outcome, CleanupOutcome::Committed);
        assert_eq!(body(&f, "doc").await, "new");
        assert!(
            f.atr
                .entry(&f.collection, &location.key, attempt_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_expired_pending_entry_rolled_back() {
        let f = fixture();
        f.collection.insert("doc", "old").await.unwrap();
        let (location, attempt_id) =
            stage_replace(&f, "doc", "new", AttemptState::InProgress, true).await;

        let outcome = f
            .cleanup
            .cleanup_entry(&location, attempt_id, false)
            .await
            .unwrap();
        assert_eq!(outcome, CleanupOutcome::RolledBack);
        assert_eq!(body(&f, "doc").await, "old");

        // A second run finds nothing to do
        let outcome = f
            .cleanup
            .cleanup_entry(&location, attempt_id, false)
            .await
            .unwrap();
        assert_eq!(outcome, CleanupOutcome::AlreadyResolved);
    }

    #[tokio::test]
    async fn test_live_entry_left_alone_unless_forced() {
        let f = fixture();
        f.collection.insert("doc", "old").await.unwrap();
        let (location, attempt_id) =
            stage_replace(&f, "doc", "new", AttemptState::InProgress, false).await;

        let outcome = f
            .cleanup
            .cleanup_entry(&location, attempt_id, false)
            .await
            .unwrap();
        assert_eq!(outcome, CleanupOutcome::NotExpired);
        assert!(f.collection.lookup("doc").await.unwrap().xattr.is_some());

        let outcome = f
            .cleanup
            .cleanup_entry(&location, attempt_id, true)
            .await
            .unwrap();
        assert_eq!(outcome, CleanupOutcome::RolledBack);
        assert_eq!(body(&f, "doc").await, "old");
    }

    #[tokio::test]
    async fn test_sweep_resolves_only_expired() {
        let f = fixture();
        for key in ["a", "b", "c"] {
            f.collection.insert(key, "old").await.unwrap();
        }
        stage_replace(&f, "a", "new", AttemptState::Committing, true).await;
        stage_replace(&f, "b", "new", AttemptState::InProgress, true).await;
        stage_replace(&f, "c", "new", AttemptState::InProgress, false).await;

        let report = f.cleanup.sweep().await;
        assert_eq!(report.atrs_scanned, 4);
        assert_eq!(report.entries_seen, 3);
        assert_eq!(report.committed, 1);
        assert_eq!(report.rolled_back, 1);
        assert_eq!(report.not_expired, 1);

        assert_eq!(body(&f, "a").await, "new");
        assert_eq!(body(&f, "b").await, "old");
        assert!(f.collection.lookup("c").await.unwrap().xattr.is_some());

        let stats = f.cleanup.stats();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.rolled_back, 1);
        assert_eq!(stats.sweeps, 1);
    }

    #[tokio::test]
    async fn test_concurrent_cleanups_agree() {
        let f = Arc::new(fixture());
        f.collection.insert("doc", "old").await.unwrap();
        let (location, attempt_id) =
            stage_replace(&f, "doc", "new", AttemptState::Committing, true).await;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let f = f.clone();
            let location = location.clone();
            handles.push(tokio::spawn(async move {
                f.cleanup.cleanup_entry(&location, attempt_id, false).await
            }));
        }

        let mut committed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(CleanupOutcome::Committed) => committed += 1,
                Ok(CleanupOutcome::AlreadyResolved) | Ok(CleanupOutcome::Removed) => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert!(committed >= 1);
        assert_eq!(body(&f, "doc").await, "new");
    }

    #[tokio::test]
    async fn test_unknown_collection_reported() {
        let f = fixture();
        let location = AtrLocation {
            collection: "elsewhere".into(),
            key: atr_key(0),
        };
        let err = f
            .cleanup
            .cleanup_entry(&location, AttemptId::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, AtrError::UnknownCollection(_)));
        assert_eq!(f.cleanup.stats().failed, 1);
    }
}
