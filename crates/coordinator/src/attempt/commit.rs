//! Commit and rollback protocols
//!
//! Commit: validate the read set, move the ATR entry to `Committing` (the
//! commit point), unstage every mutation in staging order, then mark the
//! entry `Committed`. Rollback: move the entry to `RollingBack`, revert every
//! touched document newest first, then mark it `RolledBack`.

use super::{AttemptContext, AttemptState, atr_failure};
use crate::backoff::retry_transient;
use crate::error::{AtrError, OperationError, Result};
use crate::staging;
use proven_common::Timestamp;
use std::time::Duration;

/// Time allowed past the deadline to finish resolving staged writes
const RESOLVE_GRACE: Duration = Duration::from_secs(1);

impl AttemptContext {
    /// Called once transaction logic has returned successfully
    pub(crate) async fn complete(&self) -> Result<()> {
        let _guard = self.inner.op_lock.lock().await;
        match self.state() {
            AttemptState::NotStarted | AttemptState::InProgress => self.commit_attempt().await,
            AttemptState::Committing | AttemptState::Committed => Ok(()),
            AttemptState::RollingBack | AttemptState::RolledBack if self.rolled_back_by_app() => {
                Err(OperationError::RolledBackByApplication)
            }
            state => Err(OperationError::NotActive(state)),
        }
    }

    /// Roll back an attempt whose logic failed or ran out of time
    pub(crate) async fn abort(&self) -> Result<()> {
        let _guard = self.inner.op_lock.lock().await;
        self.rollback_attempt().await
    }

    fn grace_deadline(&self) -> Timestamp {
        Timestamp::now()
            .add_duration(RESOLVE_GRACE)
            .max(self.inner.deadline)
    }

    pub(super) async fn commit_attempt(&self) -> Result<()> {
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

        let attempt_id = self.inner.attempt_id;
        let Some((atr_collection, location)) = self.atr() else {
            let mut data = self.inner.data.lock();
            data.state = AttemptState::Committed;
            data.unstaging_complete = true;
            tracing::debug!("Attempt {} committed with nothing staged", attempt_id);
            return Ok(());
        };

        self.validate_reads().await?;

        let atr = &self.inner.atr;
        retry_transient(self.inner.deadline, || {
            atr.transition(
                &atr_collection,
                &location.key,
                attempt_id,
                &[AttemptState::InProgress],
                AttemptState::Committing,
            )
        })
        .await
        .map_err(atr_failure)?;
        self.set_state(AttemptState::Committing);
        tracing::debug!("Attempt {} passed its commit point", attempt_id);

        // From here on the transaction has committed; failures only leave
        // work for cleanup
        let mutations = self.inner.data.lock().mutations.clone();
        let durability = self.inner.config.durability_level;
        let grace = self.grace_deadline();

        let mut complete = true;
        for mutation in &mutations {
            let result = retry_transient(grace, || {
                staging::unstage(&mutation.collection, &mutation.key, attempt_id, durability)
            })
            .await;
            if let Err(e) = result {
                tracing::warn!(
                    "Attempt {} could not unstage {}: {}",
                    attempt_id,
                    mutation.doc_id(),
                    e
                );
                complete = false;
                break;
            }
        }

        if complete {
            let result = retry_transient(grace, || {
                atr.transition(
                    &atr_collection,
                    &location.key,
                    attempt_id,
                    &[AttemptState::Committing],
                    AttemptState::Committed,
                )
            })
            .await;
            if let Err(e) = result {
                tracing::warn!("Attempt {} could not complete its ATR entry: {}", attempt_id, e);
                complete = false;
            }
        }

        let mut data = self.inner.data.lock();
        data.unstaging_complete = complete;
        data.state = if complete {
            AttemptState::Committed
        } else {
            AttemptState::Committing
        };
        Ok(())
    }

    /// Every document read and not mutated must be unchanged at commit
    async fn validate_reads(&self) -> Result<()> {
        let reads: Vec<_> = self
            .inner
            .data
            .lock()
            .reads
            .iter()
            .map(|(id, (collection, cas))| (id.clone(), collection.clone(), *cas))
            .collect();

        for (id, collection, cas) in reads {
            match self.lookup(&collection, &id.key).await? {
                Some(document) if document.cas == cas => {}
                _ => {
                    tracing::debug!(
                        "Attempt {} read of {} is stale",
                        self.inner.attempt_id,
                        id
                    );
                    return Err(OperationError::conflict(&id.collection, &id.key));
                }
            }
        }
        Ok(())
    }

    pub(super) async fn rollback_attempt(&self) -> Result<()> {
        let state = self.state();
        match state {
            AttemptState::RolledBack => return Ok(()),
            AttemptState::Committing | AttemptState::Committed => {
                return Err(OperationError::NotActive(state));
            }
            _ => {}
        }

        let attempt_id = self.inner.attempt_id;
        let Some((atr_collection, location)) = self.atr() else {
            self.finish_rollback();
            return Ok(());
        };

        let atr = &self.inner.atr;
        let grace = self.grace_deadline();

        // A missing or already rolled back entry means cleanup got here first
        let entry_live = match retry_transient(grace, || {
            atr.transition(
                &atr_collection,
                &location.key,
                attempt_id,
                &[AttemptState::InProgress],
                AttemptState::RollingBack,
            )
        })
        .await
        {
            Ok(_) => true,
            Err(AtrError::EntryNotFound { .. })
            | Err(AtrError::UnexpectedState {
                actual: AttemptState::RolledBack,
                ..
            }) => false,
            Err(e) => {
                tracing::error!("Attempt {} could not start rolling back: {}", attempt_id, e);
                self.set_state(AttemptState::Failed);
                return Err(e.into());
            }
        };
        self.set_state(AttemptState::RollingBack);

        let touched = self.inner.data.lock().touched.clone();
        let durability = self.inner.config.durability_level;
        let mut failure = None;
        for (collection, key) in touched.iter().rev() {
            let result = retry_transient(grace, || {
                staging::revert(collection, key, attempt_id, durability)
            })
            .await;
            if let Err(e) = result {
                tracing::warn!(
                    "Attempt {} could not revert {}/{}: {}",
                    attempt_id,
                    collection.name(),
                    key,
                    e
                );
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            self.set_state(AttemptState::Failed);
            return Err(e.into());
        }

        if entry_live {
            let result = retry_transient(grace, || {
                atr.transition(
                    &atr_collection,
                    &location.key,
                    attempt_id,
                    &[AttemptState::RollingBack],
                    AttemptState::RolledBack,
                )
            })
            .await;
            match result {
                Ok(_) | Err(AtrError::EntryNotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!("Attempt {} could not complete its ATR entry: {}", attempt_id, e)
                }
            }
        }

        self.finish_rollback();
        tracing::debug!("Attempt {} rolled back", attempt_id);
        Ok(())
    }

    fn finish_rollback(&self) {
        let mut data = self.inner.data.lock();
        data.state = AttemptState::RolledBack;
        data.mutations.clear();
    }
}
