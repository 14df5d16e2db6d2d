//! Dealing with documents staged by other attempts

use crate::atr::AtrManager;
use crate::attempt::AttemptState;
use crate::error::AtrError;
use crate::registry::CollectionRegistry;
use crate::staging::StagingEnvelope;
use proven_kv::Collection;

/// How the owner of a foreign envelope stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ForeignStatus {
    /// Still running; its staged value must not be seen or overwritten
    Pending,
    /// Past its commit point; its staged value is the document's real value
    Committed,
    /// Rolled back, expired or gone; its envelope can be overwritten
    Abandoned,
}

/// Look up the owner of `envelope` in its ATR
///
/// With `abort_expired`, an expired in-progress owner is moved to
/// `RollingBack` so that it can never reach its commit point afterwards.
pub(crate) async fn check(
    atr: &AtrManager,
    registry: &CollectionRegistry,
    doc_collection: &Collection,
    envelope: &StagingEnvelope,
    abort_expired: bool,
) -> Result<ForeignStatus, AtrError> {
    let atr_collection = match registry.resolve(&envelope.atr.collection) {
        Some(c) => c,
        None if envelope.atr.collection == doc_collection.name() => doc_collection.clone(),
        None => {
            tracing::warn!(
                "ATR collection {} of attempt {} is not registered",
                envelope.atr.collection,
                envelope.attempt_id
            );
            return Err(AtrError::UnknownCollection(envelope.atr.collection.clone()));
        }
    };

    let Some(entry) = atr
        .entry(&atr_collection, &envelope.atr.key, envelope.attempt_id)
        .await?
    else {
        return Ok(ForeignStatus::Abandoned);
    };

    let state = match entry.state {
        AttemptState::InProgress if entry.has_expired() && abort_expired => {
            tracing::debug!(
                "Aborting expired attempt {} blocking {}",
                envelope.attempt_id,
                envelope.atr
            );
            match atr
                .transition(
                    &atr_collection,
                    &envelope.atr.key,
                    envelope.attempt_id,
                    &[AttemptState::InProgress],
                    AttemptState::RollingBack,
                )
                .await
            {
                Ok(entry) => entry.state,
                Err(AtrError::EntryNotFound { .. }) => return Ok(ForeignStatus::Abandoned),
                Err(AtrError::UnexpectedState { actual, .. }) => actual,
                Err(e) => return Err(e),
            }
        }
        state => state,
    };

    Ok(match state {
        AttemptState::InProgress => ForeignStatus::Pending,
        AttemptState::Committing | AttemptState::Committed => ForeignStatus::Committed,
        AttemptState::NotStarted
        | AttemptState::RollingBack
        | AttemptState::RolledBack
        | AttemptState::Failed => ForeignStatus::Abandoned,
    })
}
