//! Error types for the coordinator

use crate::attempt::AttemptState;
use proven_common::{AttemptId, TransactionId};
use proven_kv::StoreError;
use thiserror::Error;

/// Errors returned by [`crate::AttemptContext`] operations
///
/// Transaction logic propagates these with `?`; the coordinator decides from
/// the variant whether to retry the attempt or fail the transaction.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("Document not found: {collection}/{key}")]
    DocumentNotFound { collection: String, key: String },

    #[error("Document already exists: {collection}/{key}")]
    DocumentExists { collection: String, key: String },

    /// Another attempt changed or staged the document first
    #[error("Write-write conflict on {collection}/{key}")]
    WriteWriteConflict { collection: String, key: String },

    #[error("Transaction expired")]
    Expired,

    #[error("Attempt is no longer active (state {0})")]
    NotActive(AttemptState),

    #[error("Transaction rolled back by application")]
    RolledBackByApplication,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("ATR error: {0}")]
    Atr(#[from] AtrError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Application error: {0}")]
    Application(Box<dyn std::error::Error + Send + Sync>),
}

impl OperationError {
    /// Wrap an error raised by transaction logic
    pub fn application(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        OperationError::Application(error.into())
    }

    /// Whether a fresh attempt may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        match self {
            OperationError::WriteWriteConflict { .. } => true,
            OperationError::Store(e) => e.is_transient(),
            OperationError::Atr(e) => e.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn not_found(collection: &str, key: &str) -> Self {
        OperationError::DocumentNotFound {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn exists(collection: &str, key: &str) -> Self {
        OperationError::DocumentExists {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn conflict(collection: &str, key: &str) -> Self {
        OperationError::WriteWriteConflict {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }
}

/// Result type for attempt operations
pub type Result<T> = std::result::Result<T, OperationError>;

/// Terminal failure of [`crate::Transactions::run`]
///
/// Unless `state` is [`AttemptState::RolledBack`] the outcome is not
/// guaranteed: writes may still be completed or reverted by cleanup.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Transaction {transaction_id} expired (state {state})")]
    Expired {
        transaction_id: TransactionId,
        state: AttemptState,
    },

    #[error("Transaction {transaction_id} failed (state {state}): {cause}")]
    Failed {
        transaction_id: TransactionId,
        state: AttemptState,
        #[source]
        cause: Box<OperationError>,
    },
}

impl TransactionError {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            TransactionError::Expired { transaction_id, .. }
            | TransactionError::Failed { transaction_id, .. } => *transaction_id,
        }
    }

    /// State of the last attempt when the transaction gave up
    pub fn state(&self) -> AttemptState {
        match self {
            TransactionError::Expired { state, .. } | TransactionError::Failed { state, .. } => {
                *state
            }
        }
    }

    /// Whether the last attempt is confirmed to have left no trace
    pub fn is_rolled_back(&self) -> bool {
        self.state() == AttemptState::RolledBack
    }

    pub fn cause(&self) -> Option<&OperationError> {
        match self {
            TransactionError::Expired { .. } => None,
            TransactionError::Failed { cause, .. } => Some(cause),
        }
    }
}

/// ATR manager errors
#[derive(Debug, Error)]
pub enum AtrError {
    #[error("ATR entry {attempt_id} not found in {atr}")]
    EntryNotFound { atr: String, attempt_id: AttemptId },

    #[error("ATR entry {attempt_id} is {actual}, expected one of {expected:?}")]
    UnexpectedState {
        attempt_id: AttemptId,
        actual: AttemptState,
        expected: Vec<AttemptState>,
    },

    #[error("Corrupt ATR document {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AtrError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AtrError::Store(e) if e.is_transient())
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
