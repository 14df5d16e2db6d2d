//! Error types for the document store

use crate::types::Durability;
use thiserror::Error;

/// Document store error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    #[error("CAS mismatch on document {0}")]
    CasMismatch(String),

    #[error("Durability {level} cannot be satisfied: {reason}")]
    DurabilityImpossible { level: Durability, reason: String },

    /// Temporary failure; the operation may or may not have been applied
    #[error("Temporary store failure: {0}")]
    Transient(String),

    #[error("Store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    /// Whether retrying the same operation can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
