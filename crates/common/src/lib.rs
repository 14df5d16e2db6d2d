//! Common types for Proven transactions
//!
//! This crate defines:
//! - Transaction and attempt identifiers (UUIDv7-based)
//! - Physical timestamps (microseconds since Unix epoch) used for deadlines

mod timestamp;
mod transaction_id;

pub use timestamp::Timestamp;
pub use transaction_id::{AttemptId, TransactionId};
