//! Client-side multi-document transactions over a CAS key-value store
//!
//! A [`Transactions`] instance runs user logic against an [`AttemptContext`],
//! staging every mutation in the store next to the committed value, then
//! either unstaging (commit) or reverting (rollback) those staged writes.
//! Progress is recorded in Active Transaction Records (ATRs), durable
//! documents that let any process finish or undo an attempt whose owner
//! disappeared.
//!
//! ```ignore
//! let transactions = Transactions::new(TransactionConfig::default())?;
//! transactions
//!     .run(|ctx: AttemptContext| {
//!         let collection = collection.clone();
//!         async move {
//!             let doc = ctx.get(&collection, "doc-b").await?;
//!             let mut content: serde_json::Value = doc.content()?;
//!             content["transactions"] = "are awesome".into();
//!             ctx.replace(&doc, &content).await?;
//!             Ok(())
//!         }
//!     })
//!     .await?;
//! ```

pub mod atr;
pub mod attempt;
mod backoff;
pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod error;
mod registry;
pub mod staging;

pub use atr::{AtrEntry, AtrManager};
pub use attempt::{AttemptContext, AttemptState, TransactionGetResult};
pub use cleanup::{Cleanup, CleanupOutcome, CleanupStats, SweepReport};
pub use config::TransactionConfig;
pub use coordinator::{TransactionLogic, TransactionResult, Transactions};
pub use error::{AtrError, ConfigError, OperationError, Result, TransactionError};
pub use staging::{AtrLocation, DocId, MutationKind, StagingEnvelope};

pub use proven_common::{AttemptId, Timestamp, TransactionId};
pub use proven_kv::{Collection, Durability};
