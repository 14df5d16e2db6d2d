//! Document store adapter
//!
//! This crate defines the key-value store contract the transaction
//! coordinator is built on: CAS-guarded get/insert/replace/remove of
//! documents that carry an optional committed body plus an opaque
//! extended attribute used for transaction metadata.
//!
//! [`MemoryStore`] is an in-process implementation with configurable
//! replication and fault injection, used by tests and demos.

pub mod error;
pub mod storage;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use storage::{Fault, MemoryStore, StoreOp};
pub use store::{Collection, DocumentStore};
pub use types::{Cas, Document, DocumentContent, Durability};
