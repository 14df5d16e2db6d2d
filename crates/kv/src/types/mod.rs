//! Type system for the document store

pub mod document;
pub mod durability;

pub use document::{Cas, Document, DocumentContent};
pub use durability::Durability;
