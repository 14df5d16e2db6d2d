//! In-process storage for the document store contract

pub mod fault;
pub mod memory;

pub use fault::{Fault, StoreOp};
pub use memory::MemoryStore;
