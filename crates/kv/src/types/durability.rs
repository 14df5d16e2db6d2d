//! Durability requirements attached to every mutation

use serde::{Deserialize, Serialize};
use std::fmt;

/// How many copies must acknowledge a write before it is reported successful
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Durability {
    /// Acknowledged from memory on the active node
    None,
    /// Held in memory on a majority of replicas
    #[default]
    Majority,
    /// Majority in memory, persisted on the master (active) node
    MajorityAndPersistOnMaster,
    /// Persisted on a majority of replicas
    PersistToMajority,
}

impl Durability {
    /// Replicas needed, in addition to the active copy, for this level to be achievable
    pub fn min_replicas(&self) -> usize {
        match self {
            Durability::None => 0,
            _ => 1,
        }
    }

    /// Whether the level needs a copy on disk rather than only in memory
    pub fn requires_persistence(&self) -> bool {
        matches!(
            self,
            Durability::MajorityAndPersistOnMaster | Durability::PersistToMajority
        )
    }
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Durability::None => "none",
            Durability::Majority => "majority",
            Durability::MajorityAndPersistOnMaster => "majority_and_persist_on_master",
            Durability::PersistToMajority => "persist_to_majority",
        };
        f.write_str(name)
    }
}
