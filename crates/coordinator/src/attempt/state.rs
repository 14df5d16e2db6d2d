use serde::{Deserialize, Serialize};
use std::fmt;

/// Attempt lifecycle
///
/// Every state except `NotStarted` and `Failed` is also persisted in the
/// attempt's ATR entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptState {
    /// Created, nothing staged yet
    NotStarted,
    /// Staging mutations
    InProgress,
    /// Commit point passed; staged writes are being unstaged
    Committing,
    /// Every staged write has been unstaged
    Committed,
    /// Staged writes are being reverted
    RollingBack,
    /// Every staged write has been reverted
    RolledBack,
    /// Gave up without confirming an outcome
    Failed,
}

impl AttemptState {
    /// Whether the attempt can still stage mutations
    pub fn is_active(&self) -> bool {
        matches!(self, AttemptState::NotStarted | AttemptState::InProgress)
    }

    /// Whether the commit point has been reached
    pub fn is_committed(&self) -> bool {
        matches!(self, AttemptState::Committing | AttemptState::Committed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Committed | AttemptState::RolledBack | AttemptState::Failed
        )
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::NotStarted => "NOT_STARTED",
            AttemptState::InProgress => "IN_PROGRESS",
            AttemptState::Committing => "COMMITTING",
            AttemptState::Committed => "COMMITTED",
            AttemptState::RollingBack => "ROLLING_BACK",
            AttemptState::RolledBack => "ROLLED_BACK",
            AttemptState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
