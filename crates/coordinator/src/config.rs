//! Transaction configuration

use crate::error::ConfigError;
use proven_kv::Durability;
use std::time::Duration;

/// Configuration shared by every attempt a [`crate::Transactions`] spawns
///
/// Read-only once handed to `Transactions::new`.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Durability required of every staged, unstaged and ATR write
    pub durability_level: Durability,

    /// Time budget for a whole transaction, across all of its attempts
    pub expiration_time: Duration,

    /// Resolve this client's own finished attempts in the background
    pub cleanup_client_attempts: bool,

    /// Periodically scan ATRs for expired attempts left by any client
    pub cleanup_lost_attempts: bool,

    /// Interval between lost-attempt sweeps
    pub cleanup_window: Duration,

    /// Number of ATR documents per collection
    pub num_atrs: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            durability_level: Durability::Majority,
            expiration_time: Duration::from_secs(15),
            cleanup_client_attempts: true,
            cleanup_lost_attempts: true,
            cleanup_window: Duration::from_secs(60),
            num_atrs: 1024,
        }
    }
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set durability level
    pub fn with_durability_level(mut self, level: Durability) -> Self {
        self.durability_level = level;
        self
    }

    /// Set expiration time
    pub fn with_expiration_time(mut self, expiration: Duration) -> Self {
        self.expiration_time = expiration;
        self
    }

    /// Enable or disable cleanup of this client's attempts
    pub fn with_cleanup_client_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_client_attempts = enabled;
        self
    }

    /// Enable or disable the lost-attempt sweep
    pub fn with_cleanup_lost_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_lost_attempts = enabled;
        self
    }

    /// Set the lost-attempt sweep interval
    pub fn with_cleanup_window(mut self, window: Duration) -> Self {
        self.cleanup_window = window;
        self
    }

    /// Set the number of ATRs per collection
    pub fn with_num_atrs(mut self, num_atrs: usize) -> Self {
        self.num_atrs = num_atrs;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expiration_time.is_zero() {
            return Err(ConfigError::Invalid(
                "expiration_time must be greater than zero".to_string(),
            ));
        }
        if self.cleanup_lost_attempts && self.cleanup_window.is_zero() {
            return Err(ConfigError::Invalid(
                "cleanup_window must be greater than zero".to_string(),
            ));
        }
        if self.num_atrs == 0 {
            return Err(ConfigError::Invalid(
                "num_atrs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
