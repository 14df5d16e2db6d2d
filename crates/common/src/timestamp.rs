//! Physical timestamps in microseconds since the Unix epoch

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp with microsecond precision
///
/// Deadlines written into the store are compared against the local clock of
/// whichever process reads them, so this is plain physical time rather than
/// a logical clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self(micros)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// Timestamp `duration` later than this one, saturating at the far future
    pub fn add_duration(&self, duration: Duration) -> Self {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(micros))
    }

    /// Microseconds elapsed from `earlier` to `self`, zero if `earlier` is later
    pub fn duration_since(&self, earlier: &Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Time left until this timestamp, zero once it has passed
    pub fn remaining(&self) -> Duration {
        Duration::from_micros(self.duration_since(&Timestamp::now()))
    }

    pub fn has_passed(&self) -> bool {
        *self <= Timestamp::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
