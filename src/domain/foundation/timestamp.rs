//! Timestamp value object for immutable points in time.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Immutable point in time, always UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp for the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a timestamp from a DateTime<Utc>.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the inner DateTime.
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Checks if this timestamp is before another.
    pub fn is_before(&self, other: &Timestamp) -> bool {
        self.0 < other.0
    }

    /// Checks if this timestamp is after another.
    pub fn is_after(&self, other: &Timestamp) -> bool {
        self.0 > other.0
    }

    /// Returns the duration from another timestamp to this one.
    ///
    /// Returns negative duration if other is after self.
    pub fn duration_since(&self, other: &Timestamp) -> Duration {
        self.0.signed_duration_since(other.0)
    }

    /// Creates a new timestamp offset forward by a std duration.
    ///
    /// Saturates at the maximum representable chrono duration.
    pub fn plus(&self, duration: std::time::Duration) -> Self {
        let delta = Duration::from_std(duration).unwrap_or(Duration::max_value());
        Self(self.0.checked_add_signed(delta).unwrap_or(self.0))
    }

    /// Creates a new timestamp offset backward by a std duration.
    pub fn minus(&self, duration: std::time::Duration) -> Self {
        let delta = Duration::from_std(duration).unwrap_or(Duration::max_value());
        Self(self.0.checked_sub_signed(delta).unwrap_or(self.0))
    }

    /// Returns the timestamp as Unix milliseconds.
    pub fn as_unix_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

/// Hands out non-decreasing timestamps for a single producer.
///
/// Wall clocks can step backwards; stamps from one clock never do.
#[derive(Debug, Default)]
pub struct ProducerClock {
    last: Mutex<Option<Timestamp>>,
}

impl ProducerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp the current moment.
    pub fn stamp(&self) -> Timestamp {
        self.stamp_at(Timestamp::now())
    }

    /// Stamp a candidate time, lifting it to the last issued stamp if needed.
    pub fn stamp_at(&self, candidate: Timestamp) -> Timestamp {
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let stamped = match *last {
            Some(previous) if previous > candidate => previous,
            _ => candidate,
        };
        *last = Some(stamped);
        stamped
    }
}
