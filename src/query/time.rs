use std::fmt;

use chrono::{DateTime, SecondsFormat};

/// A point in time, in nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(i64);

impl Time {
    /// The earliest representable instant
    pub const MIN: Time = Time(i64::MIN);
    /// The latest representable instant
    pub const MAX: Time = Time(i64::MAX);

    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub const fn nanos(&self) -> i64 {
        self.0
    }

    /// Adds a signed nanosecond offset, clamping at the edges of the time domain
    pub fn saturating_add(self, nanos: i64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    /// Subtracts a signed nanosecond offset, clamping at the edges of the time domain
    pub fn saturating_sub(self, nanos: i64) -> Self {
        Self(self.0.saturating_sub(nanos))
    }
}

impl From<i64> for Time {
    fn from(nanos: i64) -> Self {
        Self(nanos)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // i64 nanoseconds always fit chrono's range
        let dt = DateTime::from_timestamp_nanos(self.0);
        write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }
}

/// Overall time bounds of a query: `start` inclusive, `stop` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub start: Time,
    pub stop: Time,
}

impl Bounds {
    pub fn new(start: i64, stop: i64) -> Self {
        Self {
            start: Time(start),
            stop: Time(stop),
        }
    }

    /// The whole representable time domain
    pub fn unbounded() -> Self {
        Self {
            start: Time::MIN,
            stop: Time::MAX,
        }
    }

    /// Checks if the bounds contain a specific instant
    pub fn contains(&self, t: Time) -> bool {
        t >= self.start && t < self.stop
    }

    pub fn is_empty(&self) -> bool {
        self.stop <= self.start
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

/// Shape of a windowed read: each window is `period` long and the
/// window stop moves by `every` between windows. Both are in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub every: i64,
    pub period: i64,
}

impl Window {
    pub fn new(every: i64, period: i64) -> Self {
        Self { every, period }
    }

    /// A window whose step equals its length, so consecutive windows abut
    pub fn tumbling(duration: i64) -> Self {
        Self::new(duration, duration)
    }
}
