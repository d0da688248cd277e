//! Sample timestamps
//!
//! On disk a timestamp is the pair `(seconds: u32, microseconds: u32)`. In memory
//! it is a single signed count of microseconds so that differences and re-basing
//! are plain integer arithmetic.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ReplayError, ReplayResult};

const USEC_PER_SEC: i64 = 1_000_000;

/// A point in time, in microseconds since the Unix epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Time(i64);

impl Time {
    pub const ZERO: Time = Time(0);

    pub const fn from_micros(micros: i64) -> Self {
        Time(micros)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Time(millis * 1_000)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Time(secs * USEC_PER_SEC)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Time((secs * USEC_PER_SEC as f64).round() as i64)
    }

    /// Build from the on-disk `(seconds, microseconds)` pair
    pub fn from_parts(secs: u32, usecs: u32) -> Self {
        Time(secs as i64 * USEC_PER_SEC + usecs as i64)
    }

    /// Split into the on-disk `(seconds, microseconds)` pair.
    ///
    /// Times before the epoch or past 2106 have no on-disk form.
    pub fn to_parts(self) -> ReplayResult<(u32, u32)> {
        let secs = u32::try_from(self.0.div_euclid(USEC_PER_SEC)).map_err(|_| {
            ReplayError::invalid_input(format!("time {} cannot be stored on disk", self))
        })?;
        let usecs = self.0.rem_euclid(USEC_PER_SEC) as u32;
        Ok((secs, usecs))
    }

    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Time(since_epoch.as_micros() as i64)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / USEC_PER_SEC as f64
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (secs, usecs) = (self.0.div_euclid(USEC_PER_SEC), self.0.rem_euclid(USEC_PER_SEC));
        write!(f, "{}.{:06}", secs, usecs)
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.as_micros() as i64)
    }
}

impl Sub<Duration> for Time {
    type Output = Time;

    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.as_micros() as i64)
    }
}

impl Sub for Time {
    type Output = i64;

    /// Difference in microseconds
    fn sub(self, rhs: Time) -> i64 {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts_conversion() {
        let t = Time::from_parts(12, 345_678);
        assert_eq!(t.as_micros(), 12_345_678);
        assert_eq!(t.to_parts().unwrap(), (12, 345_678));
    }

    #[test]
    fn test_parts_range() {
        assert_eq!(Time::from_parts(u32::MAX, 999_999).to_parts().unwrap(), (u32::MAX, 999_999));
        assert!(Time::from_micros(-1).to_parts().is_err());
        assert!(Time::from_secs(u32::MAX as i64 + 1).to_parts().is_err());
    }

    #[test]
    fn test_arithmetic() {
        let t = Time::from_secs(1) + Duration::from_millis(500);
        assert_eq!(t, Time::from_millis(1500));
        assert_eq!(t - Time::from_secs(1), 500_000);
        assert_eq!(Time::from_secs_f64(1.5), t);
    }

    #[test]
    fn test_display() {
        assert_eq!(Time::from_parts(3, 42).to_string(), "3.000042");
    }
}
