//! Time Unit Handling
//!
//! Relative (`TimeDelta`) and absolute (`Timestamp`) time with microsecond
//! resolution. Both types carry explicit plus/minus infinity sentinels and
//! saturate instead of overflowing, so filter and estimator code can treat
//! "no deadline" and "never seen" as ordinary values.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Microseconds per millisecond
const MICROS_PER_MILLI: i64 = 1_000;
/// Microseconds per second
const MICROS_PER_SECOND: i64 = 1_000_000;

/// Integer division rounded to the nearest multiple, halves away from zero
fn div_round(numerator: i64, denominator: i64) -> i64 {
    if numerator >= 0 {
        (numerator + denominator / 2) / denominator
    } else {
        (numerator - denominator / 2) / denominator
    }
}

/// A signed time difference with microsecond resolution
///
/// The representable range is bounded by two sentinels: `PLUS_INFINITY` and
/// `MINUS_INFINITY`. Arithmetic saturates at the sentinels, and the sentinels
/// absorb further arithmetic, so an unbounded timeout stays unbounded no
/// matter what is added to it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TimeDelta(i64);

impl TimeDelta {
    /// The zero duration
    pub const ZERO: TimeDelta = TimeDelta(0);
    /// Sentinel for an unbounded positive duration
    pub const PLUS_INFINITY: TimeDelta = TimeDelta(i64::MAX);
    /// Sentinel for an unbounded negative duration
    pub const MINUS_INFINITY: TimeDelta = TimeDelta(i64::MIN);

    /// Create a delta from microseconds
    #[inline]
    pub const fn from_micros(us: i64) -> Self {
        TimeDelta(us)
    }

    /// Create a delta from milliseconds, saturating at the sentinels
    #[inline]
    pub const fn from_millis(ms: i64) -> Self {
        TimeDelta(ms.saturating_mul(MICROS_PER_MILLI))
    }

    /// Create a delta from whole seconds, saturating at the sentinels
    #[inline]
    pub const fn from_seconds(seconds: i64) -> Self {
        TimeDelta(seconds.saturating_mul(MICROS_PER_SECOND))
    }

    /// Raw microsecond count (the sentinel values for infinities)
    #[inline]
    pub const fn us(self) -> i64 {
        self.0
    }

    /// Millisecond count rounded to nearest; infinities saturate
    #[inline]
    pub fn ms(self) -> i64 {
        match self.0 {
            i64::MAX => i64::MAX,
            i64::MIN => i64::MIN,
            us => div_round(us, MICROS_PER_MILLI),
        }
    }

    /// Duration in seconds as a float; infinities map to `f64::INFINITY`
    #[inline]
    pub fn seconds_f64(self) -> f64 {
        match self.0 {
            i64::MAX => f64::INFINITY,
            i64::MIN => f64::NEG_INFINITY,
            us => us as f64 / MICROS_PER_SECOND as f64,
        }
    }

    /// Check whether this is the zero duration
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Check whether this is either infinity sentinel
    #[inline]
    pub const fn is_infinite(self) -> bool {
        self.0 == i64::MAX || self.0 == i64::MIN
    }

    /// Check whether this is a finite value
    #[inline]
    pub const fn is_finite(self) -> bool {
        !self.is_infinite()
    }

    /// Check for the positive infinity sentinel
    #[inline]
    pub const fn is_plus_infinity(self) -> bool {
        self.0 == i64::MAX
    }

    /// Check for the negative infinity sentinel
    #[inline]
    pub const fn is_minus_infinity(self) -> bool {
        self.0 == i64::MIN
    }

    /// Absolute value; `MINUS_INFINITY` maps to `PLUS_INFINITY`
    #[inline]
    pub fn abs(self) -> Self {
        if self.0 == i64::MIN {
            TimeDelta::PLUS_INFINITY
        } else {
            TimeDelta(self.0.abs())
        }
    }
}

impl fmt::Display for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            i64::MAX => write!(f, "+inf"),
            i64::MIN => write!(f, "-inf"),
            us if us % MICROS_PER_MILLI == 0 => write!(f, "{} ms", us / MICROS_PER_MILLI),
            us => write!(f, "{} us", us),
        }
    }
}

impl Add for TimeDelta {
    type Output = TimeDelta;

    fn add(self, rhs: TimeDelta) -> TimeDelta {
        if self.is_plus_infinity() || rhs.is_plus_infinity() {
            debug_assert!(
                !self.is_minus_infinity() && !rhs.is_minus_infinity(),
                "adding opposite infinities"
            );
            TimeDelta::PLUS_INFINITY
        } else if self.is_minus_infinity() || rhs.is_minus_infinity() {
            TimeDelta::MINUS_INFINITY
        } else {
            TimeDelta(self.0.saturating_add(rhs.0))
        }
    }
}

impl AddAssign for TimeDelta {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl Sub for TimeDelta {
    type Output = TimeDelta;

    fn sub(self, rhs: TimeDelta) -> TimeDelta {
        if self.is_plus_infinity() || rhs.is_minus_infinity() {
            debug_assert!(
                !self.is_minus_infinity() && !rhs.is_plus_infinity(),
                "subtracting infinity from itself"
            );
            TimeDelta::PLUS_INFINITY
        } else if self.is_minus_infinity() || rhs.is_plus_infinity() {
            TimeDelta::MINUS_INFINITY
        } else {
            TimeDelta(self.0.saturating_sub(rhs.0))
        }
    }
}

impl SubAssign for TimeDelta {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        *self = *self - rhs;
    }
}

impl Neg for TimeDelta {
    type Output = TimeDelta;

    fn neg(self) -> TimeDelta {
        match self.0 {
            i64::MAX => TimeDelta::MINUS_INFINITY,
            i64::MIN => TimeDelta::PLUS_INFINITY,
            us => TimeDelta(-us),
        }
    }
}

impl Mul<f64> for TimeDelta {
    type Output = TimeDelta;

    /// Scale a finite delta; infinities are preserved (sign flips with a
    /// negative factor)
    fn mul(self, rhs: f64) -> TimeDelta {
        if self.is_infinite() {
            return if (self.0 > 0) == (rhs >= 0.0) {
                TimeDelta::PLUS_INFINITY
            } else {
                TimeDelta::MINUS_INFINITY
            };
        }
        TimeDelta((self.0 as f64 * rhs).round() as i64)
    }
}

impl Div<f64> for TimeDelta {
    type Output = TimeDelta;

    fn div(self, rhs: f64) -> TimeDelta {
        if self.is_infinite() {
            return if (self.0 > 0) == (rhs >= 0.0) {
                TimeDelta::PLUS_INFINITY
            } else {
                TimeDelta::MINUS_INFINITY
            };
        }
        TimeDelta((self.0 as f64 / rhs).round() as i64)
    }
}

impl From<Duration> for TimeDelta {
    fn from(d: Duration) -> Self {
        TimeDelta(d.as_micros().min(i64::MAX as u128) as i64)
    }
}

/// An absolute point in time, microseconds since an arbitrary epoch
///
/// Timestamps are opaque: only differences between them are meaningful.
/// `MINUS_INFINITY` reads naturally as "never happened" and
/// `PLUS_INFINITY` as "not scheduled".
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The epoch itself
    pub const ZERO: Timestamp = Timestamp(0);
    /// Sentinel for a time that never arrives
    pub const PLUS_INFINITY: Timestamp = Timestamp(i64::MAX);
    /// Sentinel for a time that never happened
    pub const MINUS_INFINITY: Timestamp = Timestamp(i64::MIN);

    /// Create a timestamp from microseconds since the epoch
    #[inline]
    pub const fn from_micros(us: i64) -> Self {
        Timestamp(us)
    }

    /// Create a timestamp from milliseconds since the epoch
    #[inline]
    pub const fn from_millis(ms: i64) -> Self {
        Timestamp(ms.saturating_mul(MICROS_PER_MILLI))
    }

    /// Create a timestamp from whole seconds since the epoch
    #[inline]
    pub const fn from_seconds(seconds: i64) -> Self {
        Timestamp(seconds.saturating_mul(MICROS_PER_SECOND))
    }

    /// Microseconds since the epoch (sentinel values for infinities)
    #[inline]
    pub const fn us(self) -> i64 {
        self.0
    }

    /// Milliseconds since the epoch rounded to nearest; infinities saturate
    #[inline]
    pub fn ms(self) -> i64 {
        match self.0 {
            i64::MAX => i64::MAX,
            i64::MIN => i64::MIN,
            us => div_round(us, MICROS_PER_MILLI),
        }
    }

    /// Check whether this is either infinity sentinel
    #[inline]
    pub const fn is_infinite(self) -> bool {
        self.0 == i64::MAX || self.0 == i64::MIN
    }

    /// Check whether this is a finite point in time
    #[inline]
    pub const fn is_finite(self) -> bool {
        !self.is_infinite()
    }

    /// Check for the positive infinity sentinel
    #[inline]
    pub const fn is_plus_infinity(self) -> bool {
        self.0 == i64::MAX
    }

    /// Check for the negative infinity sentinel
    #[inline]
    pub const fn is_minus_infinity(self) -> bool {
        self.0 == i64::MIN
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            i64::MAX => write!(f, "+inf"),
            i64::MIN => write!(f, "-inf"),
            us => write!(f, "{} us", us),
        }
    }
}

impl Sub for Timestamp {
    type Output = TimeDelta;

    /// Elapsed time between two instants
    fn sub(self, rhs: Timestamp) -> TimeDelta {
        if self.is_plus_infinity() || rhs.is_minus_infinity() {
            debug_assert!(
                !self.is_minus_infinity() && !rhs.is_plus_infinity(),
                "subtracting infinity from itself"
            );
            TimeDelta::PLUS_INFINITY
        } else if self.is_minus_infinity() || rhs.is_plus_infinity() {
            TimeDelta::MINUS_INFINITY
        } else {
            TimeDelta::from_micros(self.0.saturating_sub(rhs.0))
        }
    }
}

impl Add<TimeDelta> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: TimeDelta) -> Timestamp {
        if self.is_plus_infinity() || rhs.is_plus_infinity() {
            debug_assert!(
                !self.is_minus_infinity() && !rhs.is_minus_infinity(),
                "adding opposite infinities"
            );
            Timestamp::PLUS_INFINITY
        } else if self.is_minus_infinity() || rhs.is_minus_infinity() {
            Timestamp::MINUS_INFINITY
        } else {
            Timestamp(self.0.saturating_add(rhs.us()))
        }
    }
}

impl AddAssign<TimeDelta> for Timestamp {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl Sub<TimeDelta> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: TimeDelta) -> Timestamp {
        if self.is_plus_infinity() || rhs.is_minus_infinity() {
            debug_assert!(
                !self.is_minus_infinity() && !rhs.is_plus_infinity(),
                "subtracting infinity from itself"
            );
            Timestamp::PLUS_INFINITY
        } else if self.is_minus_infinity() || rhs.is_plus_infinity() {
            Timestamp::MINUS_INFINITY
        } else {
            Timestamp(self.0.saturating_sub(rhs.us()))
        }
    }
}

impl SubAssign<TimeDelta> for Timestamp {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        *self = *self - rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction() {
        assert_eq!(TimeDelta::from_millis(3).us(), 3_000);
        assert_eq!(TimeDelta::from_seconds(2).ms(), 2_000);
        assert_eq!(Timestamp::from_millis(5).us(), 5_000);
        assert_eq!(Timestamp::from_seconds(1).ms(), 1_000);
    }

    #[test]
    fn test_ms_rounds_to_nearest() {
        assert_eq!(TimeDelta::from_micros(1_499).ms(), 1);
        assert_eq!(TimeDelta::from_micros(1_500).ms(), 2);
        assert_eq!(TimeDelta::from_micros(-1_499).ms(), -1);
        assert_eq!(TimeDelta::from_micros(-1_500).ms(), -2);
    }

    #[test]
    fn test_predicates() {
        assert!(TimeDelta::ZERO.is_zero());
        assert!(TimeDelta::ZERO.is_finite());
        assert!(TimeDelta::PLUS_INFINITY.is_infinite());
        assert!(TimeDelta::PLUS_INFINITY.is_plus_infinity());
        assert!(TimeDelta::MINUS_INFINITY.is_minus_infinity());
        assert!(!TimeDelta::from_millis(1).is_infinite());
    }

    #[test]
    fn test_ordering_with_sentinels() {
        assert!(TimeDelta::MINUS_INFINITY < TimeDelta::from_seconds(-100));
        assert!(TimeDelta::from_seconds(100) < TimeDelta::PLUS_INFINITY);
        assert!(Timestamp::MINUS_INFINITY < Timestamp::ZERO);
        assert!(Timestamp::ZERO < Timestamp::PLUS_INFINITY);
    }

    #[test]
    fn test_saturating_add() {
        let almost_max = TimeDelta::from_micros(i64::MAX - 5);
        let sum = almost_max + TimeDelta::from_micros(100);
        assert!(sum.is_plus_infinity());
    }

    #[test]
    fn test_infinity_absorbs() {
        let inf = TimeDelta::PLUS_INFINITY;
        assert!((inf + TimeDelta::from_seconds(-1_000)).is_plus_infinity());
        assert!((inf - TimeDelta::from_seconds(1_000)).is_plus_infinity());
        assert!((TimeDelta::MINUS_INFINITY + TimeDelta::from_seconds(1)).is_minus_infinity());
    }

    #[test]
    fn test_neg() {
        assert_eq!(-TimeDelta::from_millis(5), TimeDelta::from_millis(-5));
        assert!((-TimeDelta::PLUS_INFINITY).is_minus_infinity());
        assert!((-TimeDelta::MINUS_INFINITY).is_plus_infinity());
    }

    #[test]
    fn test_abs() {
        assert_eq!(TimeDelta::from_millis(-7).abs(), TimeDelta::from_millis(7));
        assert!(TimeDelta::MINUS_INFINITY.abs().is_plus_infinity());
    }

    #[test]
    fn test_scale() {
        assert_eq!(TimeDelta::from_millis(100) * 0.5, TimeDelta::from_millis(50));
        assert_eq!(TimeDelta::from_millis(100) / 4.0, TimeDelta::from_millis(25));
        assert!((TimeDelta::PLUS_INFINITY * 2.0).is_plus_infinity());
        assert!((TimeDelta::PLUS_INFINITY * -1.0).is_minus_infinity());
    }

    #[test]
    fn test_timestamp_difference() {
        let a = Timestamp::from_millis(100);
        let b = Timestamp::from_millis(250);
        assert_eq!(b - a, TimeDelta::from_millis(150));
        assert_eq!(a - b, TimeDelta::from_millis(-150));
        assert!((Timestamp::PLUS_INFINITY - a).is_plus_infinity());
        assert!((a - Timestamp::PLUS_INFINITY).is_minus_infinity());
    }

    #[test]
    fn test_timestamp_offset() {
        let t = Timestamp::from_millis(100);
        assert_eq!(t + TimeDelta::from_millis(50), Timestamp::from_millis(150));
        assert_eq!(t - TimeDelta::from_millis(50), Timestamp::from_millis(50));
        assert!((Timestamp::PLUS_INFINITY + TimeDelta::from_millis(1)).is_plus_infinity());
    }

    #[test]
    fn test_from_duration() {
        let d = Duration::from_millis(42);
        assert_eq!(TimeDelta::from(d), TimeDelta::from_millis(42));
    }

    #[test]
    fn test_display() {
        assert_eq!(TimeDelta::from_millis(25).to_string(), "25 ms");
        assert_eq!(TimeDelta::from_micros(1_500).to_string(), "1500 us");
        assert_eq!(TimeDelta::PLUS_INFINITY.to_string(), "+inf");
        assert_eq!(Timestamp::MINUS_INFINITY.to_string(), "-inf");
    }

    #[test]
    fn test_serde_round_trip() {
        let delta = TimeDelta::from_millis(125);
        let json = serde_json::to_string(&delta).unwrap();
        let back: TimeDelta = serde_json::from_str(&json).unwrap();
        assert_eq!(delta, back);
    }
}
