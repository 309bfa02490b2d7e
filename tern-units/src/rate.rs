//! Bandwidth Unit Handling
//!
//! `DataRate` (bits per second) and `DataSize` (bytes) with an infinity
//! sentinel for "unlimited". The cross-unit operators encode the only three
//! conversions the transport ever needs: size over rate is a duration, size
//! over duration is a rate, and rate times duration is a size.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::time::TimeDelta;

/// Bits per kilobit
const BITS_PER_KILOBIT: u64 = 1_000;
/// Bits per byte
const BITS_PER_BYTE: u64 = 8;

/// Clamp a u128 intermediate back into the u64 domain
#[inline]
fn clamp_u64(value: u128) -> u64 {
    value.min(u64::MAX as u128) as u64
}

/// Round a non-negative float into the u64 domain
#[inline]
fn round_from_f64(value: f64) -> u64 {
    if value <= 0.0 {
        0
    } else if value >= u64::MAX as f64 {
        u64::MAX
    } else {
        value.round() as u64
    }
}

/// A transfer rate in bits per second
///
/// Rates are never negative. `INFINITY` stands for an unconstrained link and
/// absorbs arithmetic the same way the time sentinels do.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct DataRate(u64);

impl DataRate {
    /// The zero rate
    pub const ZERO: DataRate = DataRate(0);
    /// Sentinel for an unconstrained rate
    pub const INFINITY: DataRate = DataRate(u64::MAX);

    /// Create a rate from bits per second
    #[inline]
    pub const fn from_bps(bps: u64) -> Self {
        DataRate(bps)
    }

    /// Create a rate from kilobits per second, saturating at the sentinel
    #[inline]
    pub const fn from_kbps(kbps: u64) -> Self {
        DataRate(kbps.saturating_mul(BITS_PER_KILOBIT))
    }

    /// Create a rate from a float kilobits-per-second value, rounded to the
    /// nearest bit per second; negative and NaN inputs clamp to zero
    #[inline]
    pub fn from_kbps_f64(kbps: f64) -> Self {
        DataRate(round_from_f64(kbps * BITS_PER_KILOBIT as f64))
    }

    /// Create a rate from a float bits-per-second value, rounded to nearest;
    /// negative and NaN inputs clamp to zero
    #[inline]
    pub fn from_bps_f64(bps: f64) -> Self {
        DataRate(round_from_f64(bps))
    }

    /// Bits per second (the sentinel value for infinity)
    #[inline]
    pub const fn bps(self) -> u64 {
        self.0
    }

    /// Kilobits per second rounded to nearest; infinity saturates
    #[inline]
    pub fn kbps(self) -> u64 {
        match self.0 {
            u64::MAX => u64::MAX,
            bps => (bps + BITS_PER_KILOBIT / 2) / BITS_PER_KILOBIT,
        }
    }

    /// Bits per second as a float; infinity maps to `f64::INFINITY`
    #[inline]
    pub fn bps_f64(self) -> f64 {
        match self.0 {
            u64::MAX => f64::INFINITY,
            bps => bps as f64,
        }
    }

    /// Kilobits per second as a float; infinity maps to `f64::INFINITY`
    #[inline]
    pub fn kbps_f64(self) -> f64 {
        self.bps_f64() / BITS_PER_KILOBIT as f64
    }

    /// Check for the zero rate
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Check for the infinity sentinel
    #[inline]
    pub const fn is_infinite(self) -> bool {
        self.0 == u64::MAX
    }

    /// Check for a finite rate
    #[inline]
    pub const fn is_finite(self) -> bool {
        !self.is_infinite()
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            u64::MAX => write!(f, "inf"),
            bps if bps % BITS_PER_KILOBIT == 0 => write!(f, "{} kbps", bps / BITS_PER_KILOBIT),
            bps => write!(f, "{} bps", bps),
        }
    }
}

impl Add for DataRate {
    type Output = DataRate;

    fn add(self, rhs: DataRate) -> DataRate {
        if self.is_infinite() || rhs.is_infinite() {
            DataRate::INFINITY
        } else {
            DataRate(self.0.saturating_add(rhs.0))
        }
    }
}

impl AddAssign for DataRate {
    fn add_assign(&mut self, rhs: DataRate) {
        *self = *self + rhs;
    }
}

impl Sub for DataRate {
    type Output = DataRate;

    /// Difference of two rates; clamps at zero rather than going negative
    fn sub(self, rhs: DataRate) -> DataRate {
        if self.is_infinite() {
            debug_assert!(!rhs.is_infinite(), "subtracting infinity from itself");
            DataRate::INFINITY
        } else {
            DataRate(self.0.saturating_sub(rhs.0))
        }
    }
}

impl SubAssign for DataRate {
    fn sub_assign(&mut self, rhs: DataRate) {
        *self = *self - rhs;
    }
}

impl Mul<f64> for DataRate {
    type Output = DataRate;

    fn mul(self, rhs: f64) -> DataRate {
        if self.is_infinite() {
            DataRate::INFINITY
        } else {
            DataRate(round_from_f64(self.0 as f64 * rhs))
        }
    }
}

/// A quantity of data in bytes
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct DataSize(u64);

impl DataSize {
    /// The empty size
    pub const ZERO: DataSize = DataSize(0);
    /// Sentinel for an unbounded size
    pub const INFINITY: DataSize = DataSize(u64::MAX);

    /// Create a size from a byte count
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        DataSize(bytes)
    }

    /// Byte count (the sentinel value for infinity)
    #[inline]
    pub const fn bytes(self) -> u64 {
        self.0
    }

    /// Kilobytes rounded to nearest; infinity saturates
    #[inline]
    pub fn kilobytes(self) -> u64 {
        match self.0 {
            u64::MAX => u64::MAX,
            bytes => (bytes + 500) / 1_000,
        }
    }

    /// Check for the empty size
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Check for the infinity sentinel
    #[inline]
    pub const fn is_infinite(self) -> bool {
        self.0 == u64::MAX
    }

    /// Check for a finite size
    #[inline]
    pub const fn is_finite(self) -> bool {
        !self.is_infinite()
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            u64::MAX => write!(f, "inf"),
            bytes => write!(f, "{} bytes", bytes),
        }
    }
}

impl Add for DataSize {
    type Output = DataSize;

    fn add(self, rhs: DataSize) -> DataSize {
        if self.is_infinite() || rhs.is_infinite() {
            DataSize::INFINITY
        } else {
            DataSize(self.0.saturating_add(rhs.0))
        }
    }
}

impl AddAssign for DataSize {
    fn add_assign(&mut self, rhs: DataSize) {
        *self = *self + rhs;
    }
}

impl Sub for DataSize {
    type Output = DataSize;

    /// Difference of two sizes; clamps at zero rather than going negative
    fn sub(self, rhs: DataSize) -> DataSize {
        if self.is_infinite() {
            debug_assert!(!rhs.is_infinite(), "subtracting infinity from itself");
            DataSize::INFINITY
        } else {
            DataSize(self.0.saturating_sub(rhs.0))
        }
    }
}

impl SubAssign for DataSize {
    fn sub_assign(&mut self, rhs: DataSize) {
        *self = *self - rhs;
    }
}

impl Div<DataRate> for DataSize {
    type Output = TimeDelta;

    /// Transmission time of this much data at the given rate
    ///
    /// A zero rate yields `TimeDelta::PLUS_INFINITY` rather than panicking:
    /// data over a dead link takes forever.
    fn div(self, rate: DataRate) -> TimeDelta {
        if rate.is_zero() || self.is_infinite() {
            TimeDelta::PLUS_INFINITY
        } else if rate.is_infinite() {
            TimeDelta::ZERO
        } else {
            let micros = self.0 as u128 * BITS_PER_BYTE as u128 * 1_000_000 / rate.0 as u128;
            TimeDelta::from_micros(micros.min(i64::MAX as u128) as i64)
        }
    }
}

impl Div<TimeDelta> for DataSize {
    type Output = DataRate;

    /// Average rate when this much data is moved over the given duration
    ///
    /// A zero duration yields `DataRate::INFINITY`. The duration must not be
    /// negative.
    fn div(self, duration: TimeDelta) -> DataRate {
        debug_assert!(duration >= TimeDelta::ZERO, "dividing by negative duration");
        if duration <= TimeDelta::ZERO || self.is_infinite() {
            DataRate::INFINITY
        } else if duration.is_plus_infinity() {
            DataRate::ZERO
        } else {
            let bps = self.0 as u128 * BITS_PER_BYTE as u128 * 1_000_000 / duration.us() as u128;
            DataRate::from_bps(clamp_u64(bps))
        }
    }
}

impl Mul<TimeDelta> for DataRate {
    type Output = DataSize;

    /// Amount of data moved at this rate over the given duration
    fn mul(self, duration: TimeDelta) -> DataSize {
        debug_assert!(duration >= TimeDelta::ZERO, "scaling by negative duration");
        if duration <= TimeDelta::ZERO || self.is_zero() {
            DataSize::ZERO
        } else if self.is_infinite() || duration.is_plus_infinity() {
            DataSize::INFINITY
        } else {
            let bytes =
                self.0 as u128 * duration.us() as u128 / (BITS_PER_BYTE as u128 * 1_000_000);
            DataSize::from_bytes(clamp_u64(bytes))
        }
    }
}

impl Mul<DataRate> for TimeDelta {
    type Output = DataSize;

    fn mul(self, rate: DataRate) -> DataSize {
        rate * self
    }
}
