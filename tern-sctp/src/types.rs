//! Transport-level identifier newtypes
//!
//! TSNs use serial-number arithmetic (RFC 1982) so cumulative-ack comparisons
//! stay correct across the u32 wrap; `TsnUnwrapper` lifts them into a
//! monotone u64 domain for map keys and range scans.

use std::fmt;
use std::ops::{Add, Sub};

/// Transmission sequence number, one per DATA chunk
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tsn(u32);

impl Tsn {
    /// Create a new TSN
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Tsn(raw)
    }

    /// Get the raw wire value
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Next TSN, wrapping
    #[inline]
    pub fn next(self) -> Self {
        Tsn(self.0.wrapping_add(1))
    }

    /// Advance to the next TSN in place
    #[inline]
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Forward distance from `self` to `other`, wrapping
    #[inline]
    pub fn distance_to(self, other: Tsn) -> u32 {
        other.0.wrapping_sub(self.0)
    }

    /// Serial-number less-than
    #[inline]
    pub fn lt(self, other: Tsn) -> bool {
        self != other && self.distance_to(other) < 0x8000_0000
    }

    /// Serial-number less-than-or-equal
    #[inline]
    pub fn le(self, other: Tsn) -> bool {
        self == other || self.lt(other)
    }

    /// Serial-number greater-than
    #[inline]
    pub fn gt(self, other: Tsn) -> bool {
        other.lt(self)
    }

    /// Serial-number greater-than-or-equal
    #[inline]
    pub fn ge(self, other: Tsn) -> bool {
        other.le(self)
    }
}

impl Add<u32> for Tsn {
    type Output = Tsn;

    fn add(self, rhs: u32) -> Tsn {
        Tsn(self.0.wrapping_add(rhs))
    }
}

impl Sub<u32> for Tsn {
    type Output = Tsn;

    fn sub(self, rhs: u32) -> Tsn {
        Tsn(self.0.wrapping_sub(rhs))
    }
}

impl fmt::Debug for Tsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tsn({})", self.0)
    }
}

impl fmt::Display for Tsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Offset that keeps the first unwrapped value away from zero, so values just
/// behind it do not underflow
const UNWRAP_BASE: u64 = 1 << 32;

/// Maps wrapped TSNs onto a monotone u64 timeline
///
/// The unwrapped value closest to the previously seen one is chosen, so the
/// output tracks reordering within half the sequence space in either
/// direction.
#[derive(Debug, Clone, Default)]
pub struct TsnUnwrapper {
    last: Option<u64>,
}

impl TsnUnwrapper {
    pub fn new() -> Self {
        TsnUnwrapper { last: None }
    }

    /// Unwrap `tsn` and remember the result as the new reference point
    pub fn unwrap_tsn(&mut self, tsn: Tsn) -> u64 {
        let unwrapped = self.peek_unwrap(tsn);
        match self.last {
            Some(last) if unwrapped <= last => {}
            _ => self.last = Some(unwrapped),
        }
        unwrapped
    }

    /// Unwrap `tsn` without moving the reference point
    pub fn peek_unwrap(&self, tsn: Tsn) -> u64 {
        match self.last {
            None => UNWRAP_BASE + u64::from(tsn.as_raw()),
            Some(last) => unwrap_near(last, tsn),
        }
    }
}

/// Unwrapped value of `tsn` closest to `base`
pub(crate) fn unwrap_near(base: u64, tsn: Tsn) -> u64 {
    let cropped = base as u32;
    let forward = tsn.as_raw().wrapping_sub(cropped);
    if forward < 0x8000_0000 {
        base + u64::from(forward)
    } else {
        let backward = cropped.wrapping_sub(tsn.as_raw());
        base.saturating_sub(u64::from(backward))
    }
}

/// Wrap an unwrapped TSN back onto the wire domain
#[inline]
pub(crate) fn wrap_tsn(unwrapped: u64) -> Tsn {
    Tsn::new(unwrapped as u32)
}

/// Stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u16);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-stream sequence number for ordered delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ssn(pub u16);

impl Ssn {
    /// Next SSN, wrapping
    #[inline]
    pub fn next(self) -> Self {
        Ssn(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Ssn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque payload protocol identifier, passed through end to end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadProtocolId(pub u32);

impl fmt::Display for PayloadProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsn_basic_ops() {
        let tsn = Tsn::new(100);
        assert_eq!(tsn.as_raw(), 100);
        assert_eq!(tsn.next(), Tsn::new(101));

        let mut tsn = Tsn::new(u32::MAX);
        tsn.increment();
        assert_eq!(tsn, Tsn::new(0));
    }

    #[test]
    fn test_tsn_distance() {
        assert_eq!(Tsn::new(10).distance_to(Tsn::new(15)), 5);
        assert_eq!(Tsn::new(u32::MAX).distance_to(Tsn::new(2)), 3);
    }

    #[test]
    fn test_tsn_serial_ordering() {
        assert!(Tsn::new(10).lt(Tsn::new(11)));
        assert!(Tsn::new(u32::MAX).lt(Tsn::new(0)));
        assert!(Tsn::new(0).gt(Tsn::new(u32::MAX)));
        assert!(Tsn::new(5).le(Tsn::new(5)));
        assert!(Tsn::new(5).ge(Tsn::new(5)));
        assert!(!Tsn::new(5).lt(Tsn::new(5)));
    }

    #[test]
    fn test_tsn_add_sub() {
        assert_eq!(Tsn::new(10) + 5, Tsn::new(15));
        assert_eq!(Tsn::new(2) - 5, Tsn::new(u32::MAX - 2));
    }

    #[test]
    fn test_unwrapper_monotone_across_wrap() {
        let mut unwrapper = TsnUnwrapper::new();
        let near_wrap = unwrapper.unwrap_tsn(Tsn::new(u32::MAX - 1));
        let at_wrap = unwrapper.unwrap_tsn(Tsn::new(u32::MAX));
        let wrapped = unwrapper.unwrap_tsn(Tsn::new(0));
        assert_eq!(at_wrap, near_wrap + 1);
        assert_eq!(wrapped, at_wrap + 1);
    }

    #[test]
    fn test_unwrapper_tracks_reordering() {
        let mut unwrapper = TsnUnwrapper::new();
        let base = unwrapper.unwrap_tsn(Tsn::new(100));
        // An older TSN unwraps below the reference point without moving it.
        assert_eq!(unwrapper.unwrap_tsn(Tsn::new(98)), base - 2);
        assert_eq!(unwrapper.unwrap_tsn(Tsn::new(101)), base + 1);
    }

    #[test]
    fn test_unwrap_round_trip() {
        let mut unwrapper = TsnUnwrapper::new();
        for raw in [0u32, 1, 5000, u32::MAX] {
            let unwrapped = unwrapper.unwrap_tsn(Tsn::new(raw));
            assert_eq!(wrap_tsn(unwrapped), Tsn::new(raw));
        }
    }

    #[test]
    fn test_ssn_wraps() {
        assert_eq!(Ssn(u16::MAX).next(), Ssn(0));
        assert_eq!(Ssn(7).next(), Ssn(8));
    }
}
