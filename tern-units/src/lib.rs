//! Strongly typed time and bandwidth units
//!
//! Transport math is full of unit errors waiting to happen: milliseconds
//! multiplied by kilobits, byte counts divided by the wrong power of ten.
//! This crate wraps every quantity the transport stack passes around in a
//! dedicated newtype with microsecond / bit / byte base resolution, explicit
//! infinity sentinels and saturating arithmetic.

pub mod rate;
pub mod time;

pub use rate::{DataRate, DataSize};
pub use time::{TimeDelta, Timestamp};
