//! Bandwidth estimation primitives
//!
//! Estimators that turn per-packet timing and acknowledgment signals into
//! actionable numbers: a retransmission timeout, a robust max-RTT statistic,
//! a link capacity corridor and a queue build-up prediction. All of them are
//! synchronous, single-writer state machines fed with explicit timestamps,
//! so identical call sequences reproduce identical outputs.

pub mod bitrate;
pub mod link_capacity;
pub mod overuse;
pub mod rtt;

pub use bitrate::{BitrateEstimator, BitrateEstimatorConfig};
pub use link_capacity::LinkCapacityEstimator;
pub use overuse::{NetworkStateEstimate, OverusePredictor, OverusePredictorConfig, SentPacket};
pub use rtt::{RetransmissionTimeout, RtoConfig, RttFilter};
