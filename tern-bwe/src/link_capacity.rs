//! Link Capacity Estimation
//!
//! Exponentially smoothed estimate of the rate a congested link can actually
//! sustain, fed with the acknowledged throughput measured whenever overuse is
//! detected. The estimate comes with a normalized deviation, so callers can
//! bound bitrate probes to a corridor instead of a single number.

use tern_units::DataRate;

/// EWMA smoothing factor for both the estimate and its deviation
const ALPHA: f64 = 0.05;
/// Clamp range for the normalized deviation
///
/// 0.4 is roughly 14 kbit/s of standard deviation at 500 kbit/s, 2.5 is
/// roughly 35 kbit/s.
const DEVIATION_MIN: f64 = 0.4;
const DEVIATION_MAX: f64 = 2.5;

/// Smoothed link capacity with a confidence corridor
///
/// The estimate is absent until the first observation; before that the
/// bounds are the widest possible interval. Given an identical sequence of
/// observations the outputs are bit-reproducible: there is no hidden clock
/// or randomness.
#[derive(Debug, Clone)]
pub struct LinkCapacityEstimator {
    estimate_kbps: Option<f64>,
    deviation_kbps: f64,
}

impl LinkCapacityEstimator {
    pub fn new() -> Self {
        LinkCapacityEstimator {
            estimate_kbps: None,
            deviation_kbps: 0.4,
        }
    }

    /// Fold the acknowledged rate at the moment of detected overuse into the
    /// estimate
    pub fn on_overuse_detected(&mut self, acknowledged_rate: DataRate) {
        let ack_rate_kbps = acknowledged_rate.kbps() as f64;
        let estimate = match self.estimate_kbps {
            None => ack_rate_kbps,
            Some(previous) => (1.0 - ALPHA) * previous + ALPHA * ack_rate_kbps,
        };
        self.estimate_kbps = Some(estimate);

        // Track the variance of the estimate, normalized by the estimate
        // itself so the clamp range works across orders of magnitude.
        let norm = estimate.max(1.0);
        let error_kbps = estimate - ack_rate_kbps;
        self.deviation_kbps =
            (1.0 - ALPHA) * self.deviation_kbps + ALPHA * error_kbps * error_kbps / norm;
        self.deviation_kbps = self.deviation_kbps.clamp(DEVIATION_MIN, DEVIATION_MAX);
    }

    /// Largest rate the link plausibly sustains; `INFINITY` before the first
    /// observation
    pub fn upper_bound(&self) -> DataRate {
        match self.estimate_kbps {
            Some(estimate) => {
                DataRate::from_kbps_f64(estimate + 3.0 * self.deviation_estimate_kbps(estimate))
            }
            None => DataRate::INFINITY,
        }
    }

    /// Smallest rate consistent with the observations; `ZERO` before the
    /// first observation (and clamped at zero, rates are never negative)
    pub fn lower_bound(&self) -> DataRate {
        match self.estimate_kbps {
            Some(estimate) => {
                DataRate::from_kbps_f64(estimate - 3.0 * self.deviation_estimate_kbps(estimate))
            }
            None => DataRate::ZERO,
        }
    }

    /// Forget the estimate, as after a detected path change
    pub fn reset(&mut self) {
        self.estimate_kbps = None;
    }

    /// Whether any rate has been observed yet
    #[inline]
    pub fn has_estimate(&self) -> bool {
        self.estimate_kbps.is_some()
    }

    /// Current capacity estimate, absent until the first observation
    #[inline]
    pub fn estimate(&self) -> Option<DataRate> {
        self.estimate_kbps.map(DataRate::from_kbps_f64)
    }

    /// Standard deviation in kbps implied by the normalized variance at the
    /// current estimate
    fn deviation_estimate_kbps(&self, estimate_kbps: f64) -> f64 {
        (self.deviation_kbps * estimate_kbps).sqrt()
    }
}

impl Default for LinkCapacityEstimator {
    fn default() -> Self {
        LinkCapacityEstimator::new()
    }
}
