//! Acknowledged Bitrate Estimation
//!
//! Accumulates acknowledged bytes over a short sliding window and blends the
//! per-window rate samples into a Bayesian estimate. Samples far from the
//! current estimate carry more uncertainty and therefore less weight, which
//! keeps a single burst or stall from yanking the estimate around. The output
//! feeds [`crate::LinkCapacityEstimator`] on overuse.

use serde::{Deserialize, Serialize};
use tern_units::{DataRate, DataSize, TimeDelta, Timestamp};

const MIN_RATE_WINDOW_MS: i64 = 150;
const MAX_RATE_WINDOW_MS: i64 = 1_000;

/// Variance added to the estimate on every update, modelling that the real
/// rate drifts over time
const PROCESS_NOISE_KBPS2: f64 = 5.0;

const INITIAL_ESTIMATE_VAR: f64 = 50.0;

/// Tuning knobs for [`BitrateEstimator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitrateEstimatorConfig {
    /// Window used until the first sample seeds the estimate; longer so the
    /// seed is stable
    pub initial_window: TimeDelta,
    /// Window used once the estimate exists
    pub window: TimeDelta,
    /// Scale applied to a sample's distance from the estimate when computing
    /// its uncertainty
    pub uncertainty_scale: f64,
    /// Raising this towards the typical rate makes increases and decreases
    /// weigh symmetrically; at zero, increases are distrusted more
    pub uncertainty_symmetry_cap: DataRate,
    /// The blended estimate never drops below this
    pub estimate_floor: DataRate,
}

impl Default for BitrateEstimatorConfig {
    fn default() -> Self {
        BitrateEstimatorConfig {
            initial_window: TimeDelta::from_millis(500),
            window: TimeDelta::from_millis(150),
            uncertainty_scale: 10.0,
            uncertainty_symmetry_cap: DataRate::ZERO,
            estimate_floor: DataRate::ZERO,
        }
    }
}

/// Windowed acknowledged-rate estimator
#[derive(Debug, Clone)]
pub struct BitrateEstimator {
    initial_window_ms: i64,
    window_ms: i64,
    uncertainty_scale: f64,
    uncertainty_symmetry_cap: DataRate,
    estimate_floor: DataRate,
    sum_bytes: u64,
    current_window_ms: i64,
    prev_time_ms: Option<i64>,
    estimate_kbps: Option<f64>,
    estimate_var: f64,
}

impl BitrateEstimator {
    /// Window lengths outside [150 ms, 1000 ms] are clamped
    pub fn new(config: BitrateEstimatorConfig) -> Self {
        BitrateEstimator {
            initial_window_ms: config
                .initial_window
                .ms()
                .clamp(MIN_RATE_WINDOW_MS, MAX_RATE_WINDOW_MS),
            window_ms: config.window.ms().clamp(MIN_RATE_WINDOW_MS, MAX_RATE_WINDOW_MS),
            uncertainty_scale: config.uncertainty_scale,
            uncertainty_symmetry_cap: config.uncertainty_symmetry_cap,
            estimate_floor: config.estimate_floor,
            sum_bytes: 0,
            current_window_ms: 0,
            prev_time_ms: None,
            estimate_kbps: None,
            estimate_var: INITIAL_ESTIMATE_VAR,
        }
    }

    /// Record `size` acknowledged bytes at `at_time`
    pub fn update(&mut self, at_time: Timestamp, size: DataSize) {
        let rate_window_ms = if self.estimate_kbps.is_none() {
            self.initial_window_ms
        } else {
            self.window_ms
        };
        let sample_kbps = match self.update_window(at_time.ms(), size.bytes(), rate_window_ms) {
            Some(sample) => sample,
            None => return,
        };
        let estimate_kbps = match self.estimate_kbps {
            Some(estimate) => estimate,
            None => {
                // The very first completed window seeds the estimate.
                self.estimate_kbps = Some(sample_kbps);
                return;
            }
        };
        let sample_uncertainty = self.uncertainty_scale * (estimate_kbps - sample_kbps).abs()
            / (estimate_kbps + sample_kbps.min(self.uncertainty_symmetry_cap.kbps_f64()));
        let sample_var = sample_uncertainty * sample_uncertainty;
        let pred_estimate_var = self.estimate_var + PROCESS_NOISE_KBPS2;
        let blended = (sample_var * estimate_kbps + pred_estimate_var * sample_kbps)
            / (sample_var + pred_estimate_var);
        let floored = blended.max(self.estimate_floor.kbps_f64());
        self.estimate_kbps = Some(floored);
        self.estimate_var = sample_var * pred_estimate_var / (sample_var + pred_estimate_var);
        tracing::trace!("acknowledged bitrate {:.1} kbps", floored);
    }

    /// Advance the window to `now_ms`, returning a rate sample if one
    /// completed
    fn update_window(&mut self, now_ms: i64, bytes: u64, rate_window_ms: i64) -> Option<f64> {
        if let Some(prev_ms) = self.prev_time_ms {
            // Time moving backwards invalidates the accumulator.
            if now_ms < prev_ms {
                self.prev_time_ms = None;
                self.sum_bytes = 0;
                self.current_window_ms = 0;
            }
        }
        if let Some(prev_ms) = self.prev_time_ms {
            self.current_window_ms += now_ms - prev_ms;
            // A silent gap longer than the window means the sum no longer
            // describes it.
            if now_ms - prev_ms > rate_window_ms {
                self.sum_bytes = 0;
                self.current_window_ms %= rate_window_ms;
            }
        }
        self.prev_time_ms = Some(now_ms);
        let mut sample_kbps = None;
        if self.current_window_ms >= rate_window_ms {
            sample_kbps = Some(8.0 * self.sum_bytes as f64 / rate_window_ms as f64);
            self.current_window_ms -= rate_window_ms;
            self.sum_bytes = 0;
        }
        self.sum_bytes += bytes;
        sample_kbps
    }

    /// Current estimate, `None` until the first window completes
    pub fn bitrate(&self) -> Option<DataRate> {
        self.estimate_kbps.map(DataRate::from_kbps_f64)
    }

    /// Rate implied by the incomplete window, `None` when it is empty
    pub fn peek_rate(&self) -> Option<DataRate> {
        if self.current_window_ms > 0 {
            let window = TimeDelta::from_millis(self.current_window_ms);
            Some(DataSize::from_bytes(self.sum_bytes) / window)
        } else {
            None
        }
    }

    /// Let the next few samples move the estimate quickly, e.g. after a
    /// route change
    pub fn expect_fast_rate_change(&mut self) {
        self.estimate_var += 200.0;
    }
}

impl Default for BitrateEstimator {
    fn default() -> Self {
        BitrateEstimator::new(BitrateEstimatorConfig::default())
    }
}
