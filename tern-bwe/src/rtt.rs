//! Round-Trip Time Estimation
//!
//! Two complementary RTT consumers. `RetransmissionTimeout` keeps the
//! RFC 4960 smoothed RTT / variance pair and derives the timeout used to
//! schedule retransmissions. `RttFilter` tracks a max-RTT statistic that
//! survives measurement noise but follows genuine route changes, via jump
//! and drift detection over short sample windows.

use serde::{Deserialize, Serialize};
use tern_units::TimeDelta;

/// RFC 4960 section 15 smoothing constants
const RTO_ALPHA: f64 = 0.125;
const RTO_BETA: f64 = 0.25;

/// Retransmission timeout bounds and initial value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtoConfig {
    /// Timeout used before the first RTT measurement lands
    pub initial_rto: TimeDelta,
    /// Lower clamp for the computed timeout
    pub min_rto: TimeDelta,
    /// Upper clamp for the computed timeout; doubles as the plausibility
    /// bound for incoming measurements
    pub max_rto: TimeDelta,
}

impl Default for RtoConfig {
    fn default() -> Self {
        RtoConfig {
            initial_rto: TimeDelta::from_millis(500),
            min_rto: TimeDelta::from_millis(200),
            max_rto: TimeDelta::from_millis(3_000),
        }
    }
}

/// Retransmission timeout estimator (RFC 4960 section 6.3.1)
///
/// All arithmetic is done in the floating point domain to keep precision
/// across many small updates.
#[derive(Debug, Clone)]
pub struct RetransmissionTimeout {
    min_rto: f64,
    max_rto: f64,
    srtt: f64,
    rttvar: f64,
    rto: f64,
    first_measurement: bool,
}

impl RetransmissionTimeout {
    /// Create an estimator reporting `config.initial_rto` until the first
    /// measurement arrives
    pub fn new(config: RtoConfig) -> Self {
        RetransmissionTimeout {
            min_rto: config.min_rto.us() as f64,
            max_rto: config.max_rto.us() as f64,
            srtt: 0.0,
            rttvar: 0.0,
            rto: config.initial_rto.us() as f64,
            first_measurement: true,
        }
    }

    /// Fold one RTT measurement into the estimator
    ///
    /// Samples outside `[0, max_rto]` cannot be genuine round trips (clock
    /// steps, corrupted timestamps) and are skipped without touching any
    /// state.
    pub fn observe_rtt(&mut self, measured_rtt: TimeDelta) {
        let rtt = measured_rtt.us() as f64;
        if rtt < 0.0 || rtt > self.max_rto {
            tracing::debug!("ignoring implausible RTT sample {}", measured_rtt);
            return;
        }

        if self.first_measurement {
            self.srtt = rtt;
            self.rttvar = rtt * 0.5;
            self.rto = self.srtt + 4.0 * self.rttvar;
            self.first_measurement = false;
        } else {
            let diff = (rtt - self.srtt).abs();
            self.rttvar = (1.0 - RTO_BETA) * self.rttvar + RTO_BETA * diff;
            self.srtt = (1.0 - RTO_ALPHA) * self.srtt + RTO_ALPHA * rtt;
            self.rto = self.srtt + 4.0 * self.rttvar;
        }

        self.rto = self.rto.clamp(self.min_rto, self.max_rto);
    }

    /// Current retransmission timeout, always within `[min_rto, max_rto]`
    /// once a measurement has been observed
    #[inline]
    pub fn rto(&self) -> TimeDelta {
        TimeDelta::from_micros(self.rto.round() as i64)
    }

    /// Smoothed round-trip time
    #[inline]
    pub fn srtt(&self) -> TimeDelta {
        TimeDelta::from_micros(self.srtt.round() as i64)
    }

    /// Round-trip time variance
    #[inline]
    pub fn rttvar(&self) -> TimeDelta {
        TimeDelta::from_micros(self.rttvar.round() as i64)
    }
}

/// Samples above this are clipped to it before filtering
const MAX_RTT: TimeDelta = TimeDelta::from_seconds(3);
/// Largest n used for the (n-1)/n filter gain
const MAX_FILTER_FACTOR_COUNT: u32 = 35;
/// A sample this many standard deviations from the average counts as a jump
const JUMP_STD_DEVS: f64 = 2.5;
/// Drift triggers once max exceeds avg by this many standard deviations
const DRIFT_STD_DEVS: f64 = 3.5;
/// Consecutive deviating samples needed before a detector acts
const DETECT_THRESHOLD: usize = 5;

/// Max-RTT filter with jump and drift detection
///
/// Reports the largest round-trip time seen, which is what retransmission
/// and jitter-buffer sizing care about. A single outlier never lowers the
/// statistic; only five consecutive same-direction outliers (a jump) or a
/// sustained gap between maximum and average (drift) replace the statistics
/// with ones computed over just the recent samples.
#[derive(Debug, Clone)]
pub struct RttFilter {
    got_non_zero_update: bool,
    avg_rtt: TimeDelta,
    var_rtt: f64,
    max_rtt: TimeDelta,
    filt_fact_count: u32,
    jump_buf: Vec<TimeDelta>,
    drift_buf: Vec<TimeDelta>,
    last_jump_positive: bool,
}

impl RttFilter {
    pub fn new() -> Self {
        RttFilter {
            got_non_zero_update: false,
            avg_rtt: TimeDelta::ZERO,
            var_rtt: 0.0,
            max_rtt: TimeDelta::ZERO,
            filt_fact_count: 1,
            jump_buf: Vec::with_capacity(DETECT_THRESHOLD),
            drift_buf: Vec::with_capacity(DETECT_THRESHOLD),
            last_jump_positive: false,
        }
    }

    /// Drop all history, as after a transport restart
    pub fn reset(&mut self) {
        *self = RttFilter::new();
    }

    /// Fold one RTT sample into the filter
    ///
    /// Zero samples are ignored until the first real measurement arrives;
    /// samples above the sanity cap are clipped to it.
    pub fn update(&mut self, rtt: TimeDelta) {
        if !self.got_non_zero_update {
            if rtt.is_zero() {
                return;
            }
            self.got_non_zero_update = true;
        }

        let rtt = rtt.min(MAX_RTT);

        let mut filt_factor = 0.0;
        if self.filt_fact_count > 1 {
            filt_factor = (self.filt_fact_count - 1) as f64 / self.filt_fact_count as f64;
        }
        self.filt_fact_count += 1;
        if self.filt_fact_count > MAX_FILTER_FACTOR_COUNT {
            // Keeps the gain from exceeding (n-1)/n.
            self.filt_fact_count = MAX_FILTER_FACTOR_COUNT;
        }

        let old_avg = self.avg_rtt;
        let old_var = self.var_rtt;
        self.avg_rtt = self.avg_rtt * filt_factor + rtt * (1.0 - filt_factor);
        let delta_ms = (rtt - self.avg_rtt).ms() as f64;
        self.var_rtt = filt_factor * self.var_rtt + (1.0 - filt_factor) * delta_ms * delta_ms;
        self.max_rtt = self.max_rtt.max(rtt);

        // While a detector is still accumulating evidence the average and
        // variance are rolled back, so outliers do not poison the baseline
        // they are being measured against.
        if !self.jump_detection(rtt) || !self.drift_detection(rtt) {
            self.avg_rtt = old_avg;
            self.var_rtt = old_var;
        }
    }

    /// Current max-RTT statistic
    #[inline]
    pub fn rtt(&self) -> TimeDelta {
        self.max_rtt
    }

    fn jump_detection(&mut self, rtt: TimeDelta) -> bool {
        let diff_from_avg = self.avg_rtt - rtt;
        // var_rtt is in ms^2.
        let jump_threshold = millis_f64(JUMP_STD_DEVS * self.var_rtt.sqrt());
        if diff_from_avg.abs() > jump_threshold {
            let positive_diff = diff_from_avg >= TimeDelta::ZERO;
            if !self.jump_buf.is_empty() && positive_diff != self.last_jump_positive {
                // The buffered samples jumped the other way; they say nothing
                // about a jump in this direction.
                self.jump_buf.clear();
            }
            if self.jump_buf.len() < DETECT_THRESHOLD {
                self.jump_buf.push(rtt);
                self.last_jump_positive = positive_diff;
            }
            if self.jump_buf.len() >= DETECT_THRESHOLD {
                // Confirmed route change: restart from the recent samples.
                let buf = std::mem::take(&mut self.jump_buf);
                self.short_rtt_filter(&buf);
                self.filt_fact_count = DETECT_THRESHOLD as u32 + 1;
                tracing::debug!("RTT jump detected, filter restarted at {}", self.max_rtt);
            } else {
                return false;
            }
        } else {
            self.jump_buf.clear();
        }
        true
    }

    fn drift_detection(&mut self, rtt: TimeDelta) -> bool {
        let drift_threshold = millis_f64(DRIFT_STD_DEVS * self.var_rtt.sqrt());
        if self.max_rtt - self.avg_rtt > drift_threshold {
            if self.drift_buf.len() < DETECT_THRESHOLD {
                self.drift_buf.push(rtt);
            }
            if self.drift_buf.len() >= DETECT_THRESHOLD {
                let buf = std::mem::take(&mut self.drift_buf);
                self.short_rtt_filter(&buf);
                tracing::debug!("RTT drift detected, filter restarted at {}", self.max_rtt);
            }
        } else {
            self.drift_buf.clear();
        }
        true
    }

    /// Replace max and average with statistics over a short sample buffer
    fn short_rtt_filter(&mut self, buf: &[TimeDelta]) {
        debug_assert!(!buf.is_empty());
        self.max_rtt = TimeDelta::ZERO;
        let mut sum = TimeDelta::ZERO;
        for &rtt in buf {
            if rtt > self.max_rtt {
                self.max_rtt = rtt;
            }
            sum += rtt;
        }
        self.avg_rtt = sum / buf.len() as f64;
    }
}

impl Default for RttFilter {
    fn default() -> Self {
        RttFilter::new()
    }
}

/// Millisecond float to TimeDelta, rounded to the nearest microsecond
fn millis_f64(ms: f64) -> TimeDelta {
    TimeDelta::from_micros((ms * 1_000.0).round() as i64)
}
