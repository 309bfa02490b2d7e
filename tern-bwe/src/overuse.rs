//! Overuse Prediction
//!
//! Predicts queue build-up before it shows up in delay measurements, by
//! replaying the packets already handed to the network through a fluid-queue
//! model of the bottleneck link. Guarded by a config switch and off by
//! default; when disabled every entry point degrades to a no-op.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tern_units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Upper bound on the sent-packet FIFO; the oldest entry is evicted beyond
/// this, the sender is never stalled
const MAX_PENDING_PACKETS: usize = 100;

/// One transmitted packet, as reported by the pacer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentPacket {
    pub send_time: Timestamp,
    pub size: DataSize,
}

/// Link model produced by a network state estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkStateEstimate {
    pub link_capacity: DataRate,
    pub link_capacity_std_dev: DataRate,
    /// Share of the link consumed by traffic that is not ours, in [0, 1]
    pub cross_traffic_ratio: f64,
    pub propagation_delay: TimeDelta,
    /// Queueing delay already present when the estimate was formed
    pub pre_link_buffer_delay: TimeDelta,
    /// Send time of the last packet the estimator saw
    pub last_send_time: Timestamp,
}

/// Tuning knobs for `OverusePredictor`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverusePredictorConfig {
    /// Master switch, off by default
    pub enabled: bool,
    /// Estimates whose std-dev to capacity ratio exceeds this are too noisy
    /// to act on
    pub capacity_dev_ratio_threshold: f64,
    /// How many standard deviations of capacity to assume available; negative
    /// values bet conservatively below the mean
    pub capacity_deviation: f64,
    /// Projected queueing delay beyond which overuse is declared
    pub delay_threshold: TimeDelta,
}

impl Default for OverusePredictorConfig {
    fn default() -> Self {
        OverusePredictorConfig {
            enabled: false,
            capacity_dev_ratio_threshold: 0.2,
            capacity_deviation: -1.0,
            delay_threshold: TimeDelta::from_millis(100),
        }
    }
}

impl OverusePredictorConfig {
    /// Parse a field-trial style configuration string, e.g.
    /// `"Enabled,cap_thr:0.2,dev:-1,delay_thr:100ms"`
    ///
    /// The bare `Enabled` token switches the predictor on; unknown keys and
    /// unparsable values leave the corresponding default in place.
    pub fn from_trial_string(trial: &str) -> Self {
        let mut config = OverusePredictorConfig::default();
        for part in trial.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if part == "Enabled" {
                config.enabled = true;
                continue;
            }
            if part == "Disabled" {
                config.enabled = false;
                continue;
            }
            match part.split_once(':') {
                Some(("cap_thr", value)) => {
                    if let Ok(parsed) = value.parse::<f64>() {
                        config.capacity_dev_ratio_threshold = parsed;
                    }
                }
                Some(("dev", value)) => {
                    if let Ok(parsed) = value.parse::<f64>() {
                        config.capacity_deviation = parsed;
                    }
                }
                Some(("delay_thr", value)) => {
                    if let Some(parsed) = parse_duration(value) {
                        config.delay_threshold = parsed;
                    }
                }
                _ => tracing::warn!("unknown overuse predictor trial key: {}", part),
            }
        }
        config
    }
}

/// Parse a trial duration: bare numbers are milliseconds, `ms` and `s`
/// suffixes are honored
fn parse_duration(value: &str) -> Option<TimeDelta> {
    if let Some(stripped) = value.strip_suffix("ms") {
        stripped.trim().parse::<i64>().ok().map(TimeDelta::from_millis)
    } else if let Some(stripped) = value.strip_suffix('s') {
        stripped.trim().parse::<i64>().ok().map(TimeDelta::from_seconds)
    } else {
        value.parse::<i64>().ok().map(TimeDelta::from_millis)
    }
}

#[derive(Debug, Clone, Copy)]
struct SentPacketInfo {
    send_time: Timestamp,
    size: DataSize,
}

/// Fluid-queue overuse predictor
///
/// `on_sent_packet` records what has been handed to the network;
/// `predict_overuse` projects the standing queue those packets will build at
/// the estimated bottleneck and reports whether it exceeds the configured
/// delay budget.
#[derive(Debug, Clone)]
pub struct OverusePredictor {
    config: OverusePredictorConfig,
    pending: VecDeque<SentPacketInfo>,
}

impl OverusePredictor {
    pub fn new(config: OverusePredictorConfig) -> Self {
        OverusePredictor {
            config,
            pending: VecDeque::new(),
        }
    }

    /// Record one transmitted packet; a no-op while disabled
    pub fn on_sent_packet(&mut self, sent_packet: SentPacket) {
        if !self.config.enabled {
            return;
        }
        self.pending.push_back(SentPacketInfo {
            send_time: sent_packet.send_time,
            size: sent_packet.size,
        });
        if self.pending.len() > MAX_PENDING_PACKETS {
            self.pending.pop_front();
        }
    }

    /// Project whether the pending packets overuse the estimated link
    ///
    /// Packets sent before the estimate was formed are discarded first. An
    /// estimate whose deviation is too large relative to its capacity is
    /// rejected outright: acting on a noisy estimate is worse than waiting.
    pub fn predict_overuse(&mut self, estimate: Option<&NetworkStateEstimate>) -> bool {
        if !self.config.enabled {
            return false;
        }
        let est = match estimate {
            Some(est) => est,
            None => return false,
        };
        while self
            .pending
            .front()
            .map_or(false, |packet| packet.send_time < est.last_send_time)
        {
            self.pending.pop_front();
        }
        let deviation_ratio = est.link_capacity_std_dev.bps_f64() / est.link_capacity.bps_f64();
        if deviation_ratio > self.config.capacity_dev_ratio_threshold {
            return false;
        }
        let buffer_delay = self.predict_delay(est) - est.propagation_delay;
        buffer_delay > self.config.delay_threshold
    }

    /// Number of packets currently tracked
    #[inline]
    pub fn pending_packets(&self) -> usize {
        self.pending.len()
    }

    /// Replay the pending packets through the fluid-queue model
    ///
    /// Between two sends the queue drains by the inter-send gap, floored at
    /// the propagation delay; each packet then adds its own serialization
    /// time at the available capacity.
    fn predict_delay(&self, est: &NetworkStateEstimate) -> TimeDelta {
        let safe_capacity = available_capacity(est, self.config.capacity_deviation);
        let mut last_send_time = est.last_send_time;
        let mut link_delay = est.pre_link_buffer_delay;
        for packet in &self.pending {
            let delta = packet.send_time - last_send_time;
            last_send_time = packet.send_time;
            link_delay = (link_delay - delta).max(est.propagation_delay);
            link_delay += packet.size / safe_capacity;
        }
        link_delay
    }
}

/// Capacity left for this flow after betting `deviation` standard deviations
/// and reserving the cross-traffic share
fn available_capacity(est: &NetworkStateEstimate, deviation: f64) -> DataRate {
    let capacity_bps = est.link_capacity.bps_f64();
    let deviation_bps = est.link_capacity_std_dev.bps_f64();
    let share = 1.0 - est.cross_traffic_ratio;
    DataRate::from_bps_f64((capacity_bps + deviation_bps * deviation) * share)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config() -> OverusePredictorConfig {
        OverusePredictorConfig {
            enabled: true,
            ..OverusePredictorConfig::default()
        }
    }

    fn estimate_at(last_send_time: Timestamp) -> NetworkStateEstimate {
        NetworkStateEstimate {
            link_capacity: DataRate::from_kbps(1_000),
            link_capacity_std_dev: DataRate::ZERO,
            cross_traffic_ratio: 0.0,
            propagation_delay: TimeDelta::from_millis(10),
            pre_link_buffer_delay: TimeDelta::ZERO,
            last_send_time,
        }
    }

    fn burst(predictor: &mut OverusePredictor, at: Timestamp, count: usize, bytes: u64) {
        for _ in 0..count {
            predictor.on_sent_packet(SentPacket {
                send_time: at,
                size: DataSize::from_bytes(bytes),
            });
        }
    }

    #[test]
    fn test_disabled_is_noop() {
        let mut predictor = OverusePredictor::new(OverusePredictorConfig::default());
        burst(&mut predictor, Timestamp::from_millis(1), 50, 100_000);
        assert_eq!(predictor.pending_packets(), 0);
        let est = estimate_at(Timestamp::ZERO);
        assert!(!predictor.predict_overuse(Some(&est)));
    }

    #[test]
    fn test_no_estimate_predicts_nothing() {
        let mut predictor = OverusePredictor::new(enabled_config());
        burst(&mut predictor, Timestamp::from_millis(1), 10, 100_000);
        assert!(!predictor.predict_overuse(None));
    }

    #[test]
    fn test_fifo_drops_oldest_beyond_cap() {
        let mut predictor = OverusePredictor::new(enabled_config());
        burst(&mut predictor, Timestamp::from_millis(1), 150, 100);
        assert_eq!(predictor.pending_packets(), 100);
    }

    #[test]
    fn test_stale_packets_discarded_before_prediction() {
        let mut predictor = OverusePredictor::new(enabled_config());
        burst(&mut predictor, Timestamp::from_millis(1), 10, 100_000);
        // All of them predate the estimate, so nothing is left to replay.
        let est = estimate_at(Timestamp::from_millis(100));
        assert!(!predictor.predict_overuse(Some(&est)));
        assert_eq!(predictor.pending_packets(), 0);
    }

    #[test]
    fn test_queue_buildup_predicts_overuse() {
        let mut predictor = OverusePredictor::new(enabled_config());
        let now = Timestamp::from_seconds(1);
        // 1 Mbps link; three back-to-back 12500 byte packets each add 100 ms.
        burst(&mut predictor, now, 3, 12_500);
        assert!(predictor.predict_overuse(Some(&estimate_at(now))));
    }

    #[test]
    fn test_ample_capacity_predicts_no_overuse() {
        let mut predictor = OverusePredictor::new(enabled_config());
        let now = Timestamp::from_seconds(1);
        burst(&mut predictor, now, 3, 12_500);
        let mut est = estimate_at(now);
        est.link_capacity = DataRate::from_kbps(100_000);
        assert!(!predictor.predict_overuse(Some(&est)));
    }

    #[test]
    fn test_noisy_estimate_rejected() {
        let mut predictor = OverusePredictor::new(enabled_config());
        let now = Timestamp::from_seconds(1);
        burst(&mut predictor, now, 50, 100_000);
        let mut est = estimate_at(now);
        // Deviation ratio 0.5 exceeds the 0.2 threshold.
        est.link_capacity_std_dev = DataRate::from_kbps(500);
        assert!(!predictor.predict_overuse(Some(&est)));
    }

    #[test]
    fn test_cross_traffic_shrinks_capacity() {
        let now = Timestamp::from_seconds(1);
        // Two packets of 6250 bytes: 50 ms each at the full 1 Mbps, within
        // the 100 ms budget; at half capacity they blow past it.
        let mut predictor = OverusePredictor::new(enabled_config());
        burst(&mut predictor, now, 2, 6_250);
        assert!(!predictor.predict_overuse(Some(&estimate_at(now))));

        let mut crowded = estimate_at(now);
        crowded.cross_traffic_ratio = 0.5;
        let mut predictor = OverusePredictor::new(enabled_config());
        burst(&mut predictor, now, 2, 6_250);
        assert!(predictor.predict_overuse(Some(&crowded)));
    }

    #[test]
    fn test_trial_string_round_trip() {
        let config =
            OverusePredictorConfig::from_trial_string("Enabled,cap_thr:0.3,dev:1,delay_thr:50ms");
        assert!(config.enabled);
        assert_eq!(config.capacity_dev_ratio_threshold, 0.3);
        assert_eq!(config.capacity_deviation, 1.0);
        assert_eq!(config.delay_threshold, TimeDelta::from_millis(50));
    }

    #[test]
    fn test_trial_string_defaults() {
        let config = OverusePredictorConfig::from_trial_string("");
        assert_eq!(config, OverusePredictorConfig::default());
        assert!(!config.enabled);
    }

    #[test]
    fn test_trial_string_ignores_unknown_keys() {
        let config = OverusePredictorConfig::from_trial_string("Enabled,bogus:12,delay_thr:2s");
        assert!(config.enabled);
        assert_eq!(config.delay_threshold, TimeDelta::from_seconds(2));
        assert_eq!(
            config.capacity_dev_ratio_threshold,
            OverusePredictorConfig::default().capacity_dev_ratio_threshold
        );
    }
}
