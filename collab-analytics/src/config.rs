//! Analytics configuration
//!
//! Every threshold, weight, horizon and capacity used by the engines lives here so
//! deployments can tune them without code changes. Defaults are the baseline values.

use crate::types::QualityTier;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level analytics configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub sampler: SamplerConfig,
    pub collector: CollectorConfig,
    pub window: WindowConfig,
    pub quality: QualityConfig,
    pub scoring: ScoringConfig,
    pub coordinator: CoordinatorConfig,
}

/// Telemetry sampler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Interval between emitted network samples
    pub cadence_ms: u64,
    /// Silence longer than `gap_multiplier * cadence` produces degraded samples
    pub gap_multiplier: u32,
    /// Weight kept from the previous bandwidth estimate (0.8 = 80% old)
    pub bandwidth_smoothing: f64,
    /// Bandwidth assumed before the first throughput observation
    pub initial_bandwidth_kbps: f64,
    pub degraded_latency_ms: f64,
    pub degraded_jitter_ms: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            cadence_ms: 1000,
            gap_multiplier: 2,
            bandwidth_smoothing: 0.8,
            initial_bandwidth_kbps: 1000.0,
            degraded_latency_ms: 999.0,
            degraded_jitter_ms: 999.0,
        }
    }
}

impl SamplerConfig {
    #[must_use]
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms)
    }

    #[must_use]
    pub fn gap_threshold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.cadence_ms * u64::from(self.gap_multiplier)) as i64)
    }
}

/// Engagement signal collector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Minimum voice activity span before a participant counts as speaking
    pub voice_debounce_ms: u64,
    /// Heartbeat interval while a participant is speaking or on camera
    pub heartbeat_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            voice_debounce_ms: 300,
            heartbeat_ms: 1000,
        }
    }
}

impl CollectorConfig {
    #[must_use]
    pub fn voice_debounce(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.voice_debounce_ms as i64)
    }

    #[must_use]
    pub fn heartbeat(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.heartbeat_ms as i64)
    }
}

/// Sliding window horizons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub network_horizon_ms: u64,
    pub engagement_horizon_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            network_horizon_ms: 60_000,
            engagement_horizon_ms: 600_000,
        }
    }
}

impl WindowConfig {
    #[must_use]
    pub fn network_horizon(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.network_horizon_ms as i64)
    }

    #[must_use]
    pub fn engagement_horizon(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.engagement_horizon_ms as i64)
    }
}

/// Relative weight of each network metric in the health score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthWeights {
    pub latency: f64,
    pub jitter: f64,
    pub loss: f64,
    pub bandwidth: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        // Loss hurts perceived quality the most
        Self {
            latency: 0.25,
            jitter: 0.15,
            loss: 0.40,
            bandwidth: 0.20,
        }
    }
}

impl HealthWeights {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.latency + self.jitter + self.loss + self.bandwidth
    }
}

/// Values mapping each raw metric onto [0, 1] (linear between good and bad, clipped)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationBounds {
    pub latency_good_ms: f64,
    pub latency_bad_ms: f64,
    pub jitter_good_ms: f64,
    pub jitter_bad_ms: f64,
    pub loss_good: f64,
    pub loss_bad: f64,
    pub bandwidth_bad_kbps: f64,
    pub bandwidth_good_kbps: f64,
}

impl Default for NormalizationBounds {
    fn default() -> Self {
        Self {
            latency_good_ms: 50.0,
            latency_bad_ms: 400.0,
            jitter_good_ms: 10.0,
            jitter_bad_ms: 100.0,
            loss_good: 0.01,
            loss_bad: 0.15,
            bandwidth_bad_kbps: 150.0,
            bandwidth_good_kbps: 2500.0,
        }
    }
}

/// Health score band of a tier.
///
/// `lower`: staying below it downgrades out of the tier.
/// `upper`: staying above it upgrades into the tier from the one below.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierBand {
    pub lower: f64,
    pub upper: f64,
}

/// Bands for every tier that can be left downwards or entered upwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    pub low: TierBand,
    pub medium: TierBand,
    pub high: TierBand,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            low: TierBand { lower: 0.30, upper: 0.50 },
            medium: TierBand { lower: 0.50, upper: 0.70 },
            high: TierBand { lower: 0.75, upper: 0.97 },
        }
    }
}

impl TierThresholds {
    /// Band of a tier, `None` for `AudioOnly` which can neither be left downwards
    /// nor entered by an upgrade
    #[must_use]
    pub const fn band(&self, tier: QualityTier) -> Option<TierBand> {
        match tier {
            QualityTier::AudioOnly => None,
            QualityTier::Low => Some(self.low),
            QualityTier::Medium => Some(self.medium),
            QualityTier::High => Some(self.high),
        }
    }
}

/// Quality decision engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub initial_tier: QualityTier,
    pub weights: HealthWeights,
    pub bounds: NormalizationBounds,
    pub thresholds: TierThresholds,
    /// Consecutive cycles below the lower threshold before downgrading
    pub downgrade_sustain_cycles: u32,
    /// Consecutive cycles above the next tier's upper threshold before upgrading
    pub upgrade_sustain_cycles: u32,
    /// Hold the initial tier until the network window has spanned one horizon
    pub require_full_window: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            initial_tier: QualityTier::Medium,
            weights: HealthWeights::default(),
            bounds: NormalizationBounds::default(),
            thresholds: TierThresholds::default(),
            downgrade_sustain_cycles: 3,
            upgrade_sustain_cycles: 6,
            require_full_window: true,
        }
    }
}

/// Engagement scoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub speaking_weight: f64,
    pub camera_weight: f64,
    pub reaction_weight: f64,
    /// Active fraction at which the speaking component reaches one half
    pub speaking_half_point: f64,
    /// Reactions per minute at which the reaction component reaches one half
    pub reaction_half_rate_per_min: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            speaking_weight: 0.5,
            camera_weight: 0.3,
            reaction_weight: 0.2,
            speaking_half_point: 0.1,
            reaction_half_rate_per_min: 1.0,
        }
    }
}

/// Session coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub evaluation_interval_ms: u64,
    /// Ingest queue size per session (drop-oldest beyond this)
    pub ingest_queue_capacity: usize,
    /// Engagement reports buffered per subscriber (drop-oldest beyond this)
    pub engagement_channel_capacity: usize,
    /// Quality directives buffered per subscriber (senders wait beyond this)
    pub directive_channel_capacity: usize,
    pub directive_send_timeout_ms: u64,
    /// Extra attempts after a timed-out directive send before the subscriber is dropped
    pub directive_send_retries: u32,
    /// Maximum concurrent sessions (0 = unlimited)
    pub max_sessions: usize,
    /// Maximum participants per session (0 = unlimited)
    pub max_participants_per_session: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 1000,
            ingest_queue_capacity: 1024,
            engagement_channel_capacity: 16,
            directive_channel_capacity: 16,
            directive_send_timeout_ms: 250,
            directive_send_retries: 2,
            max_sessions: 0,
            max_participants_per_session: 0,
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    #[must_use]
    pub fn directive_send_timeout(&self) -> Duration {
        Duration::from_millis(self.directive_send_timeout_ms)
    }
}

impl AnalyticsConfig {
    /// Check internal consistency, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.sampler.cadence_ms == 0 {
            errors.push("sampler.cadence_ms must be greater than 0".to_string());
        }
        if self.sampler.gap_multiplier == 0 {
            errors.push("sampler.gap_multiplier must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.sampler.bandwidth_smoothing) {
            errors.push("sampler.bandwidth_smoothing must be in [0, 1)".to_string());
        }
        if self.collector.heartbeat_ms == 0 {
            errors.push("collector.heartbeat_ms must be greater than 0".to_string());
        }
        if self.window.network_horizon_ms == 0 || self.window.engagement_horizon_ms == 0 {
            errors.push("window horizons must be greater than 0".to_string());
        }

        let w = &self.quality.weights;
        if [w.latency, w.jitter, w.loss, w.bandwidth].iter().any(|v| *v < 0.0 || !v.is_finite()) {
            errors.push("quality.weights must be finite and non-negative".to_string());
        } else if w.total() <= 0.0 {
            errors.push("quality.weights must not all be zero".to_string());
        }

        let b = &self.quality.bounds;
        if b.latency_bad_ms <= b.latency_good_ms
            || b.jitter_bad_ms <= b.jitter_good_ms
            || b.loss_bad <= b.loss_good
            || b.bandwidth_good_kbps <= b.bandwidth_bad_kbps
        {
            errors.push("quality.bounds must have distinct good and bad values in the right order".to_string());
        }

        let t = &self.quality.thresholds;
        for (name, band) in [("low", t.low), ("medium", t.medium), ("high", t.high)] {
            if !(0.0..=1.0).contains(&band.lower) || !(0.0..=1.0).contains(&band.upper) {
                errors.push(format!("quality.thresholds.{name} must lie within [0, 1]"));
            }
            if band.upper < band.lower {
                errors.push(format!("quality.thresholds.{name}.upper must not be below lower"));
            }
        }
        if !(t.low.lower <= t.medium.lower && t.medium.lower <= t.high.lower) {
            errors.push("quality.thresholds lower bounds must increase with the tier".to_string());
        }
        if !(t.low.upper <= t.medium.upper && t.medium.upper <= t.high.upper) {
            errors.push("quality.thresholds upper bounds must increase with the tier".to_string());
        }
        if self.quality.downgrade_sustain_cycles == 0 || self.quality.upgrade_sustain_cycles == 0 {
            errors.push("quality sustain cycles must be greater than 0".to_string());
        }

        let s = &self.scoring;
        if [s.speaking_weight, s.camera_weight, s.reaction_weight].iter().any(|v| *v < 0.0) {
            errors.push("scoring weights must be non-negative".to_string());
        }
        if s.speaking_half_point <= 0.0 || s.reaction_half_rate_per_min <= 0.0 {
            errors.push("scoring half points must be greater than 0".to_string());
        }

        let c = &self.coordinator;
        if c.evaluation_interval_ms == 0 {
            errors.push("coordinator.evaluation_interval_ms must be greater than 0".to_string());
        }
        if c.ingest_queue_capacity == 0
            || c.engagement_channel_capacity == 0
            || c.directive_channel_capacity == 0
        {
            errors.push("coordinator queue and channel capacities must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AnalyticsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampler.cadence(), Duration::from_secs(1));
        assert_eq!(config.window.network_horizon(), chrono::Duration::seconds(60));
        assert_eq!(config.window.engagement_horizon(), chrono::Duration::minutes(10));
        assert_eq!(config.quality.initial_tier, QualityTier::Medium);
    }

    #[test]
    fn test_loss_weighted_highest() {
        let w = HealthWeights::default();
        assert!(w.loss > w.latency);
        assert!(w.loss > w.jitter);
        assert!(w.loss > w.bandwidth);
    }

    #[test]
    fn test_gap_threshold() {
        let sampler = SamplerConfig::default();
        assert_eq!(sampler.gap_threshold(), chrono::Duration::seconds(2));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AnalyticsConfig::default();
        config.sampler.cadence_ms = 0;
        config.quality.weights = HealthWeights {
            latency: 0.0,
            jitter: 0.0,
            loss: 0.0,
            bandwidth: 0.0,
        };
        config.quality.thresholds.medium.lower = 0.9;
        config.coordinator.ingest_queue_capacity = 0;

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("cadence_ms")));
        assert!(errors.iter().any(|e| e.contains("all be zero")));
        assert!(errors.iter().any(|e| e.contains("lower bounds")));
        assert!(errors.iter().any(|e| e.contains("capacities")));
    }

    #[test]
    fn test_band_lookup() {
        let thresholds = TierThresholds::default();
        assert!(thresholds.band(QualityTier::AudioOnly).is_none());
        assert_eq!(thresholds.band(QualityTier::High), Some(thresholds.high));
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: AnalyticsConfig =
            serde_json::from_str(r#"{"quality":{"downgrade_sustain_cycles":5}}"#).unwrap();
        assert_eq!(config.quality.downgrade_sustain_cycles, 5);
        assert_eq!(config.quality.upgrade_sustain_cycles, 6);
        assert_eq!(config.sampler, SamplerConfig::default());
    }
}
