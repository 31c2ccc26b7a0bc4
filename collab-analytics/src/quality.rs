//! Quality decision engine
//!
//! Turns the network aggregate into a composite health score and drives a
//! hysteresis state machine over `QualityTier`. Downgrades need the score to
//! stay under the current tier's lower threshold for a few cycles; upgrades
//! need it above the next tier's upper threshold for more cycles.

use crate::config::{HealthWeights, NormalizationBounds, QualityConfig};
use crate::metrics;
use crate::types::{QualityTier, SessionId};
use crate::window::NetworkAggregate;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Coarse network indicator derived from the health score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthGrade {
    Excellent,
    Good,
    Poor,
}

impl HealthGrade {
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Self::Excellent
        } else if score >= 0.5 {
            Self::Good
        } else {
            Self::Poor
        }
    }
}

/// Composite network health in [0, 1], 1 being perfect
#[derive(Debug, Clone)]
pub struct HealthScorer {
    weights: HealthWeights,
    bounds: NormalizationBounds,
}

/// Map `value` linearly so that `good` gives 1 and `bad` gives 0, clipped
fn normalize(value: f64, good: f64, bad: f64) -> f64 {
    if (bad - good).abs() < f64::EPSILON {
        return if value == good { 1.0 } else { 0.0 };
    }
    (1.0 - (value - good) / (bad - good)).clamp(0.0, 1.0)
}

impl HealthScorer {
    #[must_use]
    pub const fn new(weights: HealthWeights, bounds: NormalizationBounds) -> Self {
        Self { weights, bounds }
    }

    /// Score an aggregate from the window means
    #[must_use]
    pub fn score(&self, aggregate: &NetworkAggregate) -> f64 {
        let b = &self.bounds;
        let w = &self.weights;
        let total = w.total();
        if total <= 0.0 {
            return 0.0;
        }

        let latency = normalize(aggregate.latency_ms.mean, b.latency_good_ms, b.latency_bad_ms);
        let jitter = normalize(aggregate.jitter_ms.mean, b.jitter_good_ms, b.jitter_bad_ms);
        let loss = normalize(aggregate.loss_fraction.mean, b.loss_good, b.loss_bad);
        let bandwidth = normalize(
            aggregate.bandwidth_kbps.mean,
            b.bandwidth_good_kbps,
            b.bandwidth_bad_kbps,
        );

        let weighted = w.bandwidth.mul_add(
            bandwidth,
            w.loss.mul_add(loss, w.latency.mul_add(latency, w.jitter * jitter)),
        );
        (weighted / total).clamp(0.0, 1.0)
    }
}

/// Why a tier changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    SustainedDegradation,
    SustainedRecovery,
    TelemetryLoss,
}

impl TransitionReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SustainedDegradation => "sustained_degradation",
            Self::SustainedRecovery => "sustained_recovery",
            Self::TelemetryLoss => "telemetry_loss",
        }
    }
}

/// Tier change for the media transport and dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityDirective {
    pub session_id: SessionId,
    pub from: QualityTier,
    pub to: QualityTier,
    pub timestamp: DateTime<Utc>,
    pub reason: TransitionReason,
    /// Score of the cycle that triggered the change, absent for telemetry loss
    pub health_score: Option<f64>,
}

/// Per-session tier state machine
#[derive(Debug)]
pub struct QualityDecisionEngine {
    session_id: SessionId,
    config: QualityConfig,
    scorer: HealthScorer,
    network_horizon: Duration,
    tier: QualityTier,
    below_streak: u32,
    above_streak: u32,
    telemetry_lost: bool,
    last_score: Option<f64>,
    last_evaluated_at: Option<DateTime<Utc>>,
}

impl QualityDecisionEngine {
    #[must_use]
    pub fn new(session_id: SessionId, config: QualityConfig, network_horizon: Duration) -> Self {
        let scorer = HealthScorer::new(config.weights.clone(), config.bounds.clone());
        Self {
            session_id,
            tier: config.initial_tier,
            config,
            scorer,
            network_horizon,
            below_streak: 0,
            above_streak: 0,
            telemetry_lost: false,
            last_score: None,
            last_evaluated_at: None,
        }
    }

    #[must_use]
    pub const fn tier(&self) -> QualityTier {
        self.tier
    }

    #[must_use]
    pub const fn telemetry_lost(&self) -> bool {
        self.telemetry_lost
    }

    #[must_use]
    pub const fn last_score(&self) -> Option<f64> {
        self.last_score
    }

    /// Accept an evaluation instant only if it moves time forward
    fn advance(&mut self, now: DateTime<Utc>) -> bool {
        if self.last_evaluated_at.is_some_and(|last| now <= last) {
            debug!(session_id = %self.session_id, %now, "Ignoring non-monotonic evaluation");
            return false;
        }
        self.last_evaluated_at = Some(now);
        true
    }

    /// Run one evaluation cycle over the network aggregate
    pub fn evaluate(&mut self, aggregate: &NetworkAggregate, now: DateTime<Utc>) -> Option<QualityDirective> {
        if !self.advance(now) {
            return None;
        }

        let lost = aggregate
            .degraded_since
            .is_some_and(|since| since <= now - self.network_horizon);
        if lost != self.telemetry_lost {
            if lost {
                warn!(session_id = %self.session_id, tier = %self.tier, "Telemetry lost for a full horizon");
            } else {
                info!(session_id = %self.session_id, "Telemetry loss cleared");
            }
        }
        self.telemetry_lost = lost;

        if lost {
            self.below_streak = 0;
            self.above_streak = 0;
            return (self.tier > QualityTier::Low)
                .then(|| self.transition(QualityTier::Low, TransitionReason::TelemetryLoss, now, None));
        }

        if aggregate.sample_count == 0 {
            return None;
        }

        let score = self.scorer.score(aggregate);
        self.last_score = Some(score);

        if self.config.require_full_window && !aggregate.full {
            // Warm-up keeps the initial tier
            return None;
        }

        self.apply_score(score, now)
    }

    /// Run one cycle from an already computed score
    pub fn evaluate_score(&mut self, score: f64, now: DateTime<Utc>) -> Option<QualityDirective> {
        if !self.advance(now) {
            return None;
        }
        self.last_score = Some(score);
        if self.telemetry_lost {
            return None;
        }
        self.apply_score(score, now)
    }

    fn apply_score(&mut self, score: f64, now: DateTime<Utc>) -> Option<QualityDirective> {
        let thresholds = &self.config.thresholds;

        let below = thresholds.band(self.tier).is_some_and(|band| score < band.lower);
        self.below_streak = if below { self.below_streak + 1 } else { 0 };

        let above = self
            .tier
            .higher()
            .and_then(|next| thresholds.band(next))
            .is_some_and(|band| score > band.upper);
        self.above_streak = if above { self.above_streak + 1 } else { 0 };

        if self.below_streak >= self.config.downgrade_sustain_cycles {
            if let Some(lower) = self.tier.lower() {
                return Some(self.transition(lower, TransitionReason::SustainedDegradation, now, Some(score)));
            }
        }
        if self.above_streak >= self.config.upgrade_sustain_cycles {
            if let Some(higher) = self.tier.higher() {
                return Some(self.transition(higher, TransitionReason::SustainedRecovery, now, Some(score)));
            }
        }
        None
    }

    fn transition(
        &mut self,
        to: QualityTier,
        reason: TransitionReason,
        now: DateTime<Utc>,
        health_score: Option<f64>,
    ) -> QualityDirective {
        let from = self.tier;
        self.tier = to;
        self.below_streak = 0;
        self.above_streak = 0;

        metrics::TIER_CHANGES
            .with_label_values(&[from.as_str(), to.as_str(), reason.as_str()])
            .inc();
        info!(
            session_id = %self.session_id,
            from = %from,
            to = %to,
            reason = reason.as_str(),
            score = ?health_score,
            "Quality tier changed"
        );

        QualityDirective {
            session_id: self.session_id.clone(),
            from,
            to,
            timestamp: now,
            reason,
            health_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::NetworkSample;
    use crate::window::NetworkWindow;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn engine() -> QualityDecisionEngine {
        QualityDecisionEngine::new(
            SessionId::from("s1"),
            QualityConfig::default(),
            Duration::seconds(60),
        )
    }

    /// Feed scores one per second, collecting every directive
    fn drive(engine: &mut QualityDecisionEngine, start: i64, scores: &[f64]) -> Vec<QualityDirective> {
        scores
            .iter()
            .enumerate()
            .filter_map(|(i, s)| engine.evaluate_score(*s, t0() + Duration::seconds(start + i as i64)))
            .collect()
    }

    fn sample(at: DateTime<Utc>, degraded: bool) -> NetworkSample {
        NetworkSample {
            session_id: SessionId::from("s1"),
            timestamp: at,
            latency_ms: if degraded { 999.0 } else { 40.0 },
            jitter_ms: if degraded { 999.0 } else { 5.0 },
            loss_fraction: if degraded { 1.0 } else { 0.0 },
            bandwidth_kbps: if degraded { 0.0 } else { 3000.0 },
            degraded,
        }
    }

    #[test]
    fn test_hysteresis_scenario() {
        let mut engine = engine();
        assert_eq!(engine.tier(), QualityTier::Medium);

        assert!(drive(&mut engine, 0, &[0.95; 10]).is_empty());
        assert_eq!(engine.tier(), QualityTier::Medium);

        let down = drive(&mut engine, 10, &[0.2; 4]);
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].from, QualityTier::Medium);
        assert_eq!(down[0].to, QualityTier::Low);
        assert_eq!(down[0].reason, TransitionReason::SustainedDegradation);
        assert_eq!(down[0].timestamp, t0() + Duration::seconds(12));

        assert!(drive(&mut engine, 14, &[0.9; 5]).is_empty());
        assert_eq!(engine.tier(), QualityTier::Low);

        let up = drive(&mut engine, 19, &[0.9]);
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].from, QualityTier::Low);
        assert_eq!(up[0].to, QualityTier::Medium);
        assert_eq!(up[0].reason, TransitionReason::SustainedRecovery);
    }

    #[test]
    fn test_short_dips_never_downgrade() {
        let mut engine = engine();
        // Two bad cycles, one good, repeated: the streak never reaches three
        let pattern: Vec<f64> = [0.1, 0.1, 0.9].iter().copied().cycle().take(60).collect();
        assert!(drive(&mut engine, 0, &pattern).is_empty());
        assert_eq!(engine.tier(), QualityTier::Medium);
    }

    #[test]
    fn test_one_step_at_a_time() {
        let mut engine = engine();
        let directives = drive(&mut engine, 0, &[0.0; 6]);
        assert_eq!(directives.len(), 2);
        assert_eq!(directives[0].to, QualityTier::Low);
        assert_eq!(directives[1].to, QualityTier::AudioOnly);

        // AudioOnly has no lower band
        assert!(drive(&mut engine, 6, &[0.0; 10]).is_empty());
        assert!(directives[0].timestamp < directives[1].timestamp);
    }

    #[test]
    fn test_non_monotonic_evaluation_ignored() {
        let mut engine = engine();
        assert!(engine.evaluate_score(0.1, t0() + Duration::seconds(5)).is_none());
        assert!(engine.evaluate_score(0.1, t0() + Duration::seconds(5)).is_none());
        assert!(engine.evaluate_score(0.1, t0() + Duration::seconds(4)).is_none());
        // Only one of the three counted toward the streak
        assert!(engine.evaluate_score(0.1, t0() + Duration::seconds(6)).is_none());
        assert!(engine.evaluate_score(0.1, t0() + Duration::seconds(7)).is_some());
    }

    #[test]
    fn test_health_score_bounds() {
        let scorer = HealthScorer::new(HealthWeights::default(), NormalizationBounds::default());
        let mut window = NetworkWindow::new(Duration::seconds(60));
        window.push(sample(t0(), false)).unwrap();
        let perfect = scorer.score(&window.aggregate(t0()));
        assert!((perfect - 1.0).abs() < 1e-9);
        assert_eq!(HealthGrade::from_score(perfect), HealthGrade::Excellent);

        let mut window = NetworkWindow::new(Duration::seconds(60));
        window.push(sample(t0(), true)).unwrap();
        let worst = scorer.score(&window.aggregate(t0()));
        assert!(worst.abs() < 1e-9);
        assert_eq!(HealthGrade::from_score(worst), HealthGrade::Poor);
    }

    #[test]
    fn test_loss_dominates_score() {
        let scorer = HealthScorer::new(HealthWeights::default(), NormalizationBounds::default());
        let mut lossy = sample(t0(), false);
        lossy.loss_fraction = 0.5;
        let mut slow = sample(t0(), false);
        slow.latency_ms = 800.0;

        let score_of = |s: NetworkSample| {
            let mut window = NetworkWindow::new(Duration::seconds(60));
            window.push(s).unwrap();
            scorer.score(&window.aggregate(t0()))
        };
        assert!(score_of(lossy) < score_of(slow));
    }

    #[test]
    fn test_warm_up_holds_initial_tier() {
        let mut engine = engine();
        let mut window = NetworkWindow::new(Duration::seconds(60));
        for i in 0..30 {
            let at = t0() + Duration::seconds(i);
            let mut s = sample(at, false);
            s.loss_fraction = 0.5;
            window.push(s).unwrap();
            assert!(engine.evaluate(&window.aggregate(at), at).is_none());
        }
        assert_eq!(engine.tier(), QualityTier::Medium);
        assert!(engine.last_score().is_some());
    }

    #[test]
    fn test_telemetry_loss_forces_low() {
        let horizon = Duration::seconds(4);
        let mut config = QualityConfig::default();
        config.initial_tier = QualityTier::High;
        let mut engine = QualityDecisionEngine::new(SessionId::from("s1"), config, horizon);
        let mut window = NetworkWindow::new(horizon);

        window.push(sample(t0(), false)).unwrap();
        assert!(engine.evaluate(&window.aggregate(t0()), t0()).is_none());

        let mut forced = Vec::new();
        for i in 1..=5 {
            let at = t0() + Duration::seconds(i);
            window.push(sample(at, true)).unwrap();
            forced.extend(engine.evaluate(&window.aggregate(at), at));
        }
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].from, QualityTier::High);
        assert_eq!(forced[0].to, QualityTier::Low);
        assert_eq!(forced[0].reason, TransitionReason::TelemetryLoss);
        assert!(engine.telemetry_lost());

        // Perfect scores are ignored while telemetry is lost
        assert!(drive(&mut engine, 6, &[1.0; 10]).is_empty());
        assert_eq!(engine.tier(), QualityTier::Low);

        // A real sample clears the condition
        let at = t0() + Duration::seconds(20);
        window.push(sample(at, false)).unwrap();
        assert!(engine.evaluate(&window.aggregate(at), at).is_none());
        assert!(!engine.telemetry_lost());
    }

    #[test]
    fn test_telemetry_loss_keeps_audio_only() {
        let horizon = Duration::seconds(2);
        let mut config = QualityConfig::default();
        config.initial_tier = QualityTier::AudioOnly;
        let mut engine = QualityDecisionEngine::new(SessionId::from("s1"), config, horizon);
        let mut window = NetworkWindow::new(horizon);
        for i in 0..5 {
            let at = t0() + Duration::seconds(i);
            window.push(sample(at, true)).unwrap();
            assert!(engine.evaluate(&window.aggregate(at), at).is_none());
        }
        assert_eq!(engine.tier(), QualityTier::AudioOnly);
    }
}
