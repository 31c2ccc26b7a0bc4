//! Session state
//!
//! `SessionState` owns every per-session component and is mutated by exactly
//! one writer: the session task in the coordinator, or the replayer offline.
//! Readers get an immutable `SessionSnapshot`.

use crate::collector::{ActivityEvent, ActivityKind, EngagementCollector, EngagementSample};
use crate::config::AnalyticsConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::quality::{HealthGrade, QualityDecisionEngine, QualityDirective};
use crate::scoring::{EngagementReport, EngagementScorer};
use crate::telemetry::{DeliveryEvent, NetworkSample, TelemetrySampler};
use crate::types::{Participant, ParticipantId, ParticipantInfo, QualityTier, SessionId};
use crate::window::{NetworkAggregate, SessionAggregator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Per-session counters published with every snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub invalid_samples: u64,
    pub telemetry_gaps: u64,
    pub ingest_dropped: u64,
    pub directives_emitted: u64,
    pub reports_emitted: u64,
}

/// Result of one evaluation cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleOutput {
    pub directive: Option<QualityDirective>,
    pub report: Option<EngagementReport>,
}

/// Immutable view of a session at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub taken_at: DateTime<Utc>,
    pub tier: QualityTier,
    pub health_score: Option<f64>,
    pub health_grade: Option<HealthGrade>,
    pub telemetry_lost: bool,
    /// Present participants in join order
    pub participants: Vec<Participant>,
    pub network: NetworkAggregate,
    pub last_directive: Option<QualityDirective>,
    pub last_report: Option<EngagementReport>,
    pub counters: SessionCounters,
}

/// All mutable state of one session
pub struct SessionState {
    id: SessionId,
    created_at: DateTime<Utc>,
    max_participants: usize,
    participants: BTreeMap<ParticipantId, Participant>,
    next_join_order: u64,

    sampler: TelemetrySampler,
    collector: EngagementCollector,
    aggregator: SessionAggregator,
    quality: QualityDecisionEngine,
    scorer: EngagementScorer,

    last_evaluated_at: Option<DateTime<Utc>>,
    last_directive: Option<QualityDirective>,
    last_report: Option<EngagementReport>,
    counters: SessionCounters,
}

impl SessionState {
    #[must_use]
    pub fn new(id: SessionId, config: &AnalyticsConfig, created_at: DateTime<Utc>) -> Self {
        Self {
            sampler: TelemetrySampler::new(id.clone(), config.sampler.clone(), created_at),
            collector: EngagementCollector::new(id.clone(), config.collector.clone()),
            aggregator: SessionAggregator::new(
                config.window.network_horizon(),
                config.window.engagement_horizon(),
            ),
            quality: QualityDecisionEngine::new(
                id.clone(),
                config.quality.clone(),
                config.window.network_horizon(),
            ),
            scorer: EngagementScorer::new(config.scoring.clone()),
            id,
            created_at,
            max_participants: config.coordinator.max_participants_per_session,
            participants: BTreeMap::new(),
            next_join_order: 0,
            last_evaluated_at: None,
            last_directive: None,
            last_report: None,
            counters: SessionCounters::default(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub const fn tier(&self) -> QualityTier {
        self.quality.tier()
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    #[must_use]
    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.participants.contains_key(participant_id)
    }

    #[must_use]
    pub const fn counters(&self) -> SessionCounters {
        self.counters
    }

    /// Add a participant. Returns `false` if it was already present.
    pub fn join(&mut self, info: ParticipantInfo, at: DateTime<Utc>) -> Result<bool> {
        if self.contains(&info.id) {
            return Ok(false);
        }
        if self.max_participants > 0 && self.participants.len() >= self.max_participants {
            return Err(Error::LimitReached(format!(
                "session {} already has {} participants",
                self.id, self.max_participants
            )));
        }

        let participant = Participant::from_info(info, at, self.next_join_order);
        self.next_join_order += 1;

        let baseline = self.collector.add_participant(&participant);
        self.aggregator.add_participant(participant.id.clone());
        info!(
            session_id = %self.id,
            participant_id = %participant.id,
            join_order = participant.join_order,
            "Participant joined"
        );
        self.participants.insert(participant.id.clone(), participant);
        self.push_engagement(baseline);
        Ok(true)
    }

    /// Remove a participant and every piece of state kept for it
    pub fn leave(&mut self, participant_id: &ParticipantId) -> bool {
        if self.participants.remove(participant_id).is_none() {
            return false;
        }
        self.collector.remove_participant(participant_id);
        self.aggregator.remove_participant(participant_id);
        info!(session_id = %self.id, participant_id = %participant_id, "Participant left");
        true
    }

    pub fn record_delivery(&mut self, event: &DeliveryEvent) -> Result<()> {
        self.sampler
            .record(event)
            .inspect_err(|e| self.count_invalid("delivery", e))
    }

    pub fn record_activity(&mut self, event: &ActivityEvent) -> Result<()> {
        let samples = match self.collector.record(event) {
            Ok(samples) => samples,
            Err(e) => {
                self.count_invalid("activity", &e);
                return Err(e);
            }
        };

        if let Some(participant) = self.participants.get_mut(&event.participant_id) {
            match event.kind {
                ActivityKind::Mute { muted } => participant.muted = muted,
                ActivityKind::Camera { on } => participant.camera_on = on,
                ActivityKind::VoiceActivity { .. } | ActivityKind::Reaction { .. } => {}
            }
        }

        for sample in samples {
            self.push_engagement(sample);
        }
        Ok(())
    }

    /// Close the sampling period: one network sample plus any confirmed speech
    /// and heartbeat engagement samples
    pub fn sample_tick(&mut self, now: DateTime<Utc>) -> Option<NetworkSample> {
        for sample in self.collector.tick(now) {
            self.push_engagement(sample);
        }

        let sample = self.sampler.tick(now)?;
        if sample.degraded {
            self.counters.telemetry_gaps += 1;
        }
        match self.aggregator.push_network(sample.clone()) {
            Ok(()) => Some(sample),
            Err(e) => {
                self.count_invalid("network", &e);
                None
            }
        }
    }

    /// Run the quality and engagement engines over the window as of `now`
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> CycleOutput {
        if self.last_evaluated_at.is_some_and(|last| now <= last) {
            debug!(session_id = %self.id, %now, "Skipping non-monotonic evaluation");
            return CycleOutput::default();
        }
        self.last_evaluated_at = Some(now);
        let _timer = metrics::EVALUATION_DURATION.start_timer();

        self.aggregator.evict(now);
        let network = self.aggregator.network_aggregate(now);
        let directive = self.quality.evaluate(&network, now);

        let aggregates = self.aggregator.engagement_aggregates(now);
        let report = self.scorer.report(&self.id, now, &aggregates, &self.participants);

        if let Some(directive) = &directive {
            self.counters.directives_emitted += 1;
            self.last_directive = Some(directive.clone());
        }
        self.counters.reports_emitted += 1;
        self.last_report = Some(report.clone());

        CycleOutput {
            directive,
            report: Some(report),
        }
    }

    /// Raw events displaced from the ingest queue before reaching this session
    pub fn note_ingest_dropped(&mut self, count: u64) {
        self.counters.ingest_dropped += count;
    }

    #[must_use]
    pub fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        let mut participants: Vec<Participant> = self.participants.values().cloned().collect();
        participants.sort_by_key(|p| p.join_order);
        let health_score = self.quality.last_score();

        SessionSnapshot {
            session_id: self.id.clone(),
            created_at: self.created_at,
            taken_at: now,
            tier: self.quality.tier(),
            health_score,
            health_grade: health_score.map(HealthGrade::from_score),
            telemetry_lost: self.quality.telemetry_lost(),
            participants,
            network: self.aggregator.network_aggregate(now),
            last_directive: self.last_directive.clone(),
            last_report: self.last_report.clone(),
            counters: self.counters,
        }
    }

    fn push_engagement(&mut self, sample: EngagementSample) {
        if let Err(e) = self.aggregator.push_engagement(sample) {
            self.count_invalid("engagement", &e);
        }
    }

    fn count_invalid(&mut self, source: &str, error: &Error) {
        self.counters.invalid_samples += 1;
        metrics::INVALID_SAMPLES
            .with_label_values(&[source, error.kind()])
            .inc();
        debug!(session_id = %self.id, source, kind = error.kind(), error = %error, "Dropped invalid input");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Reaction;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + Duration::milliseconds(ms)
    }

    fn state() -> SessionState {
        SessionState::new(SessionId::from("s1"), &AnalyticsConfig::default(), t0())
    }

    fn muted(id: &str) -> ParticipantInfo {
        let mut info = ParticipantInfo::new(id, id);
        info.camera_on = false;
        info
    }

    fn ack(sent_ms: i64, acked_ms: i64) -> DeliveryEvent {
        DeliveryEvent::Ack {
            sent_at: at(sent_ms),
            acked_at: at(acked_ms),
            bytes: 1200,
        }
    }

    #[test]
    fn test_join_is_idempotent() {
        let mut state = state();
        assert!(state.join(muted("alice"), t0()).unwrap());
        assert!(state.join(muted("bob"), at(10)).unwrap());
        assert!(!state.join(muted("alice"), at(20)).unwrap());

        let snapshot = state.snapshot(at(30));
        let order: Vec<u64> = snapshot.participants.iter().map(|p| p.join_order).collect();
        assert_eq!(order, vec![0, 1]);
        assert_eq!(snapshot.participants[0].joined_at, t0());
    }

    #[test]
    fn test_participant_limit() {
        let mut config = AnalyticsConfig::default();
        config.coordinator.max_participants_per_session = 1;
        let mut state = SessionState::new(SessionId::from("s1"), &config, t0());
        state.join(muted("alice"), t0()).unwrap();
        assert!(matches!(
            state.join(muted("bob"), t0()),
            Err(Error::LimitReached(_))
        ));
    }

    #[test]
    fn test_invalid_inputs_are_counted_and_dropped() {
        let mut state = state();
        state.join(muted("alice"), t0()).unwrap();

        assert!(state.record_delivery(&ack(500, 400)).is_err());
        let ghost = ActivityEvent::new("ghost", at(100), ActivityKind::Camera { on: true });
        assert!(matches!(
            state.record_activity(&ghost),
            Err(Error::ParticipantNotFound { .. })
        ));
        assert_eq!(state.counters().invalid_samples, 2);
    }

    #[test]
    fn test_invalid_input_labelled_by_error_kind() {
        let counter = metrics::INVALID_SAMPLES.with_label_values(&["activity", "participant_not_found"]);
        let before = counter.get();

        let mut state = state();
        state.join(muted("alice"), t0()).unwrap();
        let ghost = ActivityEvent::new("ghost", at(100), ActivityKind::Camera { on: true });
        assert!(state.record_activity(&ghost).is_err());
        assert!(!state.contains(&ParticipantId::from("ghost")));

        assert!(counter.get() > before);
    }

    #[test]
    fn test_activity_updates_media_status() {
        let mut state = state();
        state.join(ParticipantInfo::new("alice", "Alice"), t0()).unwrap();
        state
            .record_activity(&ActivityEvent::new("alice", at(100), ActivityKind::Mute { muted: true }))
            .unwrap();
        state
            .record_activity(&ActivityEvent::new("alice", at(200), ActivityKind::Camera { on: false }))
            .unwrap();
        let snapshot = state.snapshot(at(300));
        assert_eq!(
            snapshot.participants[0].status(),
            crate::types::MediaStatus::AudioVideoOff
        );
    }

    #[test]
    fn test_cycle_produces_report_and_samples() {
        let mut state = state();
        state.join(muted("alice"), t0()).unwrap();
        state.record_delivery(&ack(100, 150)).unwrap();
        state
            .record_activity(&ActivityEvent::new("alice", at(200), ActivityKind::VoiceActivity { active: true }))
            .unwrap();

        let sample = state.sample_tick(at(1000)).unwrap();
        assert!(!sample.degraded);
        assert!((sample.latency_ms - 50.0).abs() < 1e-9);

        let output = state.evaluate(at(1000));
        assert!(output.directive.is_none());
        let report = output.report.unwrap();
        assert_eq!(report.participants.len(), 1);
        // Speech confirmed at 200ms, credited up to 1000ms
        assert!((report.participants[0].speaking_seconds - 0.8).abs() < 1e-9);

        // Same instant again is ignored
        assert_eq!(state.evaluate(at(1000)), CycleOutput::default());
        assert_eq!(state.counters().reports_emitted, 1);
    }

    #[test]
    fn test_speaking_time_bounded_by_horizon() {
        let mut config = AnalyticsConfig::default();
        config.window.engagement_horizon_ms = 10_000;
        config.collector.heartbeat_ms = 5_000;
        let mut state = SessionState::new(SessionId::from("s1"), &config, t0());
        state.join(muted("alice"), t0()).unwrap();
        state
            .record_activity(&ActivityEvent::new("alice", t0(), ActivityKind::VoiceActivity { active: true }))
            .unwrap();

        for second in 1..=32 {
            let now = at(second * 1000);
            state.sample_tick(now);
            let report = state.evaluate(now).report.unwrap();
            let speaking = report.participants[0].speaking_seconds;
            assert!(speaking <= 10.0 + 1e-9, "{speaking}s spoken in a 10s window at {second}s");
            if second >= 10 {
                assert!((speaking - 10.0).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_leave_does_not_alter_other_scores() {
        let mut state = state();
        state.join(muted("alice"), t0()).unwrap();
        state.join(muted("bob"), t0()).unwrap();
        state.join(muted("carol"), t0()).unwrap();

        let voice = |id: &str, ms: i64, active: bool| {
            ActivityEvent::new(id, at(ms), ActivityKind::VoiceActivity { active })
        };
        state.record_activity(&voice("alice", 1000, true)).unwrap();
        state.record_activity(&voice("alice", 31_000, false)).unwrap();
        state.record_activity(&voice("bob", 2000, true)).unwrap();
        state.record_activity(&voice("bob", 12_000, false)).unwrap();
        state
            .record_activity(&ActivityEvent::new(
                "carol",
                at(5000),
                ActivityKind::Reaction { reaction: Reaction::Applause },
            ))
            .unwrap();

        let before = state.evaluate(at(40_000)).report.unwrap();
        assert!(state.leave(&ParticipantId::from("bob")));
        let after = state.evaluate(at(40_001)).report.unwrap();

        assert!(after.score_of(&ParticipantId::from("bob")).is_none());
        assert_eq!(after.participants.len(), 2);
        for id in ["alice", "carol"] {
            let id = ParticipantId::from(id);
            let (b, a) = (before.score_of(&id).unwrap(), after.score_of(&id).unwrap());
            assert!((b.attention_score - a.attention_score).abs() < 1e-9);
            assert!((b.speaking_seconds - a.speaking_seconds).abs() < 1e-9);
        }
        assert_eq!(after.participants[0].participant_id, ParticipantId::from("alice"));
        assert_eq!(after.participants[1].rank, 2);
    }

    #[test]
    fn test_telemetry_gap_counted() {
        let mut state = state();
        state.join(muted("alice"), t0()).unwrap();
        assert!(state.sample_tick(at(1000)).is_none());
        let gap = state.sample_tick(at(2000)).unwrap();
        assert!(gap.degraded);
        assert_eq!(state.counters().telemetry_gaps, 1);
        assert_eq!(state.snapshot(at(2000)).network.degraded_samples, 1);
    }
}
