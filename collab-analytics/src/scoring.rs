//! Engagement scoring
//!
//! Blends speaking share, camera time and reaction rate into an attention
//! score in [0, 100] and ranks participants every evaluation cycle.

use crate::config::ScoringConfig;
use crate::types::{Participant, ParticipantId, SessionId};
use crate::window::EngagementAggregate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Colour band of an attention score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementLevel {
    High,
    Moderate,
    Low,
}

impl EngagementLevel {
    #[must_use]
    pub fn from_score(attention: f64) -> Self {
        if attention > 80.0 {
            Self::High
        } else if attention > 60.0 {
            Self::Moderate
        } else {
            Self::Low
        }
    }
}

/// One ranked entry of an engagement report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantScore {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub speaking_seconds: f64,
    pub active_fraction: f64,
    pub camera_fraction: f64,
    pub reactions_per_minute: f64,
    pub attention_score: f64,
    pub level: EngagementLevel,
    /// 1-based position in the ranking
    pub rank: usize,
}

/// Ranked engagement of all present participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementReport {
    pub session_id: SessionId,
    pub window_end: DateTime<Utc>,
    pub participants: Vec<ParticipantScore>,
    pub average_attention: f64,
    pub most_active_speaker: Option<ParticipantId>,
}

impl EngagementReport {
    #[must_use]
    pub fn score_of(&self, participant_id: &ParticipantId) -> Option<&ParticipantScore> {
        self.participants.iter().find(|p| &p.participant_id == participant_id)
    }
}

#[derive(Debug, Clone)]
pub struct EngagementScorer {
    config: ScoringConfig,
}

impl EngagementScorer {
    #[must_use]
    pub const fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Attention score in [0, 100]
    #[must_use]
    pub fn attention(&self, aggregate: &EngagementAggregate) -> f64 {
        let c = &self.config;
        let af = aggregate.active_fraction.max(0.0);
        let rpm = aggregate.reactions_per_minute.max(0.0);

        let speaking = af / (af + c.speaking_half_point);
        let camera = aggregate.camera_fraction.clamp(0.0, 1.0);
        let reactions = rpm / (rpm + c.reaction_half_rate_per_min);

        let blend = c.reaction_weight.mul_add(
            reactions,
            c.speaking_weight.mul_add(speaking, c.camera_weight * camera),
        );
        100.0 * blend.clamp(0.0, 1.0)
    }

    /// Rank every aggregate whose participant is still present.
    ///
    /// Ordering is descending attention, ties broken by join order, so the
    /// output only depends on the inputs.
    #[must_use]
    pub fn report(
        &self,
        session_id: &SessionId,
        window_end: DateTime<Utc>,
        aggregates: &[EngagementAggregate],
        participants: &BTreeMap<ParticipantId, Participant>,
    ) -> EngagementReport {
        let mut scored: Vec<(u64, ParticipantScore)> = aggregates
            .iter()
            .filter_map(|agg| {
                let participant = participants.get(&agg.participant_id)?;
                let attention_score = self.attention(agg);
                Some((
                    participant.join_order,
                    ParticipantScore {
                        participant_id: agg.participant_id.clone(),
                        display_name: participant.display_name.clone(),
                        speaking_seconds: agg.speaking_seconds,
                        active_fraction: agg.active_fraction,
                        camera_fraction: agg.camera_fraction,
                        reactions_per_minute: agg.reactions_per_minute,
                        attention_score,
                        level: EngagementLevel::from_score(attention_score),
                        rank: 0,
                    },
                ))
            })
            .collect();

        scored.sort_by(|(a_order, a), (b_order, b)| {
            b.attention_score
                .total_cmp(&a.attention_score)
                .then_with(|| a_order.cmp(b_order))
        });

        let most_active_speaker = scored
            .iter()
            .filter(|(_, s)| s.speaking_seconds > 0.0)
            .max_by(|(a_order, a), (b_order, b)| {
                match a.speaking_seconds.total_cmp(&b.speaking_seconds) {
                    // Earlier joiner wins a tie, so it must compare as greater
                    Ordering::Equal => b_order.cmp(a_order),
                    other => other,
                }
            })
            .map(|(_, s)| s.participant_id.clone());

        let participants: Vec<ParticipantScore> = scored
            .into_iter()
            .enumerate()
            .map(|(i, (_, mut score))| {
                score.rank = i + 1;
                score
            })
            .collect();

        let average_attention = if participants.is_empty() {
            0.0
        } else {
            participants.iter().map(|p| p.attention_score).sum::<f64>() / participants.len() as f64
        };

        EngagementReport {
            session_id: session_id.clone(),
            window_end,
            participants,
            average_attention,
            most_active_speaker,
        }
    }
}
