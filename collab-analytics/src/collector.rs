//! Engagement signal collection
//!
//! Turns raw voice-activity, camera, mute and reaction events into
//! `EngagementSample`s. Voice activity is debounced: a participant only counts
//! as speaking once voice activity has lasted `voice_debounce_ms`, shorter
//! bursts are discarded as noise. Samples are emitted on every state change and
//! at least every `heartbeat_ms` while a participant is speaking or on camera.

use crate::config::CollectorConfig;
use crate::error::{Error, Result};
use crate::types::{Participant, ParticipantId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

/// Reaction sent by a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reaction {
    ThumbsUp,
    Applause,
    Laugh,
    Heart,
    RaiseHand,
}

/// Kind of raw activity signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    VoiceActivity { active: bool },
    Camera { on: bool },
    Mute { muted: bool },
    Reaction { reaction: Reaction },
}

/// Raw activity event reported by the media transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub participant_id: ParticipantId,
    pub timestamp: DateTime<Utc>,
    pub kind: ActivityKind,
}

impl ActivityEvent {
    pub fn new(participant_id: impl Into<ParticipantId>, timestamp: DateTime<Utc>, kind: ActivityKind) -> Self {
        Self {
            participant_id: participant_id.into(),
            timestamp,
            kind,
        }
    }
}

/// Participant state at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementSample {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub timestamp: DateTime<Utc>,
    pub speaking: bool,
    pub camera_on: bool,
    pub reaction: Option<Reaction>,
}

#[derive(Debug)]
struct SignalState {
    muted: bool,
    camera_on: bool,
    speaking: bool,
    /// Start of voice activity not yet long enough to count as speech
    voice_pending_since: Option<DateTime<Utc>>,
    last_event_at: DateTime<Utc>,
    last_emitted_at: DateTime<Utc>,
}

impl SignalState {
    const fn is_active(&self) -> bool {
        self.speaking || self.camera_on
    }
}

/// Per-session engagement signal collector
pub struct EngagementCollector {
    session_id: SessionId,
    config: CollectorConfig,
    participants: BTreeMap<ParticipantId, SignalState>,
}

impl EngagementCollector {
    #[must_use]
    pub const fn new(session_id: SessionId, config: CollectorConfig) -> Self {
        Self {
            session_id,
            config,
            participants: BTreeMap::new(),
        }
    }

    /// Start tracking a participant. Returns the baseline sample at join time.
    pub fn add_participant(&mut self, participant: &Participant) -> EngagementSample {
        let at = participant.joined_at;
        self.participants.insert(
            participant.id.clone(),
            SignalState {
                muted: participant.muted,
                camera_on: participant.camera_on,
                speaking: false,
                voice_pending_since: None,
                last_event_at: at,
                last_emitted_at: at,
            },
        );
        EngagementSample {
            session_id: self.session_id.clone(),
            participant_id: participant.id.clone(),
            timestamp: at,
            speaking: false,
            camera_on: participant.camera_on,
            reaction: None,
        }
    }

    pub fn remove_participant(&mut self, participant_id: &ParticipantId) -> bool {
        self.participants.remove(participant_id).is_some()
    }

    #[must_use]
    pub fn is_speaking(&self, participant_id: &ParticipantId) -> bool {
        self.participants.get(participant_id).is_some_and(|s| s.speaking)
    }

    /// Apply one raw event, returning the samples it produced
    pub fn record(&mut self, event: &ActivityEvent) -> Result<Vec<EngagementSample>> {
        let session_id = self.session_id.clone();
        let debounce = self.config.voice_debounce();
        let state = self
            .participants
            .get_mut(&event.participant_id)
            .ok_or_else(|| Error::ParticipantNotFound {
                session: session_id.clone(),
                participant: event.participant_id.clone(),
            })?;

        let at = event.timestamp;
        if at < state.last_event_at {
            return Err(Error::InvalidSample(format!(
                "activity for {} at {at} precedes previous event at {}",
                event.participant_id, state.last_event_at
            )));
        }
        state.last_event_at = at;

        let mut out = Vec::new();
        let emit = |state: &mut SignalState, at: DateTime<Utc>, reaction: Option<Reaction>| {
            let at = at.max(state.last_emitted_at);
            state.last_emitted_at = at;
            EngagementSample {
                session_id: session_id.clone(),
                participant_id: event.participant_id.clone(),
                timestamp: at,
                speaking: state.speaking,
                camera_on: state.camera_on,
                reaction,
            }
        };

        // Voice that has been active long enough becomes speech first
        if let Some(since) = state.voice_pending_since {
            if at - since >= debounce {
                state.voice_pending_since = None;
                state.speaking = true;
                out.push(emit(state, since, None));
            }
        }

        match &event.kind {
            ActivityKind::VoiceActivity { active: true } => {
                if !state.muted && !state.speaking && state.voice_pending_since.is_none() {
                    state.voice_pending_since = Some(at);
                }
            }
            ActivityKind::VoiceActivity { active: false } => {
                if state.voice_pending_since.take().is_some() {
                    trace!(
                        session_id = %session_id,
                        participant_id = %event.participant_id,
                        "Discarded voice burst shorter than debounce"
                    );
                }
                if state.speaking {
                    state.speaking = false;
                    out.push(emit(state, at, None));
                }
            }
            ActivityKind::Mute { muted } => {
                state.muted = *muted;
                if *muted {
                    state.voice_pending_since = None;
                    if state.speaking {
                        state.speaking = false;
                        out.push(emit(state, at, None));
                    }
                }
            }
            ActivityKind::Camera { on } => {
                if state.camera_on != *on {
                    state.camera_on = *on;
                    out.push(emit(state, at, None));
                }
            }
            ActivityKind::Reaction { reaction } => {
                out.push(emit(state, at, Some(*reaction)));
            }
        }

        Ok(out)
    }

    /// Confirm pending speech and emit heartbeats for active participants
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<EngagementSample> {
        let debounce = self.config.voice_debounce();
        let heartbeat = self.config.heartbeat();
        let mut out = Vec::new();

        for (participant_id, state) in &mut self.participants {
            if let Some(since) = state.voice_pending_since {
                if now - since >= debounce {
                    state.voice_pending_since = None;
                    state.speaking = true;
                    let at = since.max(state.last_emitted_at);
                    state.last_emitted_at = at;
                    out.push(EngagementSample {
                        session_id: self.session_id.clone(),
                        participant_id: participant_id.clone(),
                        timestamp: at,
                        speaking: true,
                        camera_on: state.camera_on,
                        reaction: None,
                    });
                }
            }

            if state.is_active() && now - state.last_emitted_at >= heartbeat {
                state.last_emitted_at = now;
                out.push(EngagementSample {
                    session_id: self.session_id.clone(),
                    participant_id: participant_id.clone(),
                    timestamp: now,
                    speaking: state.speaking,
                    camera_on: state.camera_on,
                    reaction: None,
                });
            }
        }

        out
    }
}
