//! Offline replay of recorded session event logs
//!
//! Drives a `SessionState` on virtual time: sampling and evaluation ticks are
//! interleaved with the recorded events at the configured cadences, so the
//! same log always produces the same directives and reports.

use crate::collector::ActivityEvent;
use crate::config::AnalyticsConfig;
use crate::error::{Error, Result};
use crate::hub::SessionEvent;
use crate::session::{SessionSnapshot, SessionState};
use crate::telemetry::DeliveryEvent;
use crate::types::{ParticipantId, ParticipantInfo, SessionId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use tracing::{debug, info, warn};

/// One line of an event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReplayEvent {
    Join {
        at: DateTime<Utc>,
        participant: ParticipantInfo,
    },
    Leave {
        at: DateTime<Utc>,
        participant_id: ParticipantId,
    },
    Delivery { delivery: DeliveryEvent },
    Activity { activity: ActivityEvent },
}

impl ReplayEvent {
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Join { at, .. } | Self::Leave { at, .. } => *at,
            Self::Delivery { delivery } => delivery.timestamp(),
            Self::Activity { activity } => activity.timestamp,
        }
    }
}

/// Parse a JSON-lines event log, skipping blank lines and `#` comments
pub fn parse_events<R: BufRead>(reader: R) -> Result<Vec<ReplayEvent>> {
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.map_err(|e| Error::MalformedLog {
            line: line_no,
            message: e.to_string(),
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(trimmed).map_err(|e| Error::MalformedLog {
            line: line_no,
            message: e.to_string(),
        })?;
        events.push(event);
    }
    Ok(events)
}

/// What a replay produced
#[derive(Debug, Clone, Default)]
pub struct ReplayOutcome {
    /// Directives and reports in emission order
    pub events: Vec<SessionEvent>,
    /// State of the session still open at the end, if any
    pub final_snapshot: Option<SessionSnapshot>,
    /// Sessions that ended because their last participant left
    pub sessions_ended: usize,
    /// Log entries that could not be applied
    pub rejected: usize,
}

struct Clock {
    next_sample: DateTime<Utc>,
    next_eval: DateTime<Utc>,
}

pub struct Replayer {
    session_id: SessionId,
    config: AnalyticsConfig,
}

impl Replayer {
    pub fn new(session_id: SessionId, config: AnalyticsConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Configuration(errors.join("; ")))?;
        Ok(Self { session_id, config })
    }

    fn cadence(&self) -> Duration {
        Duration::milliseconds(self.config.sampler.cadence_ms as i64)
    }

    fn evaluation_interval(&self) -> Duration {
        Duration::milliseconds(self.config.coordinator.evaluation_interval_ms as i64)
    }

    /// Replay `events` and keep ticking one evaluation interval past the last one
    #[must_use]
    pub fn run(&self, events: &[ReplayEvent]) -> ReplayOutcome {
        let end = events
            .iter()
            .map(ReplayEvent::timestamp)
            .max()
            .map(|last| last + self.evaluation_interval());
        self.run_until(events, end)
    }

    /// Replay `events`, then advance virtual time up to `end`
    #[must_use]
    pub fn run_until(&self, events: &[ReplayEvent], end: Option<DateTime<Utc>>) -> ReplayOutcome {
        let mut ordered: Vec<&ReplayEvent> = events.iter().collect();
        // Stable, so same-instant entries keep their log order
        ordered.sort_by_key(|event| event.timestamp());

        let mut outcome = ReplayOutcome::default();
        let mut session: Option<(SessionState, Clock)> = None;

        for event in ordered {
            let at = event.timestamp();
            if let Some((state, clock)) = session.as_mut() {
                self.advance(state, clock, at, &mut outcome);
            }

            match event {
                ReplayEvent::Join { participant, .. } => {
                    let (state, _) = session.get_or_insert_with(|| self.start(at));
                    if let Err(e) = state.join(participant.clone(), at) {
                        warn!(error = %e, "Replayed join rejected");
                        outcome.rejected += 1;
                    }
                }
                ReplayEvent::Leave { participant_id, .. } => {
                    let Some((state, _)) = session.as_mut() else {
                        outcome.rejected += 1;
                        continue;
                    };
                    if !state.leave(participant_id) {
                        outcome.rejected += 1;
                    } else if state.is_empty() {
                        info!(session_id = %self.session_id, %at, "Replayed session ended");
                        outcome.sessions_ended += 1;
                        session = None;
                    }
                }
                ReplayEvent::Delivery { delivery } => {
                    let applied = session
                        .as_mut()
                        .is_some_and(|(state, _)| state.record_delivery(delivery).is_ok());
                    if !applied {
                        outcome.rejected += 1;
                    }
                }
                ReplayEvent::Activity { activity } => {
                    let applied = session
                        .as_mut()
                        .is_some_and(|(state, _)| state.record_activity(activity).is_ok());
                    if !applied {
                        outcome.rejected += 1;
                    }
                }
            }
        }

        if let Some((mut state, mut clock)) = session {
            if let Some(end) = end {
                self.advance(&mut state, &mut clock, end, &mut outcome);
                outcome.final_snapshot = Some(state.snapshot(end));
            }
        }

        debug!(
            session_id = %self.session_id,
            emitted = outcome.events.len(),
            rejected = outcome.rejected,
            "Replay finished"
        );
        outcome
    }

    fn start(&self, at: DateTime<Utc>) -> (SessionState, Clock) {
        info!(session_id = %self.session_id, %at, "Replayed session started");
        (
            SessionState::new(self.session_id.clone(), &self.config, at),
            Clock {
                next_sample: at + self.cadence(),
                next_eval: at + self.evaluation_interval(),
            },
        )
    }

    /// Run every tick due at or before `to`; samples go before evaluations
    /// scheduled for the same instant
    fn advance(&self, state: &mut SessionState, clock: &mut Clock, to: DateTime<Utc>, outcome: &mut ReplayOutcome) {
        loop {
            let sample_due = clock.next_sample <= to;
            let eval_due = clock.next_eval <= to;
            if sample_due && clock.next_sample <= clock.next_eval {
                state.sample_tick(clock.next_sample);
                clock.next_sample += self.cadence();
            } else if eval_due {
                let output = state.evaluate(clock.next_eval);
                outcome
                    .events
                    .extend(output.directive.map(SessionEvent::Quality));
                outcome
                    .events
                    .extend(output.report.map(SessionEvent::Engagement));
                clock.next_eval += self.evaluation_interval();
            } else if sample_due {
                state.sample_tick(clock.next_sample);
                clock.next_sample += self.cadence();
            } else {
                break;
            }
        }
    }
}
