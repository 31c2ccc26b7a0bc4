//! Telemetry sampling
//!
//! Converts raw packet delivery events from the media transport into one
//! `NetworkSample` per sampling period:
//! - latency: mean ack delay of packets acknowledged in the period
//! - jitter: RFC 3550 running estimate over successive latencies
//! - loss: lost / (acked + lost) within the period
//! - bandwidth: exponentially smoothed throughput
//!
//! When no event arrives for `gap_multiplier * cadence` the sampler emits
//! degraded samples carrying worst-case values instead of repeating the last
//! good measurement.

use crate::config::SamplerConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Raw delivery telemetry reported by the media transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// A packet acknowledged by the far end
    Ack {
        sent_at: DateTime<Utc>,
        acked_at: DateTime<Utc>,
        bytes: u32,
    },
    /// A packet declared lost
    Loss { detected_at: DateTime<Utc> },
}

impl DeliveryEvent {
    /// Time at which the transport observed the event
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Ack { acked_at, .. } => *acked_at,
            Self::Loss { detected_at } => *detected_at,
        }
    }
}

/// One periodic measurement of a session's channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSample {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    /// Fraction of packets lost, in [0, 1]
    pub loss_fraction: f64,
    pub bandwidth_kbps: f64,
    /// Emitted during a telemetry gap with worst-case values
    #[serde(default)]
    pub degraded: bool,
}

impl NetworkSample {
    /// Reject values no real channel can produce
    pub fn validate(&self) -> Result<()> {
        let finite_non_negative = [self.latency_ms, self.jitter_ms, self.bandwidth_kbps]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0);
        if !finite_non_negative {
            return Err(Error::InvalidSample(format!(
                "network sample at {} has negative or non-finite values",
                self.timestamp
            )));
        }
        if !(0.0..=1.0).contains(&self.loss_fraction) {
            return Err(Error::InvalidSample(format!(
                "loss fraction {} outside [0, 1]",
                self.loss_fraction
            )));
        }
        Ok(())
    }
}

/// Counters for the sampling period in progress
#[derive(Debug, Default)]
struct PeriodCounters {
    acked: u32,
    lost: u32,
    bytes: u64,
    latency_sum_ms: f64,
}

impl PeriodCounters {
    const fn is_empty(&self) -> bool {
        self.acked == 0 && self.lost == 0
    }
}

/// Per-session telemetry sampler
pub struct TelemetrySampler {
    session_id: SessionId,
    config: SamplerConfig,

    period: PeriodCounters,
    period_started_at: DateTime<Utc>,

    /// Latest event time, or the sampler start before any event
    last_event_at: DateTime<Utc>,
    last_tick_at: Option<DateTime<Utc>>,
    last_sample: Option<NetworkSample>,

    previous_latency_ms: Option<f64>,
    jitter_ms: f64,
    bandwidth_kbps: f64,
    in_gap: bool,
}

impl TelemetrySampler {
    #[must_use]
    pub fn new(session_id: SessionId, config: SamplerConfig, started_at: DateTime<Utc>) -> Self {
        let bandwidth_kbps = config.initial_bandwidth_kbps;
        Self {
            session_id,
            config,
            period: PeriodCounters::default(),
            period_started_at: started_at,
            last_event_at: started_at,
            last_tick_at: None,
            last_sample: None,
            previous_latency_ms: None,
            jitter_ms: 0.0,
            bandwidth_kbps,
            in_gap: false,
        }
    }

    /// Record one delivery event into the current period
    pub fn record(&mut self, event: &DeliveryEvent) -> Result<()> {
        let at = event.timestamp();
        if let Some(closed_until) = self.last_tick_at {
            if at < closed_until {
                return Err(Error::InvalidSample(format!(
                    "delivery event at {at} precedes closed sampling period ending {closed_until}"
                )));
            }
        }

        match event {
            DeliveryEvent::Ack {
                sent_at,
                acked_at,
                bytes,
            } => {
                if acked_at < sent_at {
                    return Err(Error::InvalidSample(format!(
                        "ack at {acked_at} precedes send at {sent_at}"
                    )));
                }
                let latency_ms = (*acked_at - *sent_at).num_microseconds().unwrap_or(i64::MAX)
                    as f64
                    / 1000.0;

                // RFC 3550 interarrival jitter over successive latencies
                if let Some(previous) = self.previous_latency_ms {
                    let delta = (latency_ms - previous).abs();
                    self.jitter_ms += (delta - self.jitter_ms) / 16.0;
                }
                self.previous_latency_ms = Some(latency_ms);

                self.period.acked += 1;
                self.period.bytes += u64::from(*bytes);
                self.period.latency_sum_ms += latency_ms;
            }
            DeliveryEvent::Loss { .. } => {
                self.period.lost += 1;
            }
        }

        self.last_event_at = self.last_event_at.max(at);
        Ok(())
    }

    /// Close the current period and produce its sample.
    ///
    /// Returns `None` for a tick that does not move time forward, or for a quiet
    /// period before the first measurement while still within the gap allowance.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<NetworkSample> {
        if self.last_tick_at.is_some_and(|last| now <= last) {
            debug!(session_id = %self.session_id, %now, "Ignoring non-monotonic sampler tick");
            return None;
        }

        let sample = if !self.period.is_empty() {
            Some(self.measured_sample(now))
        } else if now - self.last_event_at >= self.config.gap_threshold() {
            Some(self.degraded_sample(now))
        } else {
            // Quiet but within the allowance: carry the last good measurement
            self.last_sample
                .as_ref()
                .filter(|s| !s.degraded)
                .map(|s| NetworkSample {
                    timestamp: now,
                    ..s.clone()
                })
        };

        self.period = PeriodCounters::default();
        self.period_started_at = now;
        self.last_tick_at = Some(now);
        if let Some(sample) = &sample {
            self.last_sample = Some(sample.clone());
        }
        sample
    }

    /// Current smoothed bandwidth estimate
    #[must_use]
    pub const fn bandwidth_kbps(&self) -> f64 {
        self.bandwidth_kbps
    }

    #[must_use]
    pub const fn in_gap(&self) -> bool {
        self.in_gap
    }

    fn measured_sample(&mut self, now: DateTime<Utc>) -> NetworkSample {
        let elapsed_ms = (now - self.period_started_at).num_milliseconds().max(1) as f64;
        let throughput_kbps = (self.period.bytes * 8) as f64 / elapsed_ms;

        // new_estimate = α * old + (1 - α) * observed
        let alpha = self.config.bandwidth_smoothing;
        self.bandwidth_kbps = alpha.mul_add(self.bandwidth_kbps, (1.0 - alpha) * throughput_kbps);

        let latency_ms = if self.period.acked > 0 {
            self.period.latency_sum_ms / f64::from(self.period.acked)
        } else {
            // Only losses this period: keep the last known latency
            self.last_sample
                .as_ref()
                .filter(|s| !s.degraded)
                .map_or(self.config.degraded_latency_ms, |s| s.latency_ms)
        };

        let total = f64::from(self.period.acked + self.period.lost);
        let loss_fraction = f64::from(self.period.lost) / total;

        if self.in_gap {
            info!(session_id = %self.session_id, "Telemetry recovered");
            self.in_gap = false;
        }

        NetworkSample {
            session_id: self.session_id.clone(),
            timestamp: now,
            latency_ms,
            jitter_ms: self.jitter_ms,
            loss_fraction,
            bandwidth_kbps: self.bandwidth_kbps,
            degraded: false,
        }
    }

    fn degraded_sample(&mut self, now: DateTime<Utc>) -> NetworkSample {
        if !self.in_gap {
            warn!(
                session_id = %self.session_id,
                silent_ms = (now - self.last_event_at).num_milliseconds(),
                "Telemetry gap, emitting degraded samples"
            );
            self.in_gap = true;
        }
        metrics::TELEMETRY_GAPS.inc();

        NetworkSample {
            session_id: self.session_id.clone(),
            timestamp: now,
            latency_ms: self.config.degraded_latency_ms,
            jitter_ms: self.config.degraded_jitter_ms,
            loss_fraction: 1.0,
            bandwidth_kbps: 0.0,
            degraded: true,
        }
    }
}
