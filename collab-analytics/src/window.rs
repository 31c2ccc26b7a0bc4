//! Sliding-window aggregation
//!
//! `SlidingWindow` keeps timestamp-ordered entries in a `VecDeque` and an
//! `Accumulator` of running sums updated on every push and eviction, so the
//! per-sample cost does not depend on the horizon. The window always holds
//! exactly the entries with timestamp in `[now - horizon, now]`.
//!
//! Two instantiations are used per session:
//! - `NetworkWindow`: latency, jitter, loss and bandwidth (mean, p95, trend)
//! - `EngagementWindow`: one per participant, speaking/camera time and reactions

use crate::error::{Error, Result};
use crate::collector::EngagementSample;
use crate::telemetry::NetworkSample;
use crate::types::ParticipantId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Entry that can live in a sliding window
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Running aggregate maintained incrementally over window entries.
///
/// `origin` is the fixed reference instant of the window, used to express
/// entry times as small numbers for regression sums.
pub trait Accumulator<T>: Default + Clone {
    fn add(&mut self, entry: &T, origin: DateTime<Utc>);
    fn remove(&mut self, entry: &T, origin: DateTime<Utc>);
}

/// Time-bounded, time-ordered window with incremental aggregation
#[derive(Debug, Clone)]
pub struct SlidingWindow<T, A> {
    horizon: Duration,
    entries: VecDeque<T>,
    acc: A,
    origin: Option<DateTime<Utc>>,
}

impl<T: Timestamped, A: Accumulator<T>> SlidingWindow<T, A> {
    #[must_use]
    pub fn new(horizon: Duration) -> Self {
        Self {
            horizon,
            entries: VecDeque::new(),
            acc: A::default(),
            origin: None,
        }
    }

    /// Append an entry and evict everything older than its timestamp minus the horizon
    pub fn push(&mut self, entry: T) -> Result<()> {
        let at = entry.timestamp();
        if let Some(latest) = self.latest() {
            if at < latest {
                return Err(Error::InvalidSample(format!(
                    "entry at {at} precedes window head at {latest}"
                )));
            }
        }

        // Rebase on an empty window so regression sums stay small
        let origin = match self.origin {
            Some(origin) if !self.entries.is_empty() => origin,
            _ => {
                self.origin = Some(at);
                at
            }
        };

        self.acc.add(&entry, origin);
        self.entries.push_back(entry);
        self.evict(at);
        Ok(())
    }

    /// Drop entries older than `now - horizon`, returning how many were removed
    pub fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.horizon;
        let mut removed = 0;
        while let Some(front) = self.entries.front() {
            if front.timestamp() >= cutoff {
                break;
            }
            if let (Some(entry), Some(origin)) = (self.entries.pop_front(), self.origin) {
                self.acc.remove(&entry, origin);
                removed += 1;
            }
        }
        if self.entries.is_empty() {
            // Exact zero instead of accumulated rounding residue
            self.acc = A::default();
        }
        removed
    }

    /// Incrementally maintained aggregate
    #[must_use]
    pub const fn accumulator(&self) -> &A {
        &self.acc
    }

    /// Aggregate rebuilt from scratch over the current entries
    #[must_use]
    pub fn recompute(&self) -> A {
        let mut acc = A::default();
        if let Some(origin) = self.origin {
            for entry in &self.entries {
                acc.add(entry, origin);
            }
        }
        acc
    }

    pub fn entries(&self) -> impl ExactSizeIterator<Item = &T> + '_ {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn horizon(&self) -> Duration {
        self.horizon
    }

    #[must_use]
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.entries.front().map(Timestamped::timestamp)
    }

    #[must_use]
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.entries.back().map(Timestamped::timestamp)
    }
}

/// Running sums for one metric: mean and least-squares trend in O(1)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    sum: f64,
    sum_t: f64,
    sum_tt: f64,
    sum_tv: f64,
}

impl RunningStats {
    pub fn add(&mut self, t: f64, v: f64) {
        self.count += 1;
        self.sum += v;
        self.sum_t += t;
        self.sum_tt += t * t;
        self.sum_tv += t * v;
    }

    pub fn remove(&mut self, t: f64, v: f64) {
        self.count = self.count.saturating_sub(1);
        self.sum -= v;
        self.sum_t -= t;
        self.sum_tt -= t * t;
        self.sum_tv -= t * v;
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Least-squares slope in units per second, 0 with fewer than two distinct times
    #[must_use]
    pub fn trend(&self) -> f64 {
        let n = self.count as f64;
        let denominator = n.mul_add(self.sum_tt, -(self.sum_t * self.sum_t));
        if self.count < 2 || denominator.abs() < 1e-9 {
            return 0.0;
        }
        n.mul_add(self.sum_tv, -(self.sum_t * self.sum)) / denominator
    }

    /// Compare with another set of sums within a relative tolerance
    #[must_use]
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0);
        self.count == other.count
            && close(self.sum, other.sum)
            && close(self.sum_t, other.sum_t)
            && close(self.sum_tt, other.sum_tt)
            && close(self.sum_tv, other.sum_tv)
    }
}

fn seconds_since(origin: DateTime<Utc>, at: DateTime<Utc>) -> f64 {
    (at - origin).num_milliseconds() as f64 / 1000.0
}

impl Timestamped for NetworkSample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Running sums over network samples
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkAccumulator {
    pub latency: RunningStats,
    pub jitter: RunningStats,
    pub loss: RunningStats,
    pub bandwidth: RunningStats,
    pub degraded: u64,
}

impl Accumulator<NetworkSample> for NetworkAccumulator {
    fn add(&mut self, s: &NetworkSample, origin: DateTime<Utc>) {
        let t = seconds_since(origin, s.timestamp);
        self.latency.add(t, s.latency_ms);
        self.jitter.add(t, s.jitter_ms);
        self.loss.add(t, s.loss_fraction);
        self.bandwidth.add(t, s.bandwidth_kbps);
        if s.degraded {
            self.degraded += 1;
        }
    }

    fn remove(&mut self, s: &NetworkSample, origin: DateTime<Utc>) {
        let t = seconds_since(origin, s.timestamp);
        self.latency.remove(t, s.latency_ms);
        self.jitter.remove(t, s.jitter_ms);
        self.loss.remove(t, s.loss_fraction);
        self.bandwidth.remove(t, s.bandwidth_kbps);
        if s.degraded {
            self.degraded = self.degraded.saturating_sub(1);
        }
    }
}

impl NetworkAccumulator {
    #[must_use]
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        self.degraded == other.degraded
            && self.latency.approx_eq(&other.latency, tolerance)
            && self.jitter.approx_eq(&other.jitter, tolerance)
            && self.loss.approx_eq(&other.loss, tolerance)
            && self.bandwidth.approx_eq(&other.bandwidth, tolerance)
    }
}

/// Mean, 95th percentile and trend (per second) of one metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub p95: f64,
    pub trend: f64,
}

/// Nearest-rank percentile; `values` need not be sorted
fn percentile(mut values: Vec<f64>, pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let rank = (pct * values.len() as f64).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}

/// Network statistics over the current window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAggregate {
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: DateTime<Utc>,
    pub sample_count: usize,
    pub latency_ms: MetricSummary,
    pub jitter_ms: MetricSummary,
    pub loss_fraction: MetricSummary,
    pub bandwidth_kbps: MetricSummary,
    pub degraded_samples: u64,
    /// Start of the current run of consecutive degraded samples
    pub degraded_since: Option<DateTime<Utc>>,
    /// The window has spanned a full horizon since the first sample
    pub full: bool,
}

/// Rolling network statistics for one session
#[derive(Debug, Clone)]
pub struct NetworkWindow {
    window: SlidingWindow<NetworkSample, NetworkAccumulator>,
    first_sample_at: Option<DateTime<Utc>>,
    degraded_since: Option<DateTime<Utc>>,
}

impl NetworkWindow {
    #[must_use]
    pub fn new(horizon: Duration) -> Self {
        Self {
            window: SlidingWindow::new(horizon),
            first_sample_at: None,
            degraded_since: None,
        }
    }

    pub fn push(&mut self, sample: NetworkSample) -> Result<()> {
        sample.validate()?;
        let at = sample.timestamp;
        let degraded = sample.degraded;
        self.window.push(sample)?;

        self.first_sample_at.get_or_insert(at);
        if degraded {
            self.degraded_since.get_or_insert(at);
        } else {
            self.degraded_since = None;
        }
        Ok(())
    }

    pub fn evict(&mut self, now: DateTime<Utc>) -> usize {
        self.window.evict(now)
    }

    #[must_use]
    pub const fn window(&self) -> &SlidingWindow<NetworkSample, NetworkAccumulator> {
        &self.window
    }

    #[must_use]
    pub const fn degraded_since(&self) -> Option<DateTime<Utc>> {
        self.degraded_since
    }

    /// Aggregate as seen at `now`; call `evict(now)` first for an exact window
    #[must_use]
    pub fn aggregate(&self, now: DateTime<Utc>) -> NetworkAggregate {
        let acc = self.window.accumulator();
        let summary = |stats: &RunningStats, pick: fn(&NetworkSample) -> f64| MetricSummary {
            mean: stats.mean(),
            p95: percentile(self.window.entries().map(pick).collect(), 0.95),
            trend: stats.trend(),
        };

        NetworkAggregate {
            window_start: self.window.oldest(),
            window_end: now,
            sample_count: self.window.len(),
            latency_ms: summary(&acc.latency, |s| s.latency_ms),
            jitter_ms: summary(&acc.jitter, |s| s.jitter_ms),
            loss_fraction: summary(&acc.loss, |s| s.loss_fraction),
            bandwidth_kbps: summary(&acc.bandwidth, |s| s.bandwidth_kbps),
            degraded_samples: acc.degraded,
            degraded_since: self.degraded_since,
            full: self
                .first_sample_at
                .is_some_and(|first| now - first >= self.window.horizon()),
        }
    }
}

/// Time credited to one participant between two consecutive samples.
/// `start` is the previous sample, `timestamp` the one closing the slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngagementSlice {
    pub start: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub speaking_ms: i64,
    pub camera_ms: i64,
    pub reactions: u32,
}

impl Timestamped for EngagementSlice {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Integer sums over engagement slices (exact under add/remove)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngagementAccumulator {
    pub speaking_ms: i64,
    pub camera_ms: i64,
    pub reactions: u64,
    pub slices: u64,
}

impl Accumulator<EngagementSlice> for EngagementAccumulator {
    fn add(&mut self, slice: &EngagementSlice, _origin: DateTime<Utc>) {
        self.speaking_ms += slice.speaking_ms;
        self.camera_ms += slice.camera_ms;
        self.reactions += u64::from(slice.reactions);
        self.slices += 1;
    }

    fn remove(&mut self, slice: &EngagementSlice, _origin: DateTime<Utc>) {
        self.speaking_ms -= slice.speaking_ms;
        self.camera_ms -= slice.camera_ms;
        self.reactions = self.reactions.saturating_sub(u64::from(slice.reactions));
        self.slices = self.slices.saturating_sub(1);
    }
}

/// Engagement statistics for one participant over the current window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementAggregate {
    pub participant_id: ParticipantId,
    pub speaking_seconds: f64,
    /// Speaking time over the horizon
    pub active_fraction: f64,
    /// Camera-on time over the horizon
    pub camera_fraction: f64,
    pub reactions: u64,
    pub reactions_per_minute: f64,
}

/// Rolling engagement statistics for one participant
#[derive(Debug, Clone)]
pub struct EngagementWindow {
    participant_id: ParticipantId,
    window: SlidingWindow<EngagementSlice, EngagementAccumulator>,
    last: Option<EngagementSample>,
}

impl EngagementWindow {
    #[must_use]
    pub fn new(participant_id: ParticipantId, horizon: Duration) -> Self {
        Self {
            participant_id,
            window: SlidingWindow::new(horizon),
            last: None,
        }
    }

    /// Credit the interval since the previous sample to the previous state
    pub fn push(&mut self, sample: EngagementSample) -> Result<()> {
        if sample.participant_id != self.participant_id {
            return Err(Error::InvalidSample(format!(
                "sample for {} pushed into window of {}",
                sample.participant_id, self.participant_id
            )));
        }

        let (start, speaking_ms, camera_ms) = match &self.last {
            Some(last) if sample.timestamp < last.timestamp => {
                return Err(Error::InvalidSample(format!(
                    "engagement sample for {} at {} precedes {}",
                    sample.participant_id, sample.timestamp, last.timestamp
                )));
            }
            Some(last) => {
                let span = (sample.timestamp - last.timestamp).num_milliseconds();
                (
                    last.timestamp,
                    if last.speaking { span } else { 0 },
                    if last.camera_on { span } else { 0 },
                )
            }
            None => (sample.timestamp, 0, 0),
        };

        self.window.push(EngagementSlice {
            start,
            timestamp: sample.timestamp,
            speaking_ms,
            camera_ms,
            reactions: u32::from(sample.reaction.is_some()),
        })?;
        self.last = Some(sample);
        Ok(())
    }

    pub fn evict(&mut self, now: DateTime<Utc>) -> usize {
        self.window.evict(now)
    }

    #[must_use]
    pub const fn window(&self) -> &SlidingWindow<EngagementSlice, EngagementAccumulator> {
        &self.window
    }

    /// Aggregate at `now`, including the still-open interval of the latest sample
    #[must_use]
    pub fn aggregate(&self, now: DateTime<Utc>) -> EngagementAggregate {
        let acc = self.window.accumulator();
        let horizon = self.window.horizon();
        let cutoff = now - horizon;
        let mut speaking_ms = acc.speaking_ms;
        let mut camera_ms = acc.camera_ms;

        // Slices are contiguous, so only the oldest ones can begin before the cutoff
        for slice in self.window.entries().take_while(|slice| slice.start < cutoff) {
            let overhang = (cutoff.min(slice.timestamp) - slice.start).num_milliseconds();
            speaking_ms -= overhang.min(slice.speaking_ms);
            camera_ms -= overhang.min(slice.camera_ms);
        }

        if let Some(last) = &self.last {
            let open_from = last.timestamp.max(cutoff);
            let open_ms = (now - open_from).num_milliseconds().max(0);
            if last.speaking {
                speaking_ms += open_ms;
            }
            if last.camera_on {
                camera_ms += open_ms;
            }
        }

        let horizon_ms = horizon.num_milliseconds().max(1) as f64;
        let horizon_minutes = horizon_ms / 60_000.0;

        EngagementAggregate {
            participant_id: self.participant_id.clone(),
            speaking_seconds: speaking_ms as f64 / 1000.0,
            active_fraction: (speaking_ms as f64 / horizon_ms).clamp(0.0, 1.0),
            camera_fraction: (camera_ms as f64 / horizon_ms).clamp(0.0, 1.0),
            reactions: acc.reactions,
            reactions_per_minute: acc.reactions as f64 / horizon_minutes,
        }
    }
}

/// All rolling state of one session: the network window and one engagement
/// window per present participant
#[derive(Debug, Clone)]
pub struct SessionAggregator {
    network: NetworkWindow,
    participants: BTreeMap<ParticipantId, EngagementWindow>,
    engagement_horizon: Duration,
}

impl SessionAggregator {
    #[must_use]
    pub fn new(network_horizon: Duration, engagement_horizon: Duration) -> Self {
        Self {
            network: NetworkWindow::new(network_horizon),
            participants: BTreeMap::new(),
            engagement_horizon,
        }
    }

    pub fn add_participant(&mut self, participant_id: ParticipantId) {
        let horizon = self.engagement_horizon;
        self.participants
            .entry(participant_id.clone())
            .or_insert_with(|| EngagementWindow::new(participant_id, horizon));
    }

    /// Drop all state of a participant
    pub fn remove_participant(&mut self, participant_id: &ParticipantId) -> bool {
        self.participants.remove(participant_id).is_some()
    }

    pub fn push_network(&mut self, sample: NetworkSample) -> Result<()> {
        self.network.push(sample)
    }

    pub fn push_engagement(&mut self, sample: EngagementSample) -> Result<()> {
        let window = self
            .participants
            .get_mut(&sample.participant_id)
            .ok_or_else(|| Error::ParticipantNotFound {
                session: sample.session_id.clone(),
                participant: sample.participant_id.clone(),
            })?;
        window.push(sample)
    }

    pub fn evict(&mut self, now: DateTime<Utc>) {
        self.network.evict(now);
        for window in self.participants.values_mut() {
            window.evict(now);
        }
    }

    #[must_use]
    pub fn network_aggregate(&self, now: DateTime<Utc>) -> NetworkAggregate {
        self.network.aggregate(now)
    }

    #[must_use]
    pub fn engagement_aggregate(&self, participant_id: &ParticipantId, now: DateTime<Utc>) -> Option<EngagementAggregate> {
        self.participants.get(participant_id).map(|w| w.aggregate(now))
    }

    /// Aggregates for every participant, ordered by participant id
    #[must_use]
    pub fn engagement_aggregates(&self, now: DateTime<Utc>) -> Vec<EngagementAggregate> {
        self.participants.values().map(|w| w.aggregate(now)).collect()
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}
