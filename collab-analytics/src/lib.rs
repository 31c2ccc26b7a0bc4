//! Adaptive quality control and real-time engagement analytics for
//! multi-party media sessions
//!
//! Raw delivery telemetry and participant activity flow through per-session
//! pipelines:
//!
//! - **`TelemetrySampler`**: delivery events to periodic `NetworkSample`s
//! - **`EngagementCollector`**: debounced activity to `EngagementSample`s
//! - **`SessionAggregator`**: sliding windows with incremental statistics
//! - **`QualityDecisionEngine`**: health score and tier hysteresis
//! - **`EngagementScorer`**: attention scores and ranking
//! - **`SessionCoordinator`**: lifecycle, cadences, subscriptions, snapshots
//!
//! ## Usage
//!
//! ```rust,ignore
//! use collab_analytics::{AnalyticsConfig, ParticipantInfo, SessionCoordinator, SessionId};
//!
//! let coordinator = SessionCoordinator::new(AnalyticsConfig::default())?;
//! let session = SessionId::from("standup");
//! coordinator.join(session.clone(), ParticipantInfo::new("alice", "Alice")).await?;
//!
//! let mut events = coordinator.subscribe(&session)?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

mod collector;
mod config;
mod coordinator;
mod error;
mod history;
mod hub;
pub mod metrics;
mod quality;
mod queue;
mod replay;
mod scoring;
mod session;
mod telemetry;
mod types;
mod window;

pub use collector::{ActivityEvent, ActivityKind, EngagementCollector, EngagementSample, Reaction};
pub use config::{
    AnalyticsConfig, CollectorConfig, CoordinatorConfig, HealthWeights, NormalizationBounds,
    QualityConfig, SamplerConfig, ScoringConfig, TierBand, TierThresholds, WindowConfig,
};
pub use coordinator::SessionCoordinator;
pub use error::{Error, Result};
pub use history::{EngagementHistoryRecord, HistorySink, InMemoryHistory, JsonLinesHistory};
pub use hub::{SessionEvent, SubscriberHub, SubscriberId, Subscription};
pub use quality::{HealthGrade, HealthScorer, QualityDecisionEngine, QualityDirective, TransitionReason};
pub use queue::DropOldestQueue;
pub use replay::{parse_events, ReplayEvent, ReplayOutcome, Replayer};
pub use scoring::{EngagementLevel, EngagementReport, EngagementScorer, ParticipantScore};
pub use session::{CycleOutput, SessionCounters, SessionSnapshot, SessionState};
pub use telemetry::{DeliveryEvent, NetworkSample, TelemetrySampler};
pub use types::{MediaStatus, Participant, ParticipantId, ParticipantInfo, QualityTier, SessionId};
pub use window::{
    Accumulator, EngagementAggregate, EngagementWindow, MetricSummary, NetworkAggregate,
    NetworkWindow, RunningStats, SessionAggregator, SlidingWindow, Timestamped,
};
