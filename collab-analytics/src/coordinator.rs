//! Session coordinator
//!
//! Owns the session registry and one task per session. The task is the only
//! writer of its `SessionState`: it drains the ingest queue, runs the sampling
//! and evaluation cadences, and publishes an immutable snapshot after every
//! change. Readers load the latest snapshot without locking.

use crate::collector::ActivityEvent;
use crate::config::AnalyticsConfig;
use crate::error::{Error, Result};
use crate::history::{EngagementHistoryRecord, HistorySink};
use crate::hub::{SubscriberHub, Subscription};
use crate::metrics;
use crate::queue::DropOldestQueue;
use crate::session::{SessionSnapshot, SessionState};
use crate::telemetry::DeliveryEvent;
use crate::types::{ParticipantId, ParticipantInfo, SessionId};
use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

type Registry = DashMap<SessionId, Arc<SessionHandle>>;

/// Raw event waiting in a session's ingest queue
#[derive(Debug, Clone)]
enum IngestEvent {
    Delivery(DeliveryEvent),
    Activity(ActivityEvent),
}

impl IngestEvent {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Delivery(_) => "delivery",
            Self::Activity(_) => "activity",
        }
    }
}

enum Command {
    Join {
        info: ParticipantInfo,
        reply: oneshot::Sender<Result<bool>>,
    },
    Leave {
        participant_id: ParticipantId,
        reply: oneshot::Sender<LeaveOutcome>,
    },
}

#[derive(Debug, Clone, Copy)]
struct LeaveOutcome {
    removed: bool,
    session_ended: bool,
}

/// Shared side of a running session
struct SessionHandle {
    id: SessionId,
    ingest: DropOldestQueue<IngestEvent>,
    commands: mpsc::Sender<Command>,
    snapshot: ArcSwap<SessionSnapshot>,
    hub: SubscriberHub,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    fn ingest(&self, event: IngestEvent) -> Result<()> {
        match self.ingest.push(event) {
            Ok(Some(displaced)) => {
                metrics::INGEST_DROPPED
                    .with_label_values(&[displaced.kind()])
                    .inc();
                debug!(session_id = %self.id, kind = displaced.kind(), "Ingest queue full, dropped oldest event");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(_) => Err(Error::SessionClosed(self.id.clone())),
        }
    }

    async fn join_task(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(session_id = %self.id, error = %e, "Session task failed");
            }
        }
    }
}

/// Entry point for the rest of the application: lifecycle, ingestion,
/// subscriptions and snapshots for every live session
pub struct SessionCoordinator {
    config: Arc<AnalyticsConfig>,
    sessions: Arc<Registry>,
    history: Option<Arc<dyn HistorySink>>,
    shutdown: CancellationToken,
}

impl SessionCoordinator {
    pub fn new(config: AnalyticsConfig) -> Result<Arc<Self>> {
        Self::build(config, None)
    }

    /// Coordinator that also hands every engagement report to `history`
    pub fn with_history(config: AnalyticsConfig, history: Arc<dyn HistorySink>) -> Result<Arc<Self>> {
        Self::build(config, Some(history))
    }

    fn build(config: AnalyticsConfig, history: Option<Arc<dyn HistorySink>>) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|errors| Error::Configuration(errors.join("; ")))?;

        info!(
            evaluation_interval_ms = config.coordinator.evaluation_interval_ms,
            sample_cadence_ms = config.sampler.cadence_ms,
            max_sessions = config.coordinator.max_sessions,
            history = history.is_some(),
            "Session coordinator initialized"
        );

        Ok(Arc::new(Self {
            config: Arc::new(config),
            sessions: Arc::new(DashMap::new()),
            history,
            shutdown: CancellationToken::new(),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    /// Add a participant, creating the session on first join.
    /// Returns `false` if the participant was already present.
    pub async fn join(&self, session_id: SessionId, info: ParticipantInfo) -> Result<bool> {
        // A session that emptied concurrently refuses the command; retry once
        // against a fresh one
        for _ in 0..2 {
            let handle = self.get_or_create(&session_id)?;
            let (reply, response) = oneshot::channel();
            let command = Command::Join {
                info: info.clone(),
                reply,
            };
            if handle.commands.send(command).await.is_err() {
                self.forget(&handle);
                continue;
            }
            match response.await {
                Ok(result) => return result,
                Err(_) => self.forget(&handle),
            }
        }
        Err(Error::SessionClosed(session_id))
    }

    /// Remove a participant; the session ends when its last participant leaves
    pub async fn leave(&self, session_id: &SessionId, participant_id: &ParticipantId) -> Result<bool> {
        let handle = self.handle(session_id)?;
        let (reply, response) = oneshot::channel();
        handle
            .commands
            .send(Command::Leave {
                participant_id: participant_id.clone(),
                reply,
            })
            .await
            .map_err(|_| Error::SessionClosed(session_id.clone()))?;
        let outcome = response
            .await
            .map_err(|_| Error::SessionClosed(session_id.clone()))?;

        if outcome.session_ended {
            self.forget(&handle);
            handle.join_task().await;
        }
        Ok(outcome.removed)
    }

    /// Stop a session, letting its in-flight cycle finish
    pub async fn end_session(&self, session_id: &SessionId) -> Result<()> {
        let (_, handle) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.clone()))?;
        handle.cancel.cancel();
        handle.join_task().await;
        Ok(())
    }

    /// Stop every session
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        self.sessions.clear();
        for handle in handles {
            handle.join_task().await;
        }
        info!("Session coordinator shut down");
    }

    /// Queue a delivery event; never waits
    pub fn ingest_delivery(&self, session_id: &SessionId, event: DeliveryEvent) -> Result<()> {
        self.handle(session_id)?.ingest(IngestEvent::Delivery(event))
    }

    /// Queue an activity event; never waits
    pub fn ingest_activity(&self, session_id: &SessionId, event: ActivityEvent) -> Result<()> {
        self.handle(session_id)?.ingest(IngestEvent::Activity(event))
    }

    pub fn subscribe(&self, session_id: &SessionId) -> Result<Subscription> {
        self.handle(session_id)?.hub.subscribe()
    }

    /// Latest committed snapshot
    pub fn current_state(&self, session_id: &SessionId) -> Result<Arc<SessionSnapshot>> {
        Ok(self.handle(session_id)?.snapshot.load_full())
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    fn handle(&self, session_id: &SessionId) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::SessionNotFound(session_id.clone()))
    }

    fn forget(&self, handle: &Arc<SessionHandle>) {
        self.sessions
            .remove_if(&handle.id, |_, current| Arc::ptr_eq(current, handle));
    }

    fn get_or_create(&self, session_id: &SessionId) -> Result<Arc<SessionHandle>> {
        if let Some(entry) = self.sessions.get(session_id) {
            return Ok(Arc::clone(entry.value()));
        }
        if self.shutdown.is_cancelled() {
            return Err(Error::SessionClosed(session_id.clone()));
        }

        // Enforce session limit (0 = unlimited)
        let max_sessions = self.config.coordinator.max_sessions;
        if max_sessions > 0 && self.sessions.len() >= max_sessions {
            warn!(
                current_sessions = self.sessions.len(),
                max_sessions,
                "Session limit reached"
            );
            return Err(Error::LimitReached(format!(
                "maximum of {max_sessions} sessions reached"
            )));
        }

        let handle = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| self.spawn_session(session_id.clone()))
            .clone();
        Ok(handle)
    }

    fn spawn_session(&self, session_id: SessionId) -> Arc<SessionHandle> {
        let now = Utc::now();
        let state = SessionState::new(session_id.clone(), &self.config, now);
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let handle = Arc::new(SessionHandle {
            id: session_id.clone(),
            ingest: DropOldestQueue::new(self.config.coordinator.ingest_queue_capacity),
            commands,
            snapshot: ArcSwap::from_pointee(state.snapshot(now)),
            hub: SubscriberHub::new(session_id.clone(), &self.config.coordinator),
            cancel: self.shutdown.child_token(),
            task: Mutex::new(None),
        });

        let task = SessionTask {
            state,
            handle: Arc::clone(&handle),
            commands: command_rx,
            registry: Arc::clone(&self.sessions),
            history: self.history.clone(),
            config: Arc::clone(&self.config),
            seen_dropped: 0,
        };
        *handle.task.lock() = Some(tokio::spawn(task.run()));

        metrics::ACTIVE_SESSIONS.inc();
        info!(session_id = %session_id, "Session started");
        handle
    }
}

enum Step {
    Cancelled,
    Command(Command),
    Sample,
    Evaluate,
    Ingest(IngestEvent),
}

/// Single writer of one session
struct SessionTask {
    state: SessionState,
    handle: Arc<SessionHandle>,
    commands: mpsc::Receiver<Command>,
    registry: Arc<Registry>,
    history: Option<Arc<dyn HistorySink>>,
    config: Arc<AnalyticsConfig>,
    seen_dropped: u64,
}

impl SessionTask {
    async fn run(mut self) {
        let mut sample_timer = interval(self.config.sampler.cadence());
        let mut eval_timer = interval(self.config.coordinator.evaluation_interval());
        sample_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        eval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately
        sample_timer.tick().await;
        eval_timer.tick().await;

        let cancel = self.handle.cancel.clone();
        loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Cancelled,
                Some(command) = self.commands.recv() => Step::Command(command),
                _ = sample_timer.tick() => Step::Sample,
                _ = eval_timer.tick() => Step::Evaluate,
                Some(event) = self.handle.ingest.pop() => Step::Ingest(event),
            };

            match step {
                Step::Cancelled => {
                    debug!(session_id = %self.handle.id, "Session cancelled");
                    break;
                }
                Step::Command(command) => {
                    let ended = self.apply_command(command);
                    self.publish_snapshot();
                    if ended {
                        break;
                    }
                }
                Step::Sample => {
                    self.drain_ingest();
                    self.state.sample_tick(Utc::now());
                    self.publish_snapshot();
                }
                Step::Evaluate => {
                    self.drain_ingest();
                    self.evaluate().await;
                    self.publish_snapshot();
                }
                Step::Ingest(event) => self.apply_ingest(event),
            }
        }

        self.finish();
    }

    /// Returns true when the session has become empty and must end
    fn apply_command(&mut self, command: Command) -> bool {
        match command {
            Command::Join { info, reply } => {
                let result = self.state.join(info, Utc::now());
                if let Err(e) = &result {
                    warn!(session_id = %self.handle.id, error = %e, "Join rejected");
                }
                let _ = reply.send(result);
                false
            }
            Command::Leave {
                participant_id,
                reply,
            } => {
                let removed = self.state.leave(&participant_id);
                let session_ended = removed && self.state.is_empty();
                let _ = reply.send(LeaveOutcome {
                    removed,
                    session_ended,
                });
                session_ended
            }
        }
    }

    fn apply_ingest(&mut self, event: IngestEvent) {
        // Rejected input is counted and logged inside the session state
        let _ = match &event {
            IngestEvent::Delivery(delivery) => self.state.record_delivery(delivery),
            IngestEvent::Activity(activity) => self.state.record_activity(activity),
        };
    }

    fn drain_ingest(&mut self) {
        while let Some(event) = self.handle.ingest.try_pop() {
            self.apply_ingest(event);
        }
        let dropped = self.handle.ingest.dropped();
        if dropped > self.seen_dropped {
            self.state.note_ingest_dropped(dropped - self.seen_dropped);
            self.seen_dropped = dropped;
        }
    }

    async fn evaluate(&mut self) {
        let output = self.state.evaluate(Utc::now());

        if let Some(directive) = &output.directive {
            let delivered = self.handle.hub.publish_directive(directive).await;
            debug!(
                session_id = %self.handle.id,
                to = %directive.to,
                delivered,
                "Quality directive published"
            );
        }

        if let Some(report) = &output.report {
            self.handle.hub.publish_report(report);
            if let Some(history) = &self.history {
                let records = EngagementHistoryRecord::from_report(report);
                if !records.is_empty() {
                    if let Err(e) = history.record(records).await {
                        warn!(session_id = %self.handle.id, error = %e, "Failed to persist engagement history");
                    }
                }
            }
        }
    }

    fn publish_snapshot(&self) {
        self.handle
            .snapshot
            .store(Arc::new(self.state.snapshot(Utc::now())));
    }

    fn finish(mut self) {
        self.handle.ingest.close();
        self.drain_ingest();
        self.publish_snapshot();
        self.handle.hub.close();

        self.registry
            .remove_if(&self.handle.id, |_, current| Arc::ptr_eq(current, &self.handle));
        metrics::ACTIVE_SESSIONS.dec();

        let counters = self.state.counters();
        info!(
            session_id = %self.handle.id,
            directives = counters.directives_emitted,
            reports = counters.reports_emitted,
            invalid_samples = counters.invalid_samples,
            ingest_dropped = counters.ingest_dropped,
            "Session ended"
        );
    }
}
