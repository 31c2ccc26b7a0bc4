//! Per-session subscriber hub
//!
//! Every subscriber gets two bounded channels:
//! - quality directives: senders wait with a timeout and retry, a subscriber
//!   that keeps timing out is marked stale and dropped
//! - engagement reports: drop-oldest ring, producers never wait

use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::quality::QualityDirective;
use crate::queue::DropOldestQueue;
use crate::scoring::EngagementReport;
use crate::types::SessionId;
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{debug, info, warn};

/// Subscriber connection identifier
pub type SubscriberId = String;

/// Item of a session subscription stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Quality(QualityDirective),
    Engagement(EngagementReport),
}

impl SessionEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Quality(_) => "quality",
            Self::Engagement(_) => "engagement",
        }
    }
}

struct Subscriber {
    directives: mpsc::Sender<QualityDirective>,
    reports: Arc<DropOldestQueue<EngagementReport>>,
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        // Lets the receiving side finish once it has drained
        self.reports.close();
    }
}

/// Fan-out of one session's directives and reports
pub struct SubscriberHub {
    session_id: SessionId,
    subscribers: DashMap<SubscriberId, Subscriber>,
    directive_capacity: usize,
    report_capacity: usize,
    send_timeout: Duration,
    send_retries: u32,
    closed: AtomicBool,
}

impl SubscriberHub {
    #[must_use]
    pub fn new(session_id: SessionId, config: &CoordinatorConfig) -> Self {
        Self {
            session_id,
            subscribers: DashMap::new(),
            directive_capacity: config.directive_channel_capacity.max(1),
            report_capacity: config.engagement_channel_capacity.max(1),
            send_timeout: config.directive_send_timeout(),
            send_retries: config.directive_send_retries,
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> Result<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SessionClosed(self.session_id.clone()));
        }

        let id: SubscriberId = nanoid::nanoid!();
        let (tx, rx) = mpsc::channel(self.directive_capacity);
        let reports = Arc::new(DropOldestQueue::new(self.report_capacity));

        self.subscribers.insert(
            id.clone(),
            Subscriber {
                directives: tx,
                reports: reports.clone(),
            },
        );

        // close() may have run between the check and the insert
        if self.closed.load(Ordering::Acquire) {
            self.subscribers.remove(&id);
            return Err(Error::SessionClosed(self.session_id.clone()));
        }

        info!(session_id = %self.session_id, subscriber_id = %id, "Subscriber attached");
        Ok(Subscription {
            id,
            session_id: self.session_id.clone(),
            directives: rx,
            reports,
            directives_done: false,
            reports_done: false,
        })
    }

    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        let removed = self.subscribers.remove(subscriber_id).is_some();
        if removed {
            debug!(session_id = %self.session_id, subscriber_id = %subscriber_id, "Subscriber detached");
        }
        removed
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver a directive to every current subscriber, waiting on full
    /// channels. Returns the number of subscribers that received it.
    pub async fn publish_directive(&self, directive: &QualityDirective) -> usize {
        let targets: Vec<(SubscriberId, mpsc::Sender<QualityDirective>)> = self
            .subscribers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().directives.clone()))
            .collect();

        let outcomes = futures::future::join_all(
            targets
                .iter()
                .map(|(id, tx)| self.deliver_directive(id, tx, directive)),
        )
        .await;

        let mut delivered = 0;
        for ((id, _), outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(()) => delivered += 1,
                Err(Error::SubscriberBackpressure(reason)) => {
                    metrics::STALE_SUBSCRIBERS.inc();
                    warn!(
                        session_id = %self.session_id,
                        subscriber_id = %id,
                        reason = %reason,
                        "Dropping stale subscriber"
                    );
                    self.unsubscribe(id);
                }
                Err(_) => {
                    self.unsubscribe(id);
                }
            }
        }
        delivered
    }

    async fn deliver_directive(
        &self,
        subscriber_id: &str,
        tx: &mpsc::Sender<QualityDirective>,
        directive: &QualityDirective,
    ) -> Result<()> {
        for attempt in 0..=self.send_retries {
            match tx.send_timeout(directive.clone(), self.send_timeout).await {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(_)) => {
                    metrics::SUBSCRIBER_BACKPRESSURE
                        .with_label_values(&["quality"])
                        .inc();
                    debug!(
                        session_id = %self.session_id,
                        subscriber_id = %subscriber_id,
                        attempt,
                        "Directive channel full"
                    );
                }
                Err(SendTimeoutError::Closed(_)) => {
                    return Err(Error::SessionClosed(self.session_id.clone()));
                }
            }
        }
        Err(Error::SubscriberBackpressure(format!(
            "directive not accepted after {} attempts of {:?}",
            self.send_retries + 1,
            self.send_timeout
        )))
    }

    /// Deliver a report to every subscriber without waiting
    pub fn publish_report(&self, report: &EngagementReport) -> usize {
        let mut delivered = 0;
        let mut gone = Vec::new();

        for entry in &self.subscribers {
            match entry.value().reports.push(report.clone()) {
                Ok(displaced) => {
                    delivered += 1;
                    if displaced.is_some() {
                        metrics::SUBSCRIBER_BACKPRESSURE
                            .with_label_values(&["engagement"])
                            .inc();
                        debug!(
                            session_id = %self.session_id,
                            subscriber_id = %entry.key(),
                            "Engagement channel full, dropped oldest report"
                        );
                    }
                }
                Err(_) => gone.push(entry.key().clone()),
            }
        }

        for id in gone {
            self.unsubscribe(&id);
        }
        delivered
    }

    /// Detach everyone; subscription streams end after draining
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let count = self.subscribers.len();
        self.subscribers.clear();
        info!(session_id = %self.session_id, subscribers = count, "Subscriber hub closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

enum Next {
    Directive(Option<QualityDirective>),
    Report(Option<EngagementReport>),
}

/// Receiving side of one subscriber
pub struct Subscription {
    id: SubscriberId,
    session_id: SessionId,
    directives: mpsc::Receiver<QualityDirective>,
    reports: Arc<DropOldestQueue<EngagementReport>>,
    directives_done: bool,
    reports_done: bool,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Next event, directives first. `None` once the session has ended and
    /// everything buffered has been received.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            let (want_directive, want_report) = (!self.directives_done, !self.reports_done);
            if !want_directive && !want_report {
                return None;
            }

            let next = tokio::select! {
                biased;
                directive = self.directives.recv(), if want_directive => Next::Directive(directive),
                report = self.reports.pop(), if want_report => Next::Report(report),
            };

            match next {
                Next::Directive(Some(directive)) => return Some(SessionEvent::Quality(directive)),
                Next::Directive(None) => self.directives_done = true,
                Next::Report(Some(report)) => return Some(SessionEvent::Engagement(report)),
                Next::Report(None) => self.reports_done = true,
            }
        }
    }

    /// Next event if one is already buffered
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        if let Ok(directive) = self.directives.try_recv() {
            return Some(SessionEvent::Quality(directive));
        }
        self.reports.try_pop().map(SessionEvent::Engagement)
    }

    pub fn into_stream(self) -> impl Stream<Item = SessionEvent> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|event| (event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The hub prunes this subscriber on its next report
        self.reports.close();
    }
}
