//! End-to-end session coordinator scenarios on fast cadences

use chrono::Utc;
use collab_analytics::{
    ActivityEvent, ActivityKind, AnalyticsConfig, DeliveryEvent, Error, InMemoryHistory,
    ParticipantId, ParticipantInfo, QualityTier, SessionCoordinator, SessionEvent, SessionId,
    Subscription, TransitionReason,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn fast_config() -> AnalyticsConfig {
    let mut config = AnalyticsConfig::default();
    config.sampler.cadence_ms = 20;
    config.coordinator.evaluation_interval_ms = 20;
    config.coordinator.directive_send_timeout_ms = 50;
    config.window.network_horizon_ms = 100;
    config.window.engagement_horizon_ms = 2_000;
    config
}

async fn next_matching<F>(subscription: &mut Subscription, mut predicate: F) -> Option<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        while let Some(event) = subscription.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test]
async fn test_session_lifecycle() {
    let coordinator = SessionCoordinator::new(fast_config()).unwrap();
    let session = SessionId::from("standup");

    assert!(coordinator
        .join(session.clone(), ParticipantInfo::new("alice", "Alice"))
        .await
        .unwrap());
    assert!(coordinator
        .join(session.clone(), ParticipantInfo::new("bob", "Bob"))
        .await
        .unwrap());
    // Rejoin is a no-op
    assert!(!coordinator
        .join(session.clone(), ParticipantInfo::new("alice", "Alice"))
        .await
        .unwrap());
    assert_eq!(coordinator.session_count(), 1);
    assert_eq!(coordinator.session_ids(), vec![session.clone()]);

    let snapshot = coordinator.current_state(&session).unwrap();
    assert_eq!(snapshot.participants.len(), 2);
    assert_eq!(snapshot.tier, QualityTier::Medium);

    assert!(coordinator
        .leave(&session, &ParticipantId::from("alice"))
        .await
        .unwrap());
    assert_eq!(coordinator.session_count(), 1);
    assert!(coordinator
        .leave(&session, &ParticipantId::from("bob"))
        .await
        .unwrap());

    assert_eq!(coordinator.session_count(), 0);
    assert!(coordinator.session_ids().is_empty());
    assert!(matches!(
        coordinator.current_state(&session),
        Err(Error::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_unknown_session_is_surfaced() {
    let coordinator = SessionCoordinator::new(fast_config()).unwrap();
    let missing = SessionId::from("missing");
    let event = DeliveryEvent::Loss {
        detected_at: Utc::now(),
    };

    assert!(matches!(
        coordinator.ingest_delivery(&missing, event),
        Err(Error::SessionNotFound(_))
    ));
    assert!(matches!(
        coordinator.subscribe(&missing),
        Err(Error::SessionNotFound(_))
    ));
    assert!(matches!(
        coordinator.end_session(&missing).await,
        Err(Error::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let mut config = fast_config();
    config.sampler.cadence_ms = 0;
    assert!(matches!(
        SessionCoordinator::new(config),
        Err(Error::Configuration(_))
    ));
}

#[tokio::test]
async fn test_session_limit() {
    let mut config = fast_config();
    config.coordinator.max_sessions = 1;
    let coordinator = SessionCoordinator::new(config).unwrap();

    coordinator
        .join(SessionId::from("a"), ParticipantInfo::new("alice", "Alice"))
        .await
        .unwrap();
    assert!(matches!(
        coordinator
            .join(SessionId::from("b"), ParticipantInfo::new("bob", "Bob"))
            .await,
        Err(Error::LimitReached(_))
    ));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_engagement_reports_stream() {
    let coordinator = SessionCoordinator::new(fast_config()).unwrap();
    let session = SessionId::from("standup");
    coordinator
        .join(session.clone(), ParticipantInfo::new("alice", "Alice"))
        .await
        .unwrap();
    let mut subscription = coordinator.subscribe(&session).unwrap();

    coordinator
        .ingest_activity(
            &session,
            ActivityEvent::new(
                "alice",
                Utc::now(),
                ActivityKind::VoiceActivity { active: true },
            ),
        )
        .unwrap();

    let event = next_matching(&mut subscription, |event| match event {
        SessionEvent::Engagement(report) => report
            .participants
            .first()
            .is_some_and(|p| p.speaking_seconds > 0.0),
        SessionEvent::Quality(_) => false,
    })
    .await;

    let Some(SessionEvent::Engagement(report)) = event else {
        panic!("expected an engagement report with speaking time");
    };
    assert_eq!(report.participants[0].rank, 1);
    assert_eq!(report.most_active_speaker, Some(ParticipantId::from("alice")));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_telemetry_loss_directive() {
    let mut config = fast_config();
    // Only the telemetry-loss rule can move the tier
    config.quality.downgrade_sustain_cycles = 10_000;
    let coordinator = SessionCoordinator::new(config).unwrap();
    let session = SessionId::from("quiet");
    coordinator
        .join(session.clone(), ParticipantInfo::new("alice", "Alice"))
        .await
        .unwrap();
    let mut subscription = coordinator.subscribe(&session).unwrap();

    // No telemetry at all: degraded samples accumulate until a full horizon
    let event = next_matching(&mut subscription, |event| {
        matches!(event, SessionEvent::Quality(_))
    })
    .await;
    let Some(SessionEvent::Quality(directive)) = event else {
        panic!("expected a quality directive");
    };
    assert_eq!(directive.from, QualityTier::Medium);
    assert_eq!(directive.to, QualityTier::Low);
    assert_eq!(directive.session_id, session);

    // The snapshot is committed right after delivery
    let snapshot = timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = coordinator.current_state(&session).unwrap();
            if snapshot.tier == QualityTier::Low {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(directive.reason, TransitionReason::TelemetryLoss);
    assert!(directive.health_score.is_none());
    assert!(snapshot.telemetry_lost);
    assert!(snapshot.counters.telemetry_gaps > 0);
    assert_eq!(snapshot.counters.directives_emitted, 1);

    // Still silent: no recovery while telemetry is lost
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = coordinator.current_state(&session).unwrap();
    assert_eq!(snapshot.tier, QualityTier::Low);
    assert!(snapshot.telemetry_lost);
    assert_eq!(snapshot.counters.directives_emitted, 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_end_session_finishes_streams() {
    let coordinator = SessionCoordinator::new(fast_config()).unwrap();
    let session = SessionId::from("standup");
    coordinator
        .join(session.clone(), ParticipantInfo::new("alice", "Alice"))
        .await
        .unwrap();
    let mut subscription = coordinator.subscribe(&session).unwrap();

    coordinator.end_session(&session).await.unwrap();
    assert_eq!(coordinator.session_count(), 0);

    let drained = timeout(Duration::from_secs(5), async {
        while subscription.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "subscription did not finish");
    assert!(matches!(
        coordinator.ingest_activity(
            &session,
            ActivityEvent::new("alice", Utc::now(), ActivityKind::Camera { on: false })
        ),
        Err(Error::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_invalid_activity_counted() {
    let coordinator = SessionCoordinator::new(fast_config()).unwrap();
    let session = SessionId::from("standup");
    coordinator
        .join(session.clone(), ParticipantInfo::new("alice", "Alice"))
        .await
        .unwrap();

    coordinator
        .ingest_activity(
            &session,
            ActivityEvent::new(
                "ghost",
                Utc::now(),
                ActivityKind::Reaction {
                    reaction: collab_analytics::Reaction::Heart,
                },
            ),
        )
        .unwrap();

    let counted = timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = coordinator.current_state(&session).unwrap();
            if snapshot.counters.invalid_samples > 0 {
                return snapshot.counters.invalid_samples;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(counted, 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_history_sink_receives_reports() {
    let history = Arc::new(InMemoryHistory::new());
    let coordinator = SessionCoordinator::with_history(fast_config(), history.clone()).unwrap();
    let session = SessionId::from("standup");
    coordinator
        .join(session.clone(), ParticipantInfo::new("alice", "Alice"))
        .await
        .unwrap();

    let recorded = timeout(Duration::from_secs(5), async {
        while history.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(recorded.is_ok());
    let records = history.records_for(&session);
    assert_eq!(records[0].participant_id, ParticipantId::from("alice"));

    coordinator.shutdown().await;
    assert_eq!(coordinator.session_count(), 0);
}
