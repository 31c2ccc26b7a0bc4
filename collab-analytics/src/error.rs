//! Error types for session analytics

use crate::types::{ParticipantId, SessionId};
use thiserror::Error;

/// Analytics error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Participant {participant} not found in session {session}")]
    ParticipantNotFound {
        session: SessionId,
        participant: ParticipantId,
    },

    /// Out-of-order timestamp or out-of-range value; the sample is dropped
    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    #[error("Subscriber backpressure: {0}")]
    SubscriberBackpressure(String),

    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    #[error("Limit reached: {0}")]
    LimitReached(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Malformed event log at line {line}: {message}")]
    MalformedLog { line: usize, message: String },
}

impl Error {
    /// Short label used for metrics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::ParticipantNotFound { .. } => "participant_not_found",
            Self::InvalidSample(_) => "invalid_sample",
            Self::SubscriberBackpressure(_) => "subscriber_backpressure",
            Self::SessionClosed(_) => "session_closed",
            Self::LimitReached(_) => "limit_reached",
            Self::Configuration(_) => "configuration",
            Self::MalformedLog { .. } => "malformed_log",
        }
    }
}

/// Result type for analytics operations
pub type Result<T> = std::result::Result<T, Error>;
