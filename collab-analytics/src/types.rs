//! Common types shared by the samplers, engines and the coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a collaboration session (one call / room)
    SessionId
);

string_id!(
    /// Identifier of a participant, unique within its session
    ParticipantId
);

/// Discrete quality level for transmitted media.
///
/// Variants are declared from lowest to highest so the derived `Ord`
/// matches perceptual quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    AudioOnly,
    Low,
    #[default]
    Medium,
    High,
}

impl QualityTier {
    /// One step down, `None` at the bottom
    #[must_use]
    pub const fn lower(self) -> Option<Self> {
        match self {
            Self::AudioOnly => None,
            Self::Low => Some(Self::AudioOnly),
            Self::Medium => Some(Self::Low),
            Self::High => Some(Self::Medium),
        }
    }

    /// One step up, `None` at the top
    #[must_use]
    pub const fn higher(self) -> Option<Self> {
        match self {
            Self::AudioOnly => Some(Self::Low),
            Self::Low => Some(Self::Medium),
            Self::Medium => Some(Self::High),
            Self::High => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AudioOnly => "audio_only",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Whether video is transmitted at this tier
    #[must_use]
    pub const fn carries_video(self) -> bool {
        !matches!(self, Self::AudioOnly)
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn default_camera_on() -> bool {
    true
}

/// Participant as announced by the room directory on join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub display_name: String,
    #[serde(default)]
    pub is_local: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default = "default_camera_on")]
    pub camera_on: bool,
}

impl ParticipantInfo {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            is_local: false,
            muted: false,
            camera_on: true,
        }
    }
}

/// Combined microphone/camera state shown next to a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaStatus {
    Active,
    AudioOff,
    VideoOff,
    AudioVideoOff,
}

/// A participant owned by its session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub is_local: bool,
    pub muted: bool,
    pub camera_on: bool,
    pub joined_at: DateTime<Utc>,
    /// Monotonic position in the session's join sequence, used for tie-breaks
    pub join_order: u64,
}

impl Participant {
    #[must_use]
    pub fn from_info(info: ParticipantInfo, joined_at: DateTime<Utc>, join_order: u64) -> Self {
        Self {
            id: info.id,
            display_name: info.display_name,
            is_local: info.is_local,
            muted: info.muted,
            camera_on: info.camera_on,
            joined_at,
            join_order,
        }
    }

    #[must_use]
    pub const fn status(&self) -> MediaStatus {
        match (self.muted, self.camera_on) {
            (true, false) => MediaStatus::AudioVideoOff,
            (true, true) => MediaStatus::AudioOff,
            (false, false) => MediaStatus::VideoOff,
            (false, true) => MediaStatus::Active,
        }
    }
}
