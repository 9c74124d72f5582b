//! Shared model types of the session engine.

use serde::{Deserialize, Serialize};

/// AVTransport state as reported by the renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Playing,
    Transitioning,
    Paused,
    PausedPlayback,
    PausedRecording,
    Recording,
    NoMediaPresent,
    Error,
}

impl TransportState {
    /// Map a raw CurrentTransportState string to a state.
    ///
    /// Anything unrecognised maps to [`TransportState::Error`]; some
    /// firmwares report vendor strings when they are wedged.
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "STOPPED" => TransportState::Stopped,
            "PLAYING" => TransportState::Playing,
            "TRANSITIONING" => TransportState::Transitioning,
            "PAUSED" => TransportState::Paused,
            "PAUSED_PLAYBACK" => TransportState::PausedPlayback,
            "PAUSED_RECORDING" => TransportState::PausedRecording,
            "RECORDING" => TransportState::Recording,
            "NO_MEDIA_PRESENT" => TransportState::NoMediaPresent,
            _ => TransportState::Error,
        }
    }

    pub fn is_playing(self) -> bool {
        self == TransportState::Playing
    }

    pub fn is_paused(self) -> bool {
        matches!(self, TransportState::Paused | TransportState::PausedPlayback)
    }

    pub fn is_stopped(self) -> bool {
        self == TransportState::Stopped
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportState::Stopped => "STOPPED",
            TransportState::Playing => "PLAYING",
            TransportState::Transitioning => "TRANSITIONING",
            TransportState::Paused => "PAUSED",
            TransportState::PausedPlayback => "PAUSED_PLAYBACK",
            TransportState::PausedRecording => "PAUSED_RECORDING",
            TransportState::Recording => "RECORDING",
            TransportState::NoMediaPresent => "NO_MEDIA_PRESENT",
            TransportState::Error => "ERROR",
        }
    }
}

/// Media categories the bridge can route to a renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
    Photo,
}

impl MediaKind {
    pub fn label(self) -> &'static str {
        match self {
            MediaKind::Audio => "Audio",
            MediaKind::Video => "Video",
            MediaKind::Photo => "Photo",
        }
    }
}

/// The item the renderer reports as loaded.
///
/// Equality is on the URL; an empty URL means "no media".
#[derive(Clone, Debug, Default)]
pub struct CurrentMedia {
    pub id: String,
    pub url: String,
}

impl CurrentMedia {
    pub fn has_url(&self) -> bool {
        !self.url.is_empty()
    }
}

impl PartialEq for CurrentMedia {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for CurrentMedia {}

/// Everything the device session needs to load one item.
#[derive(Clone, Debug)]
pub struct MediaData {
    pub url: String,
    /// Value for the `contentFeatures.dlna.org` header; empty for photos.
    pub content_features: String,
    /// DIDL-Lite metadata document.
    pub metadata: String,
    pub media_type: MediaKind,
    /// Restart from the beginning even when the item is already loaded.
    pub reset_playback: bool,
    pub position_ticks: i64,
}

/// Progress report handed to the host session manager.
#[derive(Clone, Debug)]
pub struct PlaybackReport {
    pub item_id: String,
    pub media_url: String,
    pub position_ticks: Option<i64>,
    pub duration_ticks: Option<i64>,
    pub is_paused: bool,
    pub is_muted: bool,
    pub volume: u32,
    pub media_type: Option<MediaKind>,
}

/// What the attached renderer can do, reported to the host once per
/// session.
#[derive(Clone, Debug)]
pub struct SessionCapabilities {
    pub playable_media_types: Vec<MediaKind>,
    pub supported_commands: Vec<String>,
    pub supports_media_control: bool,
}

/// User-visible notification category for command failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    AudioPlaybackError,
    VideoPlaybackError,
    TaskFailed,
}

impl NotificationKind {
    pub fn for_media(kind: Option<MediaKind>) -> Self {
        match kind {
            Some(MediaKind::Audio) => NotificationKind::AudioPlaybackError,
            Some(MediaKind::Video) => NotificationKind::VideoPlaybackError,
            _ => NotificationKind::TaskFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_state_from_wire() {
        assert_eq!(TransportState::from_wire("PLAYING"), TransportState::Playing);
        assert_eq!(TransportState::from_wire("playing"), TransportState::Playing);
        assert_eq!(
            TransportState::from_wire(" PAUSED_PLAYBACK "),
            TransportState::PausedPlayback
        );
        assert_eq!(
            TransportState::from_wire("CUSTOM_VENDOR_STATE"),
            TransportState::Error
        );
    }

    #[test]
    fn state_predicates() {
        assert!(TransportState::Playing.is_playing());
        assert!(TransportState::Paused.is_paused());
        assert!(TransportState::PausedPlayback.is_paused());
        assert!(!TransportState::PausedRecording.is_paused());
        assert!(TransportState::Stopped.is_stopped());
        assert!(!TransportState::NoMediaPresent.is_stopped());
    }

    #[test]
    fn media_equality_is_on_url() {
        let a = CurrentMedia {
            id: "1".into(),
            url: "http://server/x".into(),
        };
        let b = CurrentMedia {
            id: "2".into(),
            url: "http://server/x".into(),
        };
        assert_eq!(a, b);
        assert!(!CurrentMedia::default().has_url());
    }

    #[test]
    fn notification_kind_follows_media() {
        assert_eq!(
            NotificationKind::for_media(Some(MediaKind::Audio)),
            NotificationKind::AudioPlaybackError
        );
        assert_eq!(
            NotificationKind::for_media(Some(MediaKind::Photo)),
            NotificationKind::TaskFailed
        );
        assert_eq!(
            NotificationKind::for_media(None),
            NotificationKind::TaskFailed
        );
    }
}
