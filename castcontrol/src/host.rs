//! Contracts with the host media server.
//!
//! The bridge does not own sessions, libraries or stream building; it
//! drives renderers on behalf of a host that does. These traits are the
//! whole surface the host has to provide, and the request types mirror
//! the three message kinds the host sends us.

use std::sync::Arc;

use serde::Deserialize;

use crate::model::{MediaKind, NotificationKind, PlaybackReport, SessionCapabilities};
use crate::profile::DeviceProfile;

/// Host session manager. One instance serves all device sessions.
pub trait SessionHost: Send + Sync {
    fn log_activity(&self, session_id: &str, device_name: &str);
    fn report_capabilities(&self, session_id: &str, capabilities: &SessionCapabilities);
    fn on_playback_start(&self, session_id: &str, info: &PlaybackReport);
    fn on_playback_progress(&self, session_id: &str, info: &PlaybackReport);
    fn on_playback_stopped(&self, session_id: &str, info: &PlaybackReport);
    fn report_session_ended(&self, session_id: &str);
    /// Surface a command failure to the user.
    fn notify(&self, session_id: &str, kind: NotificationKind, message: &str);
}

/// A library item as the host resolves it.
#[derive(Debug, Clone)]
pub struct MediaItem {
    pub id: String,
    pub name: String,
    pub media_type: MediaKind,
    pub run_time_ticks: Option<i64>,
}

/// Resolves item ids from a play request to library items.
pub trait MediaResolver: Send + Sync {
    fn resolve(&self, item_id: &str) -> Option<MediaItem>;
}

/// Options for one stream build.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub media_source_id: Option<String>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub start_position_ticks: i64,
}

/// A playable URL produced by the host's stream builder.
#[derive(Debug, Clone)]
pub struct StreamSource {
    pub url: String,
    /// `contentFeatures.dlna.org` value; empty when not applicable.
    pub content_features: String,
    pub is_direct_stream: bool,
    pub run_time_ticks: Option<i64>,
}

/// Builds stream URLs for items under a device profile. Photos yield the
/// direct image URL; audio/video go through the host's stream pipeline
/// (which encodes start position and stream indices into the URL when
/// transcoding).
pub trait StreamBuilder: Send + Sync {
    fn build(
        &self,
        item: &MediaItem,
        profile: &DeviceProfile,
        request: &StreamRequest,
    ) -> Option<StreamSource>;
}

/// Formats the DIDL-Lite metadata sent along with a stream URL.
pub trait DidlBuilder: Send + Sync {
    fn build(&self, item: &MediaItem, source: &StreamSource, profile: &DeviceProfile) -> String;
}

/// Default metadata builder: the minimal single-item document.
pub struct BasicDidlBuilder;

impl DidlBuilder for BasicDidlBuilder {
    fn build(&self, item: &MediaItem, source: &StreamSource, _profile: &DeviceProfile) -> String {
        castupnp::didl::build_minimal_metadata(&castupnp::didl::MinimalItem {
            id: &item.id,
            title: &item.name,
            upnp_class: castupnp::didl::upnp_class_for(item.media_type.label()),
            protocol_info: "http-get:*:*:*",
            url: &source.url,
        })
    }
}

/// Bundle of host collaborators handed to the registry at startup.
#[derive(Clone)]
pub struct HostServices {
    pub session_manager: Arc<dyn SessionHost>,
    pub resolver: Arc<dyn MediaResolver>,
    pub streams: Arc<dyn StreamBuilder>,
    pub didl: Arc<dyn DidlBuilder>,
}

/// How the items of a play request join the playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PlayCommand {
    PlayNow,
    PlayNext,
    PlayLast,
    PlayInstantMix,
    PlayShuffle,
}

/// "Play these items" message.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayRequest {
    pub item_ids: Vec<String>,
    #[serde(default)]
    pub start_index: usize,
    #[serde(default)]
    pub start_position_ticks: i64,
    #[serde(default)]
    pub media_source_id: Option<String>,
    #[serde(default)]
    pub audio_stream_index: Option<i32>,
    #[serde(default)]
    pub subtitle_stream_index: Option<i32>,
    pub command: PlayCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PlaystateCommand {
    Stop,
    Pause,
    Unpause,
    PlayPause,
    Seek,
    NextTrack,
    PreviousTrack,
}

/// Transport-level message.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaystateRequest {
    pub command: PlaystateCommand,
    #[serde(default)]
    pub seek_position_ticks: Option<i64>,
}

/// Volume / mute / stream-selection message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum GeneralCommand {
    VolumeUp,
    VolumeDown,
    Mute,
    Unmute,
    ToggleMute,
    SetVolume(u32),
    SetAudioStreamIndex(i32),
    SetSubtitleStreamIndex(i32),
}
