//! The playlist controller.
//!
//! Bridges the host's "play these items" world to the renderer's
//! one-URI-at-a-time transport: owns the playlist and cursor, feeds the
//! device session, pipelines the next track for gapless playback, drives
//! photo slideshows, and turns the session's playback transitions into
//! host progress reports.

mod playlist;
pub(crate) mod shuffle;

pub use playlist::{Playlist, PlaylistItem};

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use castconfig::Config;

use crate::device::{DeadlineTimer, RendererSession, SessionCallbacks};
use crate::errors::ControlError;
use crate::host::{
    GeneralCommand, HostServices, MediaItem, PlayCommand, PlayRequest, PlaystateCommand,
    PlaystateRequest, StreamRequest,
};
use crate::model::{CurrentMedia, MediaData, MediaKind, NotificationKind, PlaybackReport};
use crate::profile::DeviceProfile;

/// Poll cadence and cap for the post-transport-change seek.
const TRANSPORT_SETTLE_PROBE: Duration = Duration::from_millis(500);
const TRANSPORT_SETTLE_TRIES: u32 = 30;

#[derive(Debug, Clone)]
pub struct ControllerTuning {
    pub photo_interval: Duration,
    pub max_resume_percent: u32,
}

impl ControllerTuning {
    pub fn from_config(config: &Config) -> Self {
        ControllerTuning {
            photo_interval: config.photo_transition(),
            max_resume_percent: config.max_resume_percent(),
        }
    }
}

#[cfg(test)]
impl Default for ControllerTuning {
    fn default() -> Self {
        ControllerTuning {
            photo_interval: Duration::from_secs(5),
            max_resume_percent: 2,
        }
    }
}

struct ControllerState {
    playlist: Playlist,
    /// Photo slideshow in progress; playstate commands are intercepted.
    slideshow_active: bool,
}

pub struct PlaylistController {
    session: Arc<RendererSession>,
    services: HostServices,
    profile: Arc<DeviceProfile>,
    host_session_id: String,
    state: Mutex<ControllerState>,
    slideshow: Arc<DeadlineTimer>,
    tuning: ControllerTuning,
    /// Capability handed in by the registry; invoked when the device
    /// stops answering. The controller never owns the registry.
    unavailable_hook: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl PlaylistController {
    pub fn new(
        session: Arc<RendererSession>,
        services: HostServices,
        profile: Arc<DeviceProfile>,
        host_session_id: String,
        tuning: ControllerTuning,
    ) -> Arc<Self> {
        Arc::new(PlaylistController {
            session,
            services,
            profile,
            host_session_id,
            state: Mutex::new(ControllerState {
                playlist: Playlist::new(),
                slideshow_active: false,
            }),
            slideshow: Arc::new(DeadlineTimer::new()),
            tuning,
            unavailable_hook: RwLock::new(None),
        })
    }

    /// Wire the controller to its session: playback callbacks, metadata
    /// quirks and the slideshow timer thread.
    pub fn attach(self: &Arc<Self>) {
        self.session
            .set_callbacks(Arc::clone(self) as Arc<dyn SessionCallbacks>);
        self.session
            .set_metadata_escaping(self.profile.requires_escaped_metadata);

        let weak: Weak<PlaylistController> = Arc::downgrade(self);
        self.slideshow.start("slideshow", move || {
            if let Some(controller) = weak.upgrade() {
                controller.advance_slideshow();
            }
        });
    }

    pub fn set_unavailable_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self.unavailable_hook.write().unwrap() = Some(hook);
    }

    pub fn dispose(&self) {
        self.slideshow.dispose();
        self.unavailable_hook.write().unwrap().take();
    }

    pub fn session(&self) -> &Arc<RendererSession> {
        &self.session
    }

    pub fn host_session_id(&self) -> &str {
        &self.host_session_id
    }

    pub fn playlist_cursor(&self) -> isize {
        self.state.lock().unwrap().playlist.cursor()
    }

    pub fn playlist_len(&self) -> usize {
        self.state.lock().unwrap().playlist.len()
    }

    // ------------------------------------------------------------------
    // Play requests
    // ------------------------------------------------------------------

    pub fn handle_play(&self, request: &PlayRequest) {
        // Resolution and routing may drop items, but `start_index` and
        // the start position refer to positions in the request; keep the
        // original position attached to every survivor.
        let resolved: Vec<(usize, MediaItem)> = request
            .item_ids
            .iter()
            .enumerate()
            .filter_map(|(position, id)| {
                self.services.resolver.resolve(id).map(|item| (position, item))
            })
            .filter(|(_, item)| self.profile.supports(item.media_type))
            .collect();

        let mut built: Vec<(usize, PlaylistItem)> = Vec::with_capacity(resolved.len());
        for (position, item) in &resolved {
            let start_ticks = if *position == request.start_index {
                request.start_position_ticks
            } else {
                0
            };
            if let Some(playlist_item) = self.create_playlist_item(
                item,
                start_ticks,
                request.media_source_id.clone(),
                request.audio_stream_index,
                request.subtitle_stream_index,
            ) {
                built.push((*position, playlist_item));
            }
        }

        debug!(
            session = self.host_session_id.as_str(),
            requested = request.item_ids.len(),
            built = built.len(),
            command = ?request.command,
            "play request"
        );

        match request.command {
            PlayCommand::PlayNow => {
                // Playback begins at start_index; the requested prefix is
                // not part of the new playlist. A start_index past every
                // surviving item is ignored rather than playing nothing.
                let mut items: Vec<PlaylistItem> = built
                    .iter()
                    .filter(|(position, _)| *position >= request.start_index)
                    .map(|(_, item)| item.clone())
                    .collect();
                if items.is_empty() {
                    items = built.into_iter().map(|(_, item)| item).collect();
                }
                let empty = items.is_empty();
                self.state.lock().unwrap().playlist.replace(items);
                if !empty {
                    self.set_playlist_index(0);
                }
            }
            PlayCommand::PlayShuffle | PlayCommand::PlayInstantMix => {
                let items: Vec<PlaylistItem> =
                    built.into_iter().map(|(_, item)| item).collect();
                let empty = items.is_empty();
                {
                    let mut state = self.state.lock().unwrap();
                    state.playlist.replace(items);
                    state.playlist.shuffle();
                }
                if !empty {
                    self.set_playlist_index(0);
                }
            }
            PlayCommand::PlayLast => {
                let items: Vec<PlaylistItem> =
                    built.into_iter().map(|(_, item)| item).collect();
                let cursor = {
                    let mut state = self.state.lock().unwrap();
                    state.playlist.append(items);
                    state.playlist.cursor()
                };
                if self.session.is_playing() {
                    return;
                }
                if cursor < 0 && self.playlist_len() > 0 {
                    self.set_playlist_index(0);
                }
            }
            PlayCommand::PlayNext => {
                let items: Vec<PlaylistItem> =
                    built.into_iter().map(|(_, item)| item).collect();
                let cursor = {
                    let mut state = self.state.lock().unwrap();
                    state.playlist.insert_next(items);
                    state.playlist.cursor()
                };
                if self.session.is_playing() {
                    return;
                }
                if cursor < 0 && self.playlist_len() > 0 {
                    self.set_playlist_index(0);
                }
            }
        }
    }

    /// Build one playlist entry; items the stream builder cannot route
    /// are dropped silently.
    fn create_playlist_item(
        &self,
        item: &MediaItem,
        start_ticks: i64,
        media_source_id: Option<String>,
        audio_stream_index: Option<i32>,
        subtitle_stream_index: Option<i32>,
    ) -> Option<PlaylistItem> {
        let request = StreamRequest {
            media_source_id,
            audio_stream_index,
            subtitle_stream_index,
            start_position_ticks: start_ticks,
        };
        let source = self.services.streams.build(item, &self.profile, &request)?;

        let url = match item.media_type {
            MediaKind::Photo => source.url.clone(),
            _ => append_dlna_marker(&source.url),
        };
        let metadata = self.services.didl.build(item, &source, &self.profile);

        Some(PlaylistItem {
            item_id: item.id.clone(),
            name: item.name.clone(),
            stream_url: Some(url),
            metadata,
            content_features: source.content_features.clone(),
            media_type: item.media_type,
            start_position_ticks: start_ticks,
            is_direct_stream: source.is_direct_stream,
            audio_stream_index,
            subtitle_stream_index,
            run_time_ticks: source.run_time_ticks.or(item.run_time_ticks),
        })
    }

    // ------------------------------------------------------------------
    // Cursor moves
    // ------------------------------------------------------------------

    /// Jump to `index`. Out of range clears everything and stops: that is
    /// how both "past the end" and explicit stops are expressed.
    pub fn set_playlist_index(&self, index: isize) {
        let (item, next) = {
            let mut state = self.state.lock().unwrap();
            if !state.playlist.set_cursor(index) {
                state.playlist.clear();
                state.slideshow_active = false;
                drop(state);
                self.slideshow.park();
                self.session.stop();
                return;
            }
            let item = state.playlist.current().cloned();
            let next = state.playlist.item(index as usize + 1).cloned();
            (item, next)
        };

        let Some(item) = item else { return };
        let Some(url) = item.stream_url.clone() else {
            warn!(item = item.item_id.as_str(), "playlist item without stream URL");
            return;
        };

        self.session.set_media(MediaData {
            url,
            content_features: item.content_features.clone(),
            metadata: item.metadata.clone(),
            media_type: item.media_type,
            reset_playback: index > 0,
            position_ticks: if item.is_direct_stream {
                item.start_position_ticks
            } else {
                0
            },
        });

        self.send_next_track(next);

        if item.media_type == MediaKind::Photo {
            self.state.lock().unwrap().slideshow_active = true;
            self.slideshow.schedule(self.tuning.photo_interval);
        } else {
            self.state.lock().unwrap().slideshow_active = false;
            self.slideshow.park();
        }
    }

    /// Pipeline the following item so the renderer can switch gaplessly.
    fn send_next_track(&self, next: Option<PlaylistItem>) {
        let Some(next) = next else { return };
        let Some(url) = next.stream_url.clone() else { return };
        self.session.set_next_media(MediaData {
            url,
            content_features: next.content_features.clone(),
            metadata: next.metadata.clone(),
            media_type: next.media_type,
            reset_playback: false,
            position_ticks: 0,
        });
    }

    // ------------------------------------------------------------------
    // Playstate requests
    // ------------------------------------------------------------------

    pub fn handle_playstate(&self, request: &PlaystateRequest) {
        let slideshow = self.state.lock().unwrap().slideshow_active;
        if slideshow {
            return self.handle_playstate_slideshow(request);
        }

        match request.command {
            PlaystateCommand::Stop => {
                self.state.lock().unwrap().playlist.clear();
                self.slideshow.park();
                self.session.stop();
            }
            PlaystateCommand::Pause => self.session.pause(),
            PlaystateCommand::Unpause => self.session.play(),
            PlaystateCommand::PlayPause => {
                if self.session.is_paused() {
                    self.session.play();
                } else {
                    self.session.pause();
                }
            }
            PlaystateCommand::Seek => {
                self.seek(request.seek_position_ticks.unwrap_or(0));
            }
            PlaystateCommand::NextTrack => {
                let cursor = self.playlist_cursor();
                self.set_playlist_index(cursor + 1);
            }
            PlaystateCommand::PreviousTrack => {
                let cursor = self.playlist_cursor();
                self.set_playlist_index(cursor - 1);
            }
        }
    }

    /// During a slideshow the transport is a fiction; commands move the
    /// timer and the cursor instead of the renderer.
    fn handle_playstate_slideshow(&self, request: &PlaystateRequest) {
        match request.command {
            PlaystateCommand::Stop => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.playlist.clear();
                    state.slideshow_active = false;
                }
                self.slideshow.park();
                self.session.stop();
            }
            PlaystateCommand::Pause => self.slideshow.park(),
            PlaystateCommand::Unpause | PlaystateCommand::PlayPause => {
                self.slideshow.schedule(self.tuning.photo_interval);
            }
            PlaystateCommand::NextTrack => {
                let cursor = self.playlist_cursor();
                self.set_playlist_index(cursor + 1);
            }
            PlaystateCommand::PreviousTrack => {
                let cursor = self.playlist_cursor();
                self.set_playlist_index(cursor - 1);
            }
            PlaystateCommand::Seek => {}
        }
    }

    /// Seek within the current item. A direct stream seeks on the
    /// renderer; a transcode restarts at a rebuilt URL (the server
    /// encodes the start position into it).
    fn seek(&self, ticks: i64) {
        let current = {
            let state = self.state.lock().unwrap();
            state
                .playlist
                .current()
                .cloned()
                .map(|item| (item, state.playlist.cursor()))
        };

        match current {
            Some((item, cursor)) if !item.is_direct_stream => {
                let Some(rebuilt) = self.rebuild_item(
                    &item,
                    ticks,
                    item.audio_stream_index,
                    item.subtitle_stream_index,
                ) else {
                    return;
                };
                self.state
                    .lock()
                    .unwrap()
                    .playlist
                    .replace_at(cursor as usize, rebuilt.clone());
                self.load_rebuilt(&rebuilt);
            }
            _ => self.session.seek(ticks),
        }
    }

    fn rebuild_item(
        &self,
        item: &PlaylistItem,
        start_ticks: i64,
        audio_stream_index: Option<i32>,
        subtitle_stream_index: Option<i32>,
    ) -> Option<PlaylistItem> {
        let media_item = self.services.resolver.resolve(&item.item_id)?;
        self.create_playlist_item(
            &media_item,
            start_ticks,
            None,
            audio_stream_index,
            subtitle_stream_index,
        )
    }

    fn load_rebuilt(&self, item: &PlaylistItem) {
        let Some(url) = item.stream_url.clone() else { return };
        self.session.set_media(MediaData {
            url,
            content_features: item.content_features.clone(),
            metadata: item.metadata.clone(),
            media_type: item.media_type,
            reset_playback: false,
            position_ticks: 0,
        });
    }

    // ------------------------------------------------------------------
    // General commands
    // ------------------------------------------------------------------

    pub fn handle_general(&self, command: &GeneralCommand) {
        match command {
            GeneralCommand::VolumeUp => self.session.volume_up(),
            GeneralCommand::VolumeDown => self.session.volume_down(),
            GeneralCommand::Mute => self.session.mute(),
            GeneralCommand::Unmute => self.session.unmute(),
            GeneralCommand::ToggleMute => self.session.toggle_mute(),
            GeneralCommand::SetVolume(value) => self.session.set_volume_user(*value),
            GeneralCommand::SetAudioStreamIndex(index) => {
                self.change_stream_index(Some(*index), None);
            }
            GeneralCommand::SetSubtitleStreamIndex(index) => {
                self.change_stream_index(None, Some(*index));
            }
        }
    }

    /// A different stream index means a different server URL: rebuild at
    /// the current position and replace the transport URI. A direct
    /// stream does not encode position, so seek back once the renderer
    /// accepts the new URI.
    fn change_stream_index(&self, audio: Option<i32>, subtitle: Option<i32>) {
        let position = self.session.position_ticks();
        let current = {
            let state = self.state.lock().unwrap();
            state
                .playlist
                .current()
                .cloned()
                .map(|item| (item, state.playlist.cursor()))
        };
        let Some((item, cursor)) = current else { return };

        let audio = audio.or(item.audio_stream_index);
        let subtitle = subtitle.or(item.subtitle_stream_index);
        let Some(rebuilt) = self.rebuild_item(&item, position, audio, subtitle) else {
            return;
        };

        self.state
            .lock()
            .unwrap()
            .playlist
            .replace_at(cursor as usize, rebuilt.clone());
        self.load_rebuilt(&rebuilt);

        if rebuilt.is_direct_stream {
            self.seek_after_transport_change(position);
        }
    }

    /// Wait for the new URI to reach Playing, then seek. Bounded probe,
    /// on its own thread so the caller is never blocked.
    fn seek_after_transport_change(&self, ticks: i64) {
        let session = Arc::clone(&self.session);
        let spawn = std::thread::Builder::new()
            .name("transport-settle".to_string())
            .spawn(move || {
                for _ in 0..TRANSPORT_SETTLE_TRIES {
                    if session.is_disposed() {
                        return;
                    }
                    if session.is_playing() {
                        session.seek(ticks);
                        return;
                    }
                    std::thread::sleep(TRANSPORT_SETTLE_PROBE);
                }
                debug!("renderer never reached Playing after URI change, skipping seek");
            });
        if let Err(e) = spawn {
            warn!(error = %e, "cannot spawn transport settle thread");
        }
    }

    // ------------------------------------------------------------------
    // Slideshow
    // ------------------------------------------------------------------

    fn advance_slideshow(&self) {
        let (active, next) = {
            let state = self.state.lock().unwrap();
            (state.slideshow_active, state.playlist.cursor() + 1)
        };
        if active {
            self.set_playlist_index(next);
        }
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    fn report_for(&self, media: &CurrentMedia, position_override: Option<i64>) -> PlaybackReport {
        let item_id = if media.id.is_empty() {
            self.state
                .lock()
                .unwrap()
                .playlist
                .current()
                .map(|item| item.item_id.clone())
                .unwrap_or_default()
        } else {
            media.id.clone()
        };
        PlaybackReport {
            item_id,
            media_url: media.url.clone(),
            position_ticks: position_override.or_else(|| Some(self.session.position_ticks())),
            duration_ticks: self.session.duration_ticks(),
            is_paused: self.session.is_paused(),
            is_muted: self.session.is_muted(),
            volume: self.session.volume_user(),
            media_type: self.session.media_type(),
        }
    }

    /// Natural end vs. user stop, from where the position landed relative
    /// to the runtime.
    fn handle_stopped(&self, media: &CurrentMedia) {
        let position = self.session.position_ticks();
        let duration = self.session.duration_ticks().or_else(|| {
            let state = self.state.lock().unwrap();
            state.playlist.current().and_then(|item| item.run_time_ticks)
        });

        let (cursor, is_photo) = {
            let state = self.state.lock().unwrap();
            (
                state.playlist.cursor(),
                state
                    .playlist
                    .current()
                    .is_some_and(|item| item.media_type == MediaKind::Photo),
            )
        };

        // Photos never get a resume position recorded.
        let reported = if is_photo { Some(1) } else { Some(position) };
        self.services
            .session_manager
            .on_playback_stopped(&self.host_session_id, &self.report_for(media, reported));

        if played_to_completion(position, duration, self.tuning.max_resume_percent) {
            info!(
                session = self.host_session_id.as_str(),
                cursor, "track completed, advancing"
            );
            self.set_playlist_index(cursor + 1);
        } else {
            debug!(
                session = self.host_session_id.as_str(),
                position, "stopped short of completion, clearing playlist"
            );
            let mut state = self.state.lock().unwrap();
            state.playlist.clear();
            state.slideshow_active = false;
        }
    }

    /// The renderer advanced on its own (gapless SetNext handover): move
    /// the cursor to the item it reports and queue the one after.
    fn sync_cursor_to(&self, media: &CurrentMedia) {
        let mut state = self.state.lock().unwrap();
        let found = (0..state.playlist.len()).find(|&i| {
            state.playlist.item(i).is_some_and(|item| {
                item.item_id == media.id
                    || item.stream_url.as_deref() == Some(media.url.as_str())
            })
        });
        if let Some(index) = found {
            state.playlist.set_cursor(index as isize);
            let next = state.playlist.item(index + 1).cloned();
            drop(state);
            self.send_next_track(next);
        }
    }
}

impl SessionCallbacks for PlaylistController {
    fn on_playback_start(&self, media: &CurrentMedia) {
        self.services
            .session_manager
            .on_playback_start(&self.host_session_id, &self.report_for(media, None));
    }

    fn on_playback_progress(&self, media: &CurrentMedia) {
        self.services
            .session_manager
            .on_playback_progress(&self.host_session_id, &self.report_for(media, None));
    }

    fn on_playback_stopped(&self, media: &CurrentMedia) {
        self.handle_stopped(media);
    }

    fn on_media_changed(&self, from: &CurrentMedia, to: &CurrentMedia) {
        self.services
            .session_manager
            .on_playback_stopped(&self.host_session_id, &self.report_for(from, None));
        self.sync_cursor_to(to);
        self.services
            .session_manager
            .on_playback_start(&self.host_session_id, &self.report_for(to, None));
    }

    fn on_unavailable(&self) {
        warn!(session = self.host_session_id.as_str(), "renderer unavailable");
        if let Some(hook) = self.unavailable_hook.read().unwrap().as_ref() {
            hook();
        }
    }

    fn on_command_error(&self, media_type: Option<MediaKind>, error: &ControlError) {
        self.services.session_manager.notify(
            &self.host_session_id,
            NotificationKind::for_media(media_type),
            &error.to_string(),
        );
    }
}

/// Did playback run to (nearly) the end? Position 0 is how many renderers
/// report a fully played track, so it counts as completion.
pub(crate) fn played_to_completion(
    position_ticks: i64,
    duration_ticks: Option<i64>,
    max_resume_percent: u32,
) -> bool {
    if position_ticks == 0 {
        return true;
    }
    match duration_ticks {
        Some(duration) if duration > 0 => {
            let off_by = (1.0 - position_ticks as f64 / duration as f64).abs() * 100.0;
            off_by <= max_resume_percent as f64
        }
        _ => false,
    }
}

/// Audio/video URLs carry a marker so the server knows to apply DLNA
/// headers on the way back out.
fn append_dlna_marker(url: &str) -> String {
    if url.contains("dlna=true") {
        return url.to_string();
    }
    if url.contains('?') {
        format!("{url}&dlna=true")
    } else {
        format!("{url}?dlna=true")
    }
}


#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn completion_formula() {
        // Position 0 counts as completion.
        assert!(played_to_completion(0, Some(1_000_000), 2));
        // 99% played with a 2% window.
        assert!(played_to_completion(990_000, Some(1_000_000), 2));
        // 95% played misses the window.
        assert!(!played_to_completion(950_000, Some(1_000_000), 2));
        // Unknown duration: never a natural end (except position 0).
        assert!(!played_to_completion(42, None, 2));
        assert!(!played_to_completion(42, Some(0), 2));
    }

    #[test]
    fn dlna_marker_appending() {
        assert_eq!(append_dlna_marker("http://s/a"), "http://s/a?dlna=true");
        assert_eq!(append_dlna_marker("http://s/a?x=1"), "http://s/a?x=1&dlna=true");
        assert_eq!(
            append_dlna_marker("http://s/a?dlna=true"),
            "http://s/a?dlna=true"
        );
    }
}
