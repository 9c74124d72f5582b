//! Reconciliation of pushed events against cached session state.
//!
//! Three signal sources touch the same state: the queue worker (our own
//! writes), the poll timer, and NOTIFY events. Events are authoritative,
//! except while the cached state is Transitioning, which is a window we
//! opened ourselves and the device's stale echoes must not close.
//!
//! The decision logic is a pure function over (cached transport, event
//! values) so it can be tested without a device; `handle_event` applies
//! the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use castupnp::eventing::parse_event_properties;

use crate::device::session::RendererSession;
use crate::model::{CurrentMedia, TransportState};
use crate::stream;
use crate::time_utils;

/// What to do about current media after an event.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MediaDecision {
    /// Event said nothing about media.
    Leave,
    /// Renderer stopped: media is gone.
    Clear,
    /// The event carried enough DIDL to name the item.
    FromEvent(CurrentMedia),
    /// Playback-related event without DIDL: ask the device.
    ProbeDevice,
}

/// Pure outcome of one event against the cached transport state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReconcileOutcome {
    pub mute: Option<bool>,
    pub volume: Option<i64>,
    /// Already filtered through the Transitioning guard.
    pub transport: Option<TransportState>,
    pub position_ticks: Option<i64>,
    pub duration_ticks: Option<i64>,
    pub media: MediaDecision,
    /// Position missing while playing: one GetPositionInfo is due.
    pub probe_position: bool,
    /// A stop was observed: schedule a confirming poll.
    pub schedule_poll: bool,
}

/// Decide how an event changes the cached state.
pub(crate) fn reconcile_event(
    cached_transport: TransportState,
    values: &HashMap<String, String>,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome {
        mute: None,
        volume: None,
        transport: None,
        position_ticks: None,
        duration_ticks: None,
        media: MediaDecision::Leave,
        probe_position: false,
        schedule_poll: false,
    };

    if let Some(raw) = values.get("Mute.val") {
        outcome.mute = Some(raw == "1" || raw.eq_ignore_ascii_case("true"));
    }
    if let Some(raw) = values.get("Volume.val") {
        outcome.volume = raw.parse::<i64>().ok();
    }

    let mut effective_transport = cached_transport;
    if let Some(raw) = values
        .get("TransportState.val")
        .or_else(|| values.get("CurrentTransportState.val"))
    {
        let reported = TransportState::from_wire(raw);
        if reported != cached_transport && cached_transport != TransportState::Transitioning {
            outcome.transport = Some(reported);
            effective_transport = reported;
            if reported == TransportState::Stopped {
                outcome.media = MediaDecision::Clear;
                outcome.schedule_poll = true;
            }
        }
    }

    if let Some(ticks) = values
        .get("RelativeTimePosition.val")
        .and_then(|raw| time_utils::parse_hms_to_ticks(raw))
    {
        outcome.position_ticks = Some(ticks);
    } else if effective_transport.is_playing() {
        outcome.probe_position = true;
    }

    if let Some(ticks) = values
        .get("CurrentTrackDuration.val")
        .and_then(|raw| time_utils::parse_hms_to_ticks(raw))
    {
        outcome.duration_ticks = Some(ticks);
    }

    if outcome.media == MediaDecision::Leave && carries_playback_signal(values) {
        outcome.media = match media_from_values(values) {
            Some(media) => MediaDecision::FromEvent(media),
            None => MediaDecision::ProbeDevice,
        };
    }

    outcome
}

/// Does this event talk about playback at all? Volume-only events must
/// not trigger a media probe on every notification.
fn carries_playback_signal(values: &HashMap<String, String>) -> bool {
    const SIGNALS: [&str; 7] = [
        "TransportState.val",
        "CurrentTransportState.val",
        "RelativeTimePosition.val",
        "CurrentTrackDuration.val",
        "AVTransportURI.val",
        "CurrentTrackURI.val",
        "CurrentTrackMetaData.val",
    ];
    SIGNALS.iter().any(|k| values.contains_key(*k)) || has_didl_keys(values)
}

fn has_didl_keys(values: &HashMap<String, String>) -> bool {
    values.contains_key("item.id") || values.contains_key("res") || values.contains_key("TrackURI")
}

/// Build the current-media view from flattened reply or event values.
pub(crate) fn media_from_values(values: &HashMap<String, String>) -> Option<CurrentMedia> {
    let url = values
        .get("res")
        .or_else(|| values.get("TrackURI"))
        .or_else(|| values.get("CurrentURI"))
        .or_else(|| values.get("AVTransportURI.val"))
        .or_else(|| values.get("CurrentTrackURI.val"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())?;

    let id = values
        .get("item.id")
        .cloned()
        .filter(|id| !id.is_empty())
        .or_else(|| stream::item_id_from_url(&url))
        .unwrap_or_default();

    Some(CurrentMedia { id, url })
}

/// Two media views describe the same item when ids agree, or when ids
/// are absent and the URL does.
pub(crate) fn same_item(a: &CurrentMedia, b: &CurrentMedia) -> bool {
    if !a.id.is_empty() && !b.id.is_empty() {
        return a.id == b.id;
    }
    a.url == b.url
}

impl RendererSession {
    /// Entry point for one NOTIFY body, called by the registry.
    pub fn handle_event(self: &Arc<Self>, body: &str) {
        if self.is_disposed() {
            return;
        }

        let values = match parse_event_properties(body) {
            Ok(values) => values,
            Err(error) => {
                debug!(device = %self.friendly_name(), error = %error, "malformed event body");
                return;
            }
        };

        let outcome = {
            let state = self.state.lock().unwrap();
            reconcile_event(state.transport, &values)
        };
        self.apply_outcome(&outcome);

        // Every inbound notification doubles as a lease heartbeat.
        self.renew_subscriptions();
    }

    pub(crate) fn apply_outcome(self: &Arc<Self>, outcome: &ReconcileOutcome) {
        {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            if let Some(mute) = outcome.mute {
                state.mute = mute;
                state.last_mute_refresh = Some(now);
            }
            if let Some(volume) = outcome.volume {
                state.volume = volume;
                if volume > 0 {
                    state.mute_volume = volume;
                }
                state.last_volume_refresh = Some(now);
            }
            if let Some(transport) = outcome.transport {
                state.transport = transport;
                state.last_transport_refresh = Some(now);
            }
            if let Some(ticks) = outcome.position_ticks {
                state.position_ticks = ticks;
                state.last_position_refresh = Some(now);
            }
            if let Some(ticks) = outcome.duration_ticks {
                state.duration_ticks = Some(ticks);
            }
        }

        if outcome.probe_position {
            self.probe_position();
        }
        if outcome.schedule_poll {
            self.schedule_poll();
        }

        match &outcome.media {
            MediaDecision::Leave => {}
            MediaDecision::Clear => self.update_media_info(None),
            MediaDecision::FromEvent(media) => self.update_media_info(Some(media.clone())),
            MediaDecision::ProbeDevice => {
                if let Some(media) = self.fetch_media_info() {
                    self.update_media_info(Some(media));
                }
            }
        }
    }

    /// Apply a new current-media observation and emit the corresponding
    /// transition. Empty-URL media is noise from half-initialized
    /// renderers and is dropped before it can fake a stop.
    pub(crate) fn update_media_info(self: &Arc<Self>, new: Option<CurrentMedia>) {
        if let Some(media) = &new {
            if !media.has_url() {
                return;
            }
        }

        let old = {
            let mut state = self.state.lock().unwrap();
            let old = state.media.clone();
            state.media = new.clone();
            if new.is_none() {
                state.media_type = None;
                state.playing_url = None;
            }
            old
        };

        // Callbacks run outside the state lock: the controller is allowed
        // to talk back to the session from them.
        let Some(callbacks) = self.callbacks() else {
            return;
        };
        match (old, new) {
            (None, Some(new)) => callbacks.on_playback_start(&new),
            (Some(old), Some(new)) if same_item(&old, &new) => {
                callbacks.on_playback_progress(&new)
            }
            (Some(old), Some(new)) => callbacks.on_media_changed(&old, &new),
            (Some(old), None) => callbacks.on_playback_stopped(&old),
            (None, None) => {}
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn volume_and_mute_events_apply() {
        let outcome = reconcile_event(
            TransportState::Playing,
            &values(&[("Volume.val", "31"), ("Mute.val", "1")]),
        );
        assert_eq!(outcome.volume, Some(31));
        assert_eq!(outcome.mute, Some(true));
        assert_eq!(outcome.media, MediaDecision::Leave);
        assert!(!outcome.probe_position);
    }

    #[test]
    fn transport_change_is_adopted() {
        let outcome = reconcile_event(
            TransportState::Playing,
            &values(&[
                ("TransportState.val", "PAUSED_PLAYBACK"),
                ("RelativeTimePosition.val", "00:01:00"),
            ]),
        );
        assert_eq!(outcome.transport, Some(TransportState::PausedPlayback));
        assert_eq!(
            outcome.position_ticks,
            Some(60 * time_utils::TICKS_PER_SECOND)
        );
    }

    #[test]
    fn transitioning_guard_keeps_cached_state() {
        // We initiated a transition; a stale PLAYING echo arrives.
        let outcome = reconcile_event(
            TransportState::Transitioning,
            &values(&[("TransportState.val", "PLAYING")]),
        );
        assert_eq!(outcome.transport, None);
    }

    #[test]
    fn pause_echo_scenario_keeps_paused_state() {
        // Worker dispatched Pause and wrote Paused optimistically; the
        // device then pushes a stale PLAYING. Without a Transitioning
        // window the event is authoritative; the queue's suppression
        // rule handles the rest.
        let outcome = reconcile_event(
            TransportState::Paused,
            &values(&[("TransportState.val", "PLAYING")]),
        );
        assert_eq!(outcome.transport, Some(TransportState::Playing));

        // But while Transitioning, the cached state always wins.
        let guarded = reconcile_event(
            TransportState::Transitioning,
            &values(&[("TransportState.val", "PLAYING")]),
        );
        assert_eq!(guarded.transport, None);
    }

    #[test]
    fn stop_event_clears_media_and_schedules_poll() {
        let outcome = reconcile_event(
            TransportState::Playing,
            &values(&[("TransportState.val", "STOPPED")]),
        );
        assert_eq!(outcome.transport, Some(TransportState::Stopped));
        assert_eq!(outcome.media, MediaDecision::Clear);
        assert!(outcome.schedule_poll);
    }

    #[test]
    fn missing_position_while_playing_probes_once() {
        let outcome = reconcile_event(
            TransportState::Playing,
            &values(&[("CurrentTrackDuration.val", "00:04:00")]),
        );
        assert!(outcome.probe_position);
        assert_eq!(
            outcome.duration_ticks,
            Some(240 * time_utils::TICKS_PER_SECOND)
        );
    }

    #[test]
    fn didl_in_event_yields_media() {
        let outcome = reconcile_event(
            TransportState::Playing,
            &values(&[
                ("TransportState.val", "PLAYING"),
                ("item.id", "42"),
                ("res", "http://server/Audio/42/stream.mp3"),
            ]),
        );
        match &outcome.media {
            MediaDecision::FromEvent(media) => {
                assert_eq!(media.id, "42");
                assert_eq!(media.url, "http://server/Audio/42/stream.mp3");
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn playback_event_without_didl_probes_device() {
        let outcome = reconcile_event(
            TransportState::Stopped,
            &values(&[("TransportState.val", "PLAYING")]),
        );
        assert_eq!(outcome.media, MediaDecision::ProbeDevice);
    }

    #[test]
    fn volume_only_event_never_probes_media() {
        let outcome = reconcile_event(TransportState::Playing, &values(&[("Volume.val", "10")]));
        assert_eq!(outcome.media, MediaDecision::Leave);
    }

    #[test]
    fn media_from_values_prefers_res_then_track_uri() {
        let map = values(&[
            ("res", "http://server/a"),
            ("TrackURI", "http://server/b"),
        ]);
        assert_eq!(media_from_values(&map).unwrap().url, "http://server/a");

        let map = values(&[("TrackURI", "http://server/b")]);
        assert_eq!(media_from_values(&map).unwrap().url, "http://server/b");

        assert!(media_from_values(&values(&[])).is_none());
        assert!(media_from_values(&values(&[("res", "  ")])).is_none());
    }

    #[test]
    fn same_item_compares_ids_then_urls() {
        let a = CurrentMedia {
            id: "1".into(),
            url: "http://x/1?StartTimeTicks=0".into(),
        };
        let b = CurrentMedia {
            id: "1".into(),
            url: "http://x/1?StartTimeTicks=500".into(),
        };
        assert!(same_item(&a, &b));

        let c = CurrentMedia {
            id: String::new(),
            url: "http://x/1".into(),
        };
        let d = CurrentMedia {
            id: String::new(),
            url: "http://x/1".into(),
        };
        assert!(same_item(&c, &d));

        let e = CurrentMedia {
            id: "2".into(),
            url: b.url.clone(),
        };
        assert!(!same_item(&b, &e));
    }
}
