//! One live renderer session.
//!
//! The session owns the cached device state, the lazily fetched action
//! schemas, the two event subscriptions, the command queue worker and the
//! poll timer. All SOAP writes to the renderer flow through the queue
//! worker; events and polls only read-modify-write the cached state under
//! the session lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use castconfig::Config;
use castupnp::description::{DeviceDescription, DeviceService, ServiceKind};
use castupnp::scpd::{parse_scpd, ServiceSchema};

use crate::device::{CommandQueue, DeadlineTimer, SessionCommand, VolumeRange};
use crate::errors::ControlError;
use crate::model::{CurrentMedia, MediaData, MediaKind, TransportState};
use crate::soap_client::{self, ClientIdentity};
use crate::stream;
use crate::time_utils;

/// How long a cached device value satisfies a Get helper before we ask
/// the device again.
pub(crate) const CACHE_FRESHNESS: Duration = Duration::from_secs(5);

/// Lease we request on event subscriptions.
const SUBSCRIBE_TIMEOUT_SECS: u32 = 60;

/// Settle time between SetAVTransportURI and Play; devices need a moment
/// to open the stream.
const URI_SETTLE: Duration = Duration::from_millis(50);

/// Pulse delay after an optimistic state write, so the next poll confirms
/// quickly.
const CONFIRM_PULSE: Duration = Duration::from_millis(100);

/// Observable playback transitions. The playlist controller is the sole
/// subscriber; it receives the capability to act, never ownership of the
/// session.
pub trait SessionCallbacks: Send + Sync {
    fn on_playback_start(&self, media: &CurrentMedia);
    fn on_playback_progress(&self, media: &CurrentMedia);
    fn on_playback_stopped(&self, media: &CurrentMedia);
    fn on_media_changed(&self, from: &CurrentMedia, to: &CurrentMedia);
    /// Three consecutive poll failures.
    fn on_unavailable(&self);
    /// A queued command failed with a device fault.
    fn on_command_error(&self, media_type: Option<MediaKind>, error: &ControlError);
}

/// Timer and timeout knobs, distilled from the configuration once at
/// session creation.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    pub timeout: Duration,
    pub queue_interval: Duration,
    pub poll_interval: Duration,
}

impl SessionTuning {
    pub fn from_config(config: &Config) -> Self {
        SessionTuning {
            timeout: config.communication_timeout(),
            queue_interval: config.queue_processing_interval(),
            poll_interval: config.device_polling_interval(),
        }
    }
}

#[cfg(test)]
impl Default for SessionTuning {
    fn default() -> Self {
        SessionTuning {
            timeout: Duration::from_millis(8_000),
            queue_interval: Duration::from_millis(1_000),
            poll_interval: Duration::from_millis(30_000),
        }
    }
}

/// Everything protected by the session lock.
pub(crate) struct DeviceState {
    pub transport: TransportState,
    /// The item the renderer *reports*; owned by the reconciler.
    pub media: Option<CurrentMedia>,
    /// The URL we last loaded ourselves; the reconciler confirms it.
    pub playing_url: Option<String>,
    pub media_type: Option<MediaKind>,
    pub position_ticks: i64,
    pub duration_ticks: Option<i64>,
    /// Added to position reads so the UI slider does not lag the wire.
    pub position_offset: Duration,
    /// Device-scale volume.
    pub volume: i64,
    pub mute: bool,
    /// Last non-zero volume, for the SetVolume mute fallback.
    pub mute_volume: i64,
    pub volume_range: VolumeRange,
    pub avt_sid: Option<String>,
    pub rc_sid: Option<String>,
    pub last_transport_refresh: Option<Instant>,
    pub last_volume_refresh: Option<Instant>,
    pub last_mute_refresh: Option<Instant>,
    pub last_position_refresh: Option<Instant>,
    pub poll_failures: u32,
}

impl DeviceState {
    fn new() -> Self {
        DeviceState {
            transport: TransportState::NoMediaPresent,
            media: None,
            playing_url: None,
            media_type: None,
            position_ticks: 0,
            duration_ticks: None,
            position_offset: Duration::ZERO,
            volume: 0,
            mute: false,
            mute_volume: 0,
            volume_range: VolumeRange::default(),
            avt_sid: None,
            rc_sid: None,
            last_transport_refresh: None,
            last_volume_refresh: None,
            last_mute_refresh: None,
            last_position_refresh: None,
            poll_failures: 0,
        }
    }
}

pub struct RendererSession {
    /// Identifier in the event callback URL; routes NOTIFYs back to us.
    event_session_id: String,
    /// Our server base URL, e.g. `http://192.168.1.5:8096`.
    callback_base: String,
    identity: ClientIdentity,
    tuning: SessionTuning,
    description: RwLock<Arc<DeviceDescription>>,
    /// Some renderers want the metadata document escaped a second time.
    escape_metadata: AtomicBool,
    schemas: Mutex<HashMap<ServiceKind, Arc<ServiceSchema>>>,
    pub(crate) state: Mutex<DeviceState>,
    queue: Arc<CommandQueue>,
    poller: Arc<DeadlineTimer>,
    callbacks: RwLock<Option<Arc<dyn SessionCallbacks>>>,
    disposed: AtomicBool,
}

impl RendererSession {
    pub fn new(
        description: DeviceDescription,
        event_session_id: String,
        callback_base: String,
        identity: ClientIdentity,
        tuning: SessionTuning,
    ) -> Arc<Self> {
        Arc::new(RendererSession {
            event_session_id,
            callback_base,
            identity,
            tuning,
            description: RwLock::new(Arc::new(description)),
            escape_metadata: AtomicBool::new(false),
            schemas: Mutex::new(HashMap::new()),
            state: Mutex::new(DeviceState::new()),
            queue: Arc::new(CommandQueue::new()),
            poller: Arc::new(DeadlineTimer::new()),
            callbacks: RwLock::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------

    pub fn event_session_id(&self) -> &str {
        &self.event_session_id
    }

    pub fn description(&self) -> Arc<DeviceDescription> {
        Arc::clone(&self.description.read().unwrap())
    }

    pub fn friendly_name(&self) -> String {
        self.description().friendly_name.clone()
    }

    pub fn uuid(&self) -> String {
        self.description().uuid().to_string()
    }

    /// Replace the description wholesale (device moved or announced a new
    /// base URL). The schema cache is invalid with it.
    pub fn refresh_description(&self, description: DeviceDescription) {
        *self.description.write().unwrap() = Arc::new(description);
        self.schemas.lock().unwrap().clear();
        let mut state = self.state.lock().unwrap();
        state.avt_sid = None;
        state.rc_sid = None;
    }

    pub fn set_callbacks(&self, callbacks: Arc<dyn SessionCallbacks>) {
        *self.callbacks.write().unwrap() = Some(callbacks);
    }

    pub fn set_metadata_escaping(&self, escape: bool) {
        self.escape_metadata.store(escape, Ordering::Relaxed);
    }

    pub(crate) fn callbacks(&self) -> Option<Arc<dyn SessionCallbacks>> {
        self.callbacks.read().unwrap().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Bring the session online: volume range from the RenderingControl
    /// SCPD, primed caches, subscriptions, poll timer and queue worker.
    pub fn start(self: &Arc<Self>) {
        self.init_volume_range();

        // Prime the caches; a device that rejects these still gets a
        // session, the poll loop will sort reality out.
        if let Err(e) = self.refresh_position_now() {
            debug!(device = %self.friendly_name(), error = %e, "initial position probe failed");
        }
        if let Err(e) = self.refresh_volume_now() {
            debug!(device = %self.friendly_name(), error = %e, "initial volume probe failed");
        }
        if let Err(e) = self.refresh_mute_now() {
            debug!(device = %self.friendly_name(), error = %e, "initial mute probe failed");
        }

        self.ensure_subscribed();
        self.start_poller();
        self.start_queue_worker();
        info!(device = %self.friendly_name(), "renderer session started");
    }

    /// Tear down: stop the worker and timer, drop subscriptions
    /// (best-effort) and break the controller link.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(device = %self.friendly_name(), "disposing renderer session");
        self.queue.dispose();
        self.poller.dispose();
        self.unsubscribe_all();
        self.callbacks.write().unwrap().take();
    }

    // ------------------------------------------------------------------
    // Public command surface (everything goes through the queue)
    // ------------------------------------------------------------------

    pub fn enqueue(&self, command: SessionCommand) {
        self.queue.enqueue(command);
    }

    pub fn play(&self) {
        self.enqueue(SessionCommand::Play);
    }

    pub fn pause(&self) {
        self.enqueue(SessionCommand::Pause);
    }

    pub fn stop(&self) {
        self.enqueue(SessionCommand::Stop);
    }

    pub fn seek(&self, ticks: i64) {
        self.enqueue(SessionCommand::Seek { ticks });
    }

    pub fn set_media(&self, media: MediaData) {
        self.enqueue(SessionCommand::SetMedia { media });
    }

    pub fn set_next_media(&self, media: MediaData) {
        self.enqueue(SessionCommand::SetNextMedia { media });
    }

    pub fn mute(&self) {
        self.enqueue(SessionCommand::Mute);
    }

    pub fn unmute(&self) {
        self.enqueue(SessionCommand::Unmute);
    }

    pub fn toggle_mute(&self) {
        self.enqueue(SessionCommand::ToggleMute);
    }

    /// Set volume on the 0–100 user scale.
    pub fn set_volume_user(&self, user: u32) {
        let device_value = {
            let state = self.state.lock().unwrap();
            state.volume_range.device_value(user)
        };
        self.enqueue(SessionCommand::SetVolume { device_value });
    }

    pub fn volume_up(&self) {
        let device_value = {
            let state = self.state.lock().unwrap();
            (state.volume + state.volume_range.step()).min(state.volume_range.max)
        };
        self.enqueue(SessionCommand::SetVolume { device_value });
    }

    pub fn volume_down(&self) {
        let device_value = {
            let state = self.state.lock().unwrap();
            (state.volume - state.volume_range.step()).max(state.volume_range.min)
        };
        self.enqueue(SessionCommand::SetVolume { device_value });
    }

    // ------------------------------------------------------------------
    // Cached state accessors
    // ------------------------------------------------------------------

    pub fn transport_state(&self) -> TransportState {
        self.state.lock().unwrap().transport
    }

    pub fn is_playing(&self) -> bool {
        self.transport_state().is_playing()
    }

    pub fn is_paused(&self) -> bool {
        self.transport_state().is_paused()
    }

    /// Current position including the transport offset while playing.
    pub fn position_ticks(&self) -> i64 {
        let state = self.state.lock().unwrap();
        let mut ticks = state.position_ticks;
        if state.transport.is_playing() {
            ticks += (state.position_offset.as_millis() as i64)
                * (time_utils::TICKS_PER_SECOND / 1000);
        }
        ticks
    }

    pub fn duration_ticks(&self) -> Option<i64> {
        self.state.lock().unwrap().duration_ticks
    }

    pub fn current_media(&self) -> Option<CurrentMedia> {
        self.state.lock().unwrap().media.clone()
    }

    pub fn media_type(&self) -> Option<MediaKind> {
        self.state.lock().unwrap().media_type
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().unwrap().mute
    }

    pub fn volume_user(&self) -> u32 {
        let state = self.state.lock().unwrap();
        state.volume_range.user_value(state.volume)
    }

    // ------------------------------------------------------------------
    // SOAP plumbing
    // ------------------------------------------------------------------

    fn service(&self, kind: ServiceKind) -> Result<DeviceService, ControlError> {
        self.description()
            .service(kind)
            .cloned()
            .ok_or_else(|| ControlError::device_unsupported(kind.label()))
    }

    /// Schema for one service, fetched and parsed on first use.
    fn schema(&self, kind: ServiceKind) -> Result<Arc<ServiceSchema>, ControlError> {
        if let Some(schema) = self.schemas.lock().unwrap().get(&kind) {
            return Ok(Arc::clone(schema));
        }
        let service = self.service(kind)?;
        let xml = soap_client::fetch_device_xml(
            &service.scpd_url,
            self.tuning.timeout,
            &self.identity,
        )?;
        let schema = Arc::new(
            parse_scpd(xml.as_bytes())
                .map_err(|e| ControlError::MalformedXml(format!("SCPD {}: {e}", kind.label())))?,
        );
        self.schemas
            .lock()
            .unwrap()
            .insert(kind, Arc::clone(&schema));
        Ok(schema)
    }

    /// Invoke one action on one service, returning the flattened reply.
    pub(crate) fn invoke(
        &self,
        kind: ServiceKind,
        action: &str,
        values: &[(&str, String)],
        command_param: Option<&str>,
        content_features: Option<&str>,
    ) -> Result<HashMap<String, String>, ControlError> {
        if self.is_disposed() {
            return Err(ControlError::Cancelled);
        }
        let service = self.service(kind)?;
        let schema = self.schema(kind)?;
        let Some(act) = schema.action(action) else {
            return Err(ControlError::device_unsupported(action));
        };

        let body = schema
            .build_action_body(&service.service_type, act, values, command_param)
            .map_err(|e| ControlError::MalformedXml(format!("building {action}: {e}")))?;

        let reply = soap_client::invoke_upnp_action(
            &service.control_url,
            &service.service_type,
            action,
            &body,
            content_features,
            self.tuning.timeout,
            &self.identity,
        )?;

        // Position reads lag by roughly half the round trip; remember the
        // skew so the slider stays smooth.
        let offset = reply.round_trip.div_f64(1.8);
        self.state.lock().unwrap().position_offset = offset;

        Ok(reply.values)
    }

    /// GetProtocolInfo (Sink side) for profile resolution.
    pub fn protocol_info(&self) -> Result<String, ControlError> {
        let values = self.invoke(ServiceKind::ConnectionManager, "GetProtocolInfo", &[], None, None)?;
        Ok(values.get("Sink").cloned().unwrap_or_default())
    }

    fn init_volume_range(&self) {
        let range = match self.schema(ServiceKind::RenderingControl) {
            Ok(schema) => match schema.state_variable("Volume") {
                Some(var) => VolumeRange::from_scpd(var.range_min.as_deref(), var.range_max.as_deref()),
                None => VolumeRange::default(),
            },
            Err(e) => {
                debug!(device = %self.friendly_name(), error = %e, "no RenderingControl SCPD, assuming 0-100 volume");
                VolumeRange::default()
            }
        };
        self.state.lock().unwrap().volume_range = range;
    }

    // ------------------------------------------------------------------
    // Freshness-gated reads
    // ------------------------------------------------------------------

    fn fresh(last: Option<Instant>) -> bool {
        last.is_some_and(|at| at.elapsed() < CACHE_FRESHNESS)
    }

    /// Cached transport state, refreshed from the device when stale.
    pub fn refresh_transport(&self) -> Result<TransportState, ControlError> {
        {
            let state = self.state.lock().unwrap();
            if Self::fresh(state.last_transport_refresh) {
                return Ok(state.transport);
            }
        }
        self.refresh_transport_now()
    }

    /// Unconditional GetTransportInfo (the poll path).
    pub(crate) fn refresh_transport_now(&self) -> Result<TransportState, ControlError> {
        let values = self.invoke(ServiceKind::AVTransport, "GetTransportInfo", &[], None, None)?;

        let reported = values
            .get("CurrentTransportState")
            .map(|raw| TransportState::from_wire(raw))
            .unwrap_or(TransportState::Error);
        let status_error = values
            .get("CurrentTransportStatus")
            .is_some_and(|s| !s.eq_ignore_ascii_case("OK"));

        let mut state = self.state.lock().unwrap();
        state.last_transport_refresh = Some(Instant::now());
        if status_error {
            return Ok(TransportState::Error);
        }
        // Transitioning is ours; the device echo must not revert it.
        if state.transport != TransportState::Transitioning {
            state.transport = reported;
        }
        Ok(reported)
    }

    pub fn refresh_volume(&self) -> Result<i64, ControlError> {
        {
            let state = self.state.lock().unwrap();
            if Self::fresh(state.last_volume_refresh) {
                return Ok(state.volume);
            }
        }
        self.refresh_volume_now()
    }

    fn refresh_volume_now(&self) -> Result<i64, ControlError> {
        let values = self.invoke(
            ServiceKind::RenderingControl,
            "GetVolume",
            &[("Channel", "Master".to_string())],
            Some("Master"),
            None,
        )?;
        let volume = values
            .get("CurrentVolume")
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| ControlError::MalformedXml("GetVolume without CurrentVolume".into()))?;

        let mut state = self.state.lock().unwrap();
        state.volume = volume;
        if volume > 0 {
            state.mute_volume = volume;
        }
        state.last_volume_refresh = Some(Instant::now());
        Ok(volume)
    }

    pub fn refresh_mute(&self) -> Result<bool, ControlError> {
        {
            let state = self.state.lock().unwrap();
            if Self::fresh(state.last_mute_refresh) {
                return Ok(state.mute);
            }
        }
        self.refresh_mute_now()
    }

    fn refresh_mute_now(&self) -> Result<bool, ControlError> {
        let values = self.invoke(
            ServiceKind::RenderingControl,
            "GetMute",
            &[("Channel", "Master".to_string())],
            Some("Master"),
            None,
        )?;
        let mute = values
            .get("CurrentMute")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .ok_or_else(|| ControlError::MalformedXml("GetMute without CurrentMute".into()))?;

        let mut state = self.state.lock().unwrap();
        state.mute = mute;
        state.last_mute_refresh = Some(Instant::now());
        Ok(mute)
    }

    /// GetPositionInfo, applying duration/position and returning the raw
    /// values for media extraction.
    pub(crate) fn refresh_position_now(
        &self,
    ) -> Result<HashMap<String, String>, ControlError> {
        let values = self.invoke(ServiceKind::AVTransport, "GetPositionInfo", &[], None, None)?;

        let mut state = self.state.lock().unwrap();
        if let Some(duration) = values
            .get("TrackDuration")
            .and_then(|v| time_utils::parse_hms_to_ticks(v))
        {
            if duration > 0 {
                state.duration_ticks = Some(duration);
            }
        }
        if let Some(position) = values
            .get("RelTime")
            .and_then(|v| time_utils::parse_hms_to_ticks(v))
        {
            state.position_ticks = position;
        }
        state.last_position_refresh = Some(Instant::now());
        Ok(values)
    }

    // ------------------------------------------------------------------
    // Queue worker and dispatch
    // ------------------------------------------------------------------

    fn start_queue_worker(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let queue = Arc::clone(&self.queue);
        let spawn = std::thread::Builder::new()
            .name(format!("queue-{}", self.event_session_id))
            .spawn(move || {
                while let Some(command) = queue.pop_wait() {
                    session.ensure_subscribed();
                    let kind = command.kind();
                    if let Err(error) = session.dispatch(command) {
                        warn!(
                            device = %session.friendly_name(),
                            command = kind,
                            error = %error,
                            "command failed"
                        );
                        if error.is_fault() {
                            if let Some(callbacks) = session.callbacks() {
                                callbacks.on_command_error(session.media_type(), &error);
                            }
                        }
                    }
                    // Devices choke on back-to-back requests; this sleep is
                    // the rate limit.
                    std::thread::sleep(session.tuning.queue_interval);
                }
            });
        if let Err(e) = spawn {
            warn!(error = %e, "cannot spawn queue worker");
        }
    }

    fn dispatch(&self, command: SessionCommand) -> Result<(), ControlError> {
        match command {
            SessionCommand::Play => self.dispatch_play(),
            SessionCommand::Pause => self.dispatch_pause(),
            SessionCommand::Stop => self.dispatch_stop(),
            SessionCommand::Seek { ticks } => self.dispatch_seek(ticks),
            SessionCommand::SetVolume { device_value } => self.dispatch_set_volume(device_value),
            SessionCommand::Mute => self.dispatch_set_mute(true),
            SessionCommand::Unmute => self.dispatch_set_mute(false),
            SessionCommand::ToggleMute => {
                let muted = self.is_muted();
                self.dispatch_set_mute(!muted)
            }
            SessionCommand::SetMedia { media } => self.dispatch_set_media(media),
            SessionCommand::SetNextMedia { media } => self.dispatch_set_next_media(media),
        }
    }

    fn dispatch_play(&self) -> Result<(), ControlError> {
        if self.transport_state().is_playing() {
            return Ok(());
        }
        self.invoke(
            ServiceKind::AVTransport,
            "Play",
            &[("Speed", "1".to_string())],
            Some("1"),
            None,
        )?;
        self.state.lock().unwrap().transport = TransportState::Playing;
        self.poller.pulse(CONFIRM_PULSE);
        Ok(())
    }

    fn dispatch_pause(&self) -> Result<(), ControlError> {
        if self.transport_state().is_paused() {
            return Ok(());
        }
        self.invoke(ServiceKind::AVTransport, "Pause", &[], None, None)?;
        self.state.lock().unwrap().transport = TransportState::Paused;
        self.poller.pulse(CONFIRM_PULSE);
        Ok(())
    }

    fn dispatch_stop(&self) -> Result<(), ControlError> {
        if self.transport_state().is_stopped() {
            return Ok(());
        }
        self.invoke(ServiceKind::AVTransport, "Stop", &[], None, None)?;
        self.state.lock().unwrap().transport = TransportState::Stopped;
        self.poller.pulse(CONFIRM_PULSE);
        Ok(())
    }

    fn dispatch_seek(&self, ticks: i64) -> Result<(), ControlError> {
        let transport = self.transport_state();
        if !transport.is_playing() && !transport.is_paused() {
            return Ok(());
        }
        self.seek_now(ticks)
    }

    fn seek_now(&self, ticks: i64) -> Result<(), ControlError> {
        self.invoke(
            ServiceKind::AVTransport,
            "Seek",
            &[
                ("Unit", "REL_TIME".to_string()),
                ("Target", time_utils::ticks_to_hhmmss(ticks)),
            ],
            Some("REL_TIME"),
            None,
        )?;
        self.state.lock().unwrap().position_ticks = ticks;
        Ok(())
    }

    fn dispatch_set_volume(&self, device_value: i64) -> Result<(), ControlError> {
        if self.state.lock().unwrap().volume == device_value {
            return Ok(());
        }
        self.invoke(
            ServiceKind::RenderingControl,
            "SetVolume",
            &[
                ("Channel", "Master".to_string()),
                ("DesiredVolume", device_value.to_string()),
            ],
            Some("Master"),
            None,
        )?;
        let mut state = self.state.lock().unwrap();
        state.volume = device_value;
        if device_value > 0 {
            state.mute_volume = device_value;
        }
        Ok(())
    }

    /// SetMute with the SetVolume(0) fallback for renderers whose
    /// RenderingControl has no mute.
    fn dispatch_set_mute(&self, mute: bool) -> Result<(), ControlError> {
        if self.is_muted() == mute {
            return Ok(());
        }

        let direct = self.invoke(
            ServiceKind::RenderingControl,
            "SetMute",
            &[
                ("Channel", "Master".to_string()),
                ("DesiredMute", if mute { "1" } else { "0" }.to_string()),
            ],
            Some("Master"),
            None,
        );

        match direct {
            Ok(_) => {
                self.state.lock().unwrap().mute = mute;
                Ok(())
            }
            Err(e) => {
                debug!(device = %self.friendly_name(), error = %e, "SetMute failed, using volume fallback");
                let target = {
                    let state = self.state.lock().unwrap();
                    mute_fallback_volume(mute, state.mute_volume, state.volume_range.step())
                };
                self.dispatch_set_volume(target)?;
                self.state.lock().unwrap().mute = mute;
                Ok(())
            }
        }
    }

    /// The media change protocol.
    fn dispatch_set_media(&self, media: MediaData) -> Result<(), ControlError> {
        let (playing, current_url) = {
            let state = self.state.lock().unwrap();
            let current = state
                .playing_url
                .clone()
                .or_else(|| state.media.as_ref().map(|m| m.url.clone()));
            (state.transport.is_playing(), current)
        };

        if playing {
            if let Some(current) = current_url.as_deref() {
                if stream::strip_start_ticks(&media.url) == stream::strip_start_ticks(current) {
                    if media.url == current {
                        // Same stream: a renderer-side seek is all that is
                        // asked for.
                        if media.reset_playback || media.position_ticks > 0 {
                            self.seek_now(media.position_ticks)?;
                        }
                        return Ok(());
                    }
                    // Same item at a new start offset: the old transcode
                    // must stop before the replacement URI loads.
                    self.invoke(ServiceKind::AVTransport, "Stop", &[], None, None)?;
                    let mut state = self.state.lock().unwrap();
                    state.transport = TransportState::Transitioning;
                    state.media = None;
                    state.playing_url = None;
                }
            }
        }

        let metadata = if self.escape_metadata.load(Ordering::Relaxed) {
            xml_escape(&media.metadata)
        } else {
            media.metadata.clone()
        };

        let loaded = self
            .invoke(
                ServiceKind::AVTransport,
                "SetAVTransportURI",
                &[
                    ("CurrentURI", media.url.clone()),
                    ("CurrentURIMetaData", metadata),
                ],
                None,
                Some(&media.content_features),
            )
            .and_then(|_| {
                std::thread::sleep(URI_SETTLE);
                self.invoke(
                    ServiceKind::AVTransport,
                    "Play",
                    &[("Speed", "1".to_string())],
                    Some("1"),
                    None,
                )
            });
        if let Err(error) = loaded {
            // A stuck Transitioning window would gag the reconciler for
            // good; the device is stopped, say so.
            let mut state = self.state.lock().unwrap();
            if state.transport == TransportState::Transitioning {
                state.transport = TransportState::Stopped;
            }
            return Err(error);
        }

        {
            let mut state = self.state.lock().unwrap();
            state.transport = TransportState::Playing;
            // The reconciler confirms the new item from the device's own
            // mouth; here we only remember what we asked for.
            state.playing_url = Some(media.url.clone());
            state.media_type = Some(media.media_type);
            state.position_ticks = 0;
            state.duration_ticks = None;
        }
        self.poller.pulse(CONFIRM_PULSE);
        Ok(())
    }

    fn dispatch_set_next_media(&self, media: MediaData) -> Result<(), ControlError> {
        let metadata = if self.escape_metadata.load(Ordering::Relaxed) {
            xml_escape(&media.metadata)
        } else {
            media.metadata.clone()
        };
        self.invoke(
            ServiceKind::AVTransport,
            "SetNextAVTransportURI",
            &[
                ("NextURI", media.url.clone()),
                ("NextURIMetaData", metadata),
            ],
            None,
            Some(&media.content_features),
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    fn start_poller(self: &Arc<Self>) {
        let session = Arc::clone(self);
        self.poller.start(&self.event_session_id, move || {
            session.poll();
        });
        self.poller.schedule(self.tuning.poll_interval);
    }

    fn poll(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }

        let transport = match self.refresh_transport_now() {
            Ok(state) => {
                self.state.lock().unwrap().poll_failures = 0;
                state
            }
            Err(error) => {
                let failures = {
                    let mut state = self.state.lock().unwrap();
                    state.poll_failures += 1;
                    state.poll_failures
                };
                warn!(
                    device = %self.friendly_name(),
                    error = %error,
                    failures,
                    "status poll failed"
                );
                if failures >= 3 {
                    if let Some(callbacks) = self.callbacks() {
                        callbacks.on_unavailable();
                    }
                    return;
                }
                self.poller.schedule(self.tuning.poll_interval);
                return;
            }
        };

        match transport {
            TransportState::Error => {
                self.poller.schedule(self.tuning.poll_interval);
            }
            TransportState::Stopped => {
                // Nothing to watch until an event or a new command wakes
                // us back up.
                self.update_media_info(None);
                self.poller.park();
            }
            _ => {
                match self.refresh_position_now() {
                    Ok(values) => {
                        let media = match crate::device::reconcile::media_from_values(&values) {
                            Some(media) => Some(media),
                            None => self.fetch_media_info(),
                        };
                        if let Some(media) = media {
                            self.update_media_info(Some(media));
                        }
                    }
                    Err(error) => {
                        debug!(device = %self.friendly_name(), error = %error, "position poll failed");
                    }
                }
                self.poller.schedule(self.tuning.poll_interval);
            }
        }
    }

    /// GetMediaInfo fallback when a reply or event had no usable DIDL.
    pub(crate) fn fetch_media_info(&self) -> Option<CurrentMedia> {
        match self.invoke(ServiceKind::AVTransport, "GetMediaInfo", &[], None, None) {
            Ok(values) => crate::device::reconcile::media_from_values(&values),
            Err(error) => {
                debug!(device = %self.friendly_name(), error = %error, "GetMediaInfo failed");
                None
            }
        }
    }

    /// Wake the poll timer; used by the reconciler when a stop event asks
    /// for a confirming poll.
    pub(crate) fn schedule_poll(&self) {
        self.poller.schedule(self.tuning.poll_interval);
    }

    pub(crate) fn probe_position(&self) {
        let _ = self.refresh_position_now();
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    fn callback_url(&self) -> String {
        format!(
            "{}/Dlna/Eventing/{}",
            self.callback_base.trim_end_matches('/'),
            self.event_session_id
        )
    }

    fn subscription_targets(&self) -> [(ServiceKind, &'static str); 2] {
        [
            (
                ServiceKind::AVTransport,
                "TransportState,CurrentTrackDuration,RelativeTimePosition,AVTransportURI",
            ),
            (ServiceKind::RenderingControl, "Volume,Mute"),
        ]
    }

    /// Subscribe any service that has no live SID.
    pub(crate) fn ensure_subscribed(&self) {
        if self.is_disposed() {
            return;
        }
        for (kind, state_vars) in self.subscription_targets() {
            let existing = {
                let state = self.state.lock().unwrap();
                match kind {
                    ServiceKind::AVTransport => state.avt_sid.clone(),
                    _ => state.rc_sid.clone(),
                }
            };
            if existing.is_some() {
                continue;
            }
            let Ok(service) = self.service(kind) else {
                continue;
            };
            if service.event_sub_url.is_empty() {
                continue;
            }
            match soap_client::subscribe_events(
                &service.event_sub_url,
                Some(&self.callback_url()),
                None,
                Some(state_vars),
                SUBSCRIBE_TIMEOUT_SECS,
                self.tuning.timeout,
                &self.identity,
            ) {
                Ok(outcome) => {
                    debug!(device = %self.friendly_name(), service = kind.label(), sid = outcome.sid.as_str(), "subscribed");
                    let mut state = self.state.lock().unwrap();
                    match kind {
                        ServiceKind::AVTransport => state.avt_sid = Some(outcome.sid),
                        _ => state.rc_sid = Some(outcome.sid),
                    }
                }
                Err(error) => {
                    debug!(device = %self.friendly_name(), service = kind.label(), error = %error, "subscribe failed");
                }
            }
        }
    }

    /// Renew both leases; a failed renewal drops the SID so the next
    /// queue pass re-subscribes from scratch.
    pub(crate) fn renew_subscriptions(&self) {
        if self.is_disposed() {
            return;
        }
        for (kind, _) in self.subscription_targets() {
            let sid = {
                let state = self.state.lock().unwrap();
                match kind {
                    ServiceKind::AVTransport => state.avt_sid.clone(),
                    _ => state.rc_sid.clone(),
                }
            };
            let Some(sid) = sid else { continue };
            let Ok(service) = self.service(kind) else {
                continue;
            };
            if let Err(error) = soap_client::subscribe_events(
                &service.event_sub_url,
                None,
                Some(&sid),
                None,
                SUBSCRIBE_TIMEOUT_SECS,
                self.tuning.timeout,
                &self.identity,
            ) {
                debug!(device = %self.friendly_name(), service = kind.label(), error = %error, "renewal failed");
                let mut state = self.state.lock().unwrap();
                match kind {
                    ServiceKind::AVTransport => state.avt_sid = None,
                    _ => state.rc_sid = None,
                }
            }
        }
    }

    fn unsubscribe_all(&self) {
        let (avt_sid, rc_sid) = {
            let mut state = self.state.lock().unwrap();
            (state.avt_sid.take(), state.rc_sid.take())
        };
        for (kind, sid) in [
            (ServiceKind::AVTransport, avt_sid),
            (ServiceKind::RenderingControl, rc_sid),
        ] {
            let Some(sid) = sid else { continue };
            let Ok(service) = self.service(kind) else {
                continue;
            };
            if let Err(error) = soap_client::unsubscribe_events(
                &service.event_sub_url,
                &sid,
                self.tuning.timeout,
                &self.identity,
            ) {
                debug!(device = %self.friendly_name(), service = kind.label(), error = %error, "unsubscribe failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Test support
    // ------------------------------------------------------------------

    #[cfg(test)]
    pub(crate) fn queue_snapshot(&self) -> Vec<SessionCommand> {
        self.queue.pending_snapshot()
    }

    #[cfg(test)]
    pub(crate) fn test_set_playback(
        &self,
        transport: TransportState,
        media: Option<CurrentMedia>,
        media_type: Option<MediaKind>,
        position_ticks: i64,
        duration_ticks: Option<i64>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.transport = transport;
        state.playing_url = media.as_ref().map(|m| m.url.clone());
        state.media = media;
        state.media_type = media_type;
        state.position_ticks = position_ticks;
        state.duration_ticks = duration_ticks;
    }
}

/// Volume to send when muting or unmuting through the SetVolume fallback:
/// 0 to mute; the remembered pre-mute level, or four steps as a sane
/// audible default, to unmute.
pub(crate) fn mute_fallback_volume(mute: bool, mute_volume: i64, step: i64) -> i64 {
    if mute {
        0
    } else if mute_volume > 0 {
        mute_volume
    } else {
        step * 4
    }
}

/// Escape a metadata document one extra time, for renderers that expect
/// entity-encoded DIDL inside the argument.
fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 16);
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use castupnp::description::parse_description;

    pub(crate) const TEST_DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Test Renderer</friendlyName>
    <manufacturer>Acme</manufacturer>
    <modelName>AcmeCast 3000</modelName>
    <UDN>uuid:11111111-2222-3333-4444-555555555555</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <SCPDURL>/avt.xml</SCPDURL>
        <controlURL>/control/avt</controlURL>
        <eventSubURL>/event/avt</eventSubURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
        <SCPDURL>/rc.xml</SCPDURL>
        <controlURL>/control/rc</controlURL>
        <eventSubURL>/event/rc</eventSubURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:ConnectionManager:1</serviceType>
        <SCPDURL>/cm.xml</SCPDURL>
        <controlURL>/control/cm</controlURL>
        <eventSubURL></eventSubURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    /// A session over an unreachable address, never started: commands pile
    /// up in the queue where tests can inspect them.
    pub(crate) fn offline_session() -> Arc<RendererSession> {
        let description = parse_description(
            TEST_DESCRIPTION.as_bytes(),
            "http://127.0.0.1:9/description.xml",
        )
        .unwrap();
        RendererSession::new(
            description,
            "test-session".to_string(),
            "http://127.0.0.1:8096".to_string(),
            ClientIdentity {
                user_agent: "test".to_string(),
                friendly_name: "test".to_string(),
            },
            SessionTuning::default(),
        )
    }
}
