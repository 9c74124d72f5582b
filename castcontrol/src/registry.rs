//! The session registry: one Device Session plus one Playlist Controller
//! per renderer on the network, created on discovery and destroyed on
//! byebye, poll death or host teardown.
//!
//! The registry mutex serializes creation against disposal; it is never
//! held while a session's own loops do network I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use castconfig::Config;
use castupnp::description::{parse_description, DeviceDescription};
use castupnp::ssdp::DiscoveredDevice;

use crate::controller::{ControllerTuning, PlaylistController};
use crate::device::{RendererSession, SessionTuning};
use crate::errors::ControlError;
use crate::host::{GeneralCommand, HostServices, PlayRequest, PlaystateRequest};
use crate::model::SessionCapabilities;
use crate::profile::{DeviceFields, ProfileRepository};
use crate::soap_client::{self, ClientIdentity};

/// Inbound host message for one session.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    Play(PlayRequest),
    Playstate(PlaystateRequest),
    General(GeneralCommand),
}

struct ActiveSession {
    location: String,
    host_session_id: String,
    session: Arc<RendererSession>,
    controller: Arc<PlaylistController>,
}

pub struct SessionRegistry {
    config: Arc<Config>,
    identity: ClientIdentity,
    /// Base URL renderers can reach us on, for event callbacks.
    server_base_url: String,
    profiles: Arc<dyn ProfileRepository>,
    services: HostServices,
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

impl SessionRegistry {
    pub fn new(
        config: Arc<Config>,
        server_base_url: String,
        profiles: Arc<dyn ProfileRepository>,
        services: HostServices,
    ) -> Arc<Self> {
        let identity = ClientIdentity {
            user_agent: config.user_agent.clone(),
            friendly_name: config.friendly_name.clone(),
        };
        Arc::new(SessionRegistry {
            config,
            identity,
            server_base_url,
            profiles,
            services,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Feed the configured static device URLs through the discovery path;
    /// used when network discovery is disabled.
    pub fn inject_static_devices(self: &Arc<Self>) {
        for location in self.config.static_devices.clone() {
            self.on_device_discovered(&DiscoveredDevice {
                location,
                endpoint: None,
                usn: String::new(),
                nt: None,
                headers: HashMap::new(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Discovery hooks
    // ------------------------------------------------------------------

    /// A device announced itself (alive or search response).
    pub fn on_device_discovered(self: &Arc<Self>, device: &DiscoveredDevice) {
        // Fast path: a known UUID whose location did not move needs no
        // description fetch at all.
        if let Some(uuid) = device.uuid() {
            let sessions = self.sessions.lock().unwrap();
            if let Some(active) = sessions.get(&uuid) {
                if active.location == device.location {
                    return;
                }
            }
        }

        let description = match self.fetch_description(&device.location) {
            Ok(description) => description,
            Err(error) => {
                debug!(location = device.location.as_str(), error = %error, "cannot describe device");
                return;
            }
        };
        if !description.is_media_renderer() {
            debug!(
                location = device.location.as_str(),
                device_type = description.device_type.as_str(),
                "ignoring non-renderer device"
            );
            return;
        }
        let uuid = description.uuid().to_ascii_lowercase();

        let mut sessions = self.sessions.lock().unwrap();
        if let Some(active) = sessions.get_mut(&uuid) {
            if active.location != device.location {
                info!(device = description.friendly_name.as_str(), "device moved, refreshing session");
                active.location = device.location.clone();
                self.refresh_session(active, description);
            }
            return;
        }

        match self.create_session(&uuid, device.location.clone(), description) {
            Ok(active) => {
                sessions.insert(uuid, active);
            }
            Err(error) => {
                warn!(location = device.location.as_str(), error = %error, "cannot open renderer session");
            }
        }
    }

    /// A byebye arrived. Only MediaRenderer announcements for a UUID we
    /// track end a session.
    pub fn on_device_left(&self, device: &DiscoveredDevice) {
        if !device.mentions_media_renderer() {
            return;
        }
        let Some(uuid) = device.uuid() else { return };
        self.remove_session(&uuid);
    }

    // ------------------------------------------------------------------
    // Event and message routing
    // ------------------------------------------------------------------

    /// Route one NOTIFY body to the session that owns the callback id.
    /// Unknown ids and malformed bodies are silently ignored; renderers
    /// re-notify constantly and the endpoint must always 200.
    pub fn dispatch_event(&self, event_session_id: &str, body: &str) {
        let session = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .find(|active| active.session.event_session_id() == event_session_id)
                .map(|active| Arc::clone(&active.session))
        };
        match session {
            Some(session) => session.handle_event(body),
            None => debug!(event_session_id, "event for unknown session"),
        }
    }

    /// Route a host message to the controller of `host_session_id`.
    pub fn send_message(&self, host_session_id: &str, message: SessionMessage) {
        let controller = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .find(|active| active.host_session_id == host_session_id)
                .map(|active| Arc::clone(&active.controller))
        };
        let Some(controller) = controller else {
            debug!(host_session_id, "message for unknown session");
            return;
        };
        match message {
            SessionMessage::Play(request) => controller.handle_play(&request),
            SessionMessage::Playstate(request) => controller.handle_playstate(&request),
            SessionMessage::General(command) => controller.handle_general(&command),
        }
    }

    /// End every session (host shutdown).
    pub fn shutdown(&self) {
        let drained: Vec<ActiveSession> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().map(|(_, active)| active).collect()
        };
        for active in drained {
            self.dispose_active(active);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle internals
    // ------------------------------------------------------------------

    fn fetch_description(&self, location: &str) -> Result<DeviceDescription, ControlError> {
        let text = soap_client::fetch_device_xml(
            location,
            self.config.communication_timeout(),
            &self.identity,
        )?;
        parse_description(text.as_bytes(), location)
            .map_err(|e| ControlError::MalformedXml(e.to_string()))
    }

    fn create_session(
        self: &Arc<Self>,
        uuid: &str,
        location: String,
        description: DeviceDescription,
    ) -> Result<ActiveSession, ControlError> {
        let friendly_name = clean_friendly_name(&description.friendly_name);
        let fields = device_fields(&description, &friendly_name);
        let host_session_id = format!("playto-{uuid}");
        let event_session_id = Uuid::new_v4().as_simple().to_string();

        let session = RendererSession::new(
            description,
            event_session_id,
            self.server_base_url.clone(),
            self.identity.clone(),
            SessionTuning::from_config(&self.config),
        );

        // Profile resolution wants the device's sink formats; a device
        // that cannot answer still gets the generic profile.
        let protocol_info = session.protocol_info().unwrap_or_default();
        let profile = self.profiles.profile_for(&fields, &protocol_info, true);

        let controller = PlaylistController::new(
            Arc::clone(&session),
            self.services.clone(),
            Arc::clone(&profile),
            host_session_id.clone(),
            ControllerTuning::from_config(&self.config),
        );
        controller.attach();

        let registry: Weak<SessionRegistry> = Arc::downgrade(self);
        let dead_uuid = uuid.to_string();
        controller.set_unavailable_hook(Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove_session(&dead_uuid);
            }
        }));

        session.start();

        self.services
            .session_manager
            .log_activity(&host_session_id, &friendly_name);
        self.services.session_manager.report_capabilities(
            &host_session_id,
            &SessionCapabilities {
                playable_media_types: profile.supported_media_types.clone(),
                supported_commands: SUPPORTED_COMMANDS.iter().map(|s| s.to_string()).collect(),
                supports_media_control: true,
            },
        );

        info!(device = friendly_name.as_str(), uuid, "renderer session opened");
        Ok(ActiveSession {
            location,
            host_session_id,
            session,
            controller,
        })
    }

    /// The device announced a new base URL: swap the description and
    /// re-resolve its profile.
    fn refresh_session(&self, active: &ActiveSession, description: DeviceDescription) {
        let friendly_name = clean_friendly_name(&description.friendly_name);
        let fields = device_fields(&description, &friendly_name);
        active.session.refresh_description(description);
        let protocol_info = active.session.protocol_info().unwrap_or_default();
        let profile = self.profiles.profile_for(&fields, &protocol_info, true);
        active
            .session
            .set_metadata_escaping(profile.requires_escaped_metadata);
    }

    fn remove_session(&self, uuid: &str) {
        let active = self.sessions.lock().unwrap().remove(uuid);
        if let Some(active) = active {
            info!(uuid, "closing renderer session");
            self.dispose_active(active);
        }
    }

    fn dispose_active(&self, active: ActiveSession) {
        self.services
            .session_manager
            .report_session_ended(&active.host_session_id);
        active.controller.dispose();
        active.session.dispose();
    }
}

const SUPPORTED_COMMANDS: [&str; 12] = [
    "VolumeUp",
    "VolumeDown",
    "Mute",
    "Unmute",
    "ToggleMute",
    "SetVolume",
    "SetAudioStreamIndex",
    "SetSubtitleStreamIndex",
    "PlayNext",
    "PlayNow",
    "PlayLast",
    "Seek",
];

fn device_fields(description: &DeviceDescription, friendly_name: &str) -> DeviceFields {
    DeviceFields {
        friendly_name: friendly_name.to_string(),
        manufacturer: description.manufacturer.clone(),
        manufacturer_url: description.manufacturer_url.clone(),
        model_description: description.model_description.clone(),
        model_name: description.model_name.clone(),
        model_number: description.model_number.clone(),
        model_url: description.model_url.clone(),
        serial_number: description.serial_number.clone(),
    }
}

/// Strip embedded MAC addresses and the empty brackets they leave behind.
/// TVs love announcing themselves as `[TV] Living Room (aa:bb:cc:dd:ee:ff)`.
pub fn clean_friendly_name(raw: &str) -> String {
    static MAC: OnceLock<Regex> = OnceLock::new();
    static EMPTY_BRACKETS: OnceLock<Regex> = OnceLock::new();

    let mac = MAC.get_or_init(|| {
        Regex::new(r"[0-9A-Fa-f]{2}([:-][0-9A-Fa-f]{2}){5}").expect("static regex")
    });
    let empty = EMPTY_BRACKETS
        .get_or_init(|| Regex::new(r"\(\s*\)|\[\s*\]").expect("static regex"));

    let without_mac = mac.replace_all(raw, "");
    let without_brackets = empty.replace_all(&without_mac, "");
    let mut cleaned = String::with_capacity(without_brackets.len());
    let mut last_space = false;
    for c in without_brackets.chars() {
        let is_space = c == ' ';
        if !(is_space && last_space) {
            cleaned.push(c);
        }
        last_space = is_space;
    }
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::offline_session;
    use crate::host::{
        DidlBuilder, MediaItem, MediaResolver, SessionHost, StreamBuilder, StreamRequest,
        StreamSource,
    };
    use crate::model::{MediaKind, NotificationKind, PlaybackReport};
    use crate::profile::{DeviceProfile, MemoryProfileRepository};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CountingHost {
        ended: StdMutex<Vec<String>>,
    }

    impl SessionHost for CountingHost {
        fn log_activity(&self, _s: &str, _d: &str) {}
        fn report_capabilities(&self, _s: &str, _c: &SessionCapabilities) {}
        fn on_playback_start(&self, _s: &str, _i: &PlaybackReport) {}
        fn on_playback_progress(&self, _s: &str, _i: &PlaybackReport) {}
        fn on_playback_stopped(&self, _s: &str, _i: &PlaybackReport) {}
        fn report_session_ended(&self, session_id: &str) {
            self.ended.lock().unwrap().push(session_id.to_string());
        }
        fn notify(&self, _s: &str, _k: NotificationKind, _m: &str) {}
    }

    struct NoResolver;
    impl MediaResolver for NoResolver {
        fn resolve(&self, _item_id: &str) -> Option<MediaItem> {
            None
        }
    }

    struct NoStreams;
    impl StreamBuilder for NoStreams {
        fn build(
            &self,
            _item: &MediaItem,
            _profile: &DeviceProfile,
            _request: &StreamRequest,
        ) -> Option<StreamSource> {
            None
        }
    }

    struct NoDidl;
    impl DidlBuilder for NoDidl {
        fn build(
            &self,
            _item: &MediaItem,
            _source: &StreamSource,
            _profile: &DeviceProfile,
        ) -> String {
            String::new()
        }
    }

    fn registry_with_host() -> (Arc<SessionRegistry>, Arc<CountingHost>) {
        let host = Arc::new(CountingHost::default());
        let services = HostServices {
            session_manager: Arc::clone(&host) as Arc<dyn SessionHost>,
            resolver: Arc::new(NoResolver),
            streams: Arc::new(NoStreams),
            didl: Arc::new(NoDidl),
        };
        let registry = SessionRegistry::new(
            Arc::new(Config::default()),
            "http://127.0.0.1:8096".to_string(),
            Arc::new(MemoryProfileRepository::empty()),
            services,
        );
        (registry, host)
    }

    fn insert_offline(registry: &Arc<SessionRegistry>, uuid: &str) {
        let session = offline_session();
        let controller = PlaylistController::new(
            Arc::clone(&session),
            registry.services.clone(),
            Arc::new(DeviceProfile::generic()),
            format!("playto-{uuid}"),
            ControllerTuning::default(),
        );
        controller.attach();
        registry.sessions.lock().unwrap().insert(
            uuid.to_string(),
            ActiveSession {
                location: "http://127.0.0.1:9/description.xml".to_string(),
                host_session_id: format!("playto-{uuid}"),
                session,
                controller,
            },
        );
    }

    #[test]
    fn clean_friendly_name_strips_macs_and_brackets() {
        assert_eq!(
            clean_friendly_name("[TV] Living Room (aa:bb:cc:dd:ee:ff)"),
            "[TV] Living Room"
        );
        assert_eq!(clean_friendly_name("Speaker [AA-BB-CC-DD-EE-FF]"), "Speaker");
        assert_eq!(clean_friendly_name("  Plain Name "), "Plain Name");
        assert_eq!(clean_friendly_name("()"), "");
    }

    #[test]
    fn device_left_ignores_non_renderers() {
        let (registry, host) = registry_with_host();
        insert_offline(&registry, "abc-123");

        registry.on_device_left(&DiscoveredDevice {
            location: String::new(),
            endpoint: None,
            usn: "uuid:abc-123::upnp:rootdevice".to_string(),
            nt: Some("upnp:rootdevice".to_string()),
            headers: HashMap::new(),
        });
        assert_eq!(registry.session_count(), 1);
        assert!(host.ended.lock().unwrap().is_empty());
    }

    #[test]
    fn device_left_closes_matching_renderer_session() {
        let (registry, host) = registry_with_host();
        insert_offline(&registry, "abc-123");

        registry.on_device_left(&DiscoveredDevice {
            location: String::new(),
            endpoint: None,
            usn: "uuid:ABC-123::urn:schemas-upnp-org:device:MediaRenderer:1".to_string(),
            nt: None,
            headers: HashMap::new(),
        });
        assert_eq!(registry.session_count(), 0);
        assert_eq!(host.ended.lock().unwrap().as_slice(), ["playto-abc-123"]);
    }

    #[test]
    fn events_route_by_session_id() {
        let (registry, _host) = registry_with_host();
        insert_offline(&registry, "abc-123");

        // The offline session's event id routes; unknown ids are ignored.
        let body = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0">
  <e:property><LastChange>&lt;Event&gt;&lt;InstanceID val="0"&gt;&lt;Volume channel="Master" val="17"/&gt;&lt;/InstanceID&gt;&lt;/Event&gt;</LastChange></e:property>
</e:propertyset>"#;
        registry.dispatch_event("test-session", body);
        registry.dispatch_event("no-such-session", body);

        let session = {
            let sessions = registry.sessions.lock().unwrap();
            Arc::clone(&sessions.get("abc-123").unwrap().session)
        };
        assert_eq!(session.volume_user(), 17);
    }

    #[test]
    fn messages_route_to_controller() {
        let (registry, _host) = registry_with_host();
        insert_offline(&registry, "abc-123");

        registry.send_message(
            "playto-abc-123",
            SessionMessage::General(GeneralCommand::SetVolume(30)),
        );
        registry.send_message(
            "playto-unknown",
            SessionMessage::General(GeneralCommand::SetVolume(99)),
        );

        let session = {
            let sessions = registry.sessions.lock().unwrap();
            Arc::clone(&sessions.get("abc-123").unwrap().session)
        };
        let queued = session.queue_snapshot();
        assert_eq!(queued.len(), 1);
    }

    #[test]
    fn shutdown_disposes_everything() {
        let (registry, host) = registry_with_host();
        insert_offline(&registry, "a");
        insert_offline(&registry, "b");
        registry.shutdown();
        assert_eq!(registry.session_count(), 0);
        assert_eq!(host.ended.lock().unwrap().len(), 2);
    }
}
