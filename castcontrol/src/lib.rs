//! # castcontrol: the CastBridge session engine
//!
//! Turns a discovered DLNA/UPnP MediaRenderer into a remotely
//! controllable playback session of a media server:
//!
//! - a [`registry::SessionRegistry`] opens one [`device::RendererSession`]
//!   plus one [`controller::PlaylistController`] per renderer,
//! - the session serializes all outbound SOAP through a deduplicating
//!   command queue, polls the device, subscribes to its event stream and
//!   reconciles pushed state against its cache,
//! - the controller owns the playlist and cursor, pipelines the next
//!   track, restarts streams for seeks and stream-index changes, and
//!   times photo slideshows,
//! - [`ingress::eventing_router`] receives the renderer's NOTIFYs.
//!
//! The host application supplies sessions, library lookups and stream
//! building through the traits in [`host`]; device quirks come from
//! [`profile`].

pub mod controller;
pub mod device;
pub mod errors;
pub mod host;
pub mod ingress;
pub mod model;
pub mod profile;
pub mod registry;
pub mod soap_client;
pub mod stream;
pub mod time_utils;

pub use controller::{ControllerTuning, PlaylistController, PlaylistItem};
pub use device::{RendererSession, SessionCallbacks, SessionCommand, SessionTuning, VolumeRange};
pub use errors::ControlError;
pub use host::{
    BasicDidlBuilder, DidlBuilder, GeneralCommand, HostServices, MediaItem, MediaResolver,
    PlayCommand, PlayRequest, PlaystateCommand, PlaystateRequest, SessionHost, StreamBuilder,
    StreamRequest, StreamSource,
};
pub use model::{
    CurrentMedia, MediaData, MediaKind, NotificationKind, PlaybackReport, SessionCapabilities,
    TransportState,
};
pub use profile::{DeviceFields, DeviceProfile, MemoryProfileRepository, ProfileRepository};
pub use registry::{SessionMessage, SessionRegistry};
