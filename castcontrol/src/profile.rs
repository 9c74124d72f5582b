//! Device profiles and their matching rules.
//!
//! A profile tells the stream builder what a renderer family can play and
//! carries the handful of quirks the session engine needs (metadata
//! escaping, supported media types). Matching is by headers from the
//! device description: every non-empty pattern of a profile must match
//! the corresponding device field, regex first, plain substring as the
//! fallback; empty device fields never match.

use std::sync::{Arc, Mutex};

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::MediaKind;

/// Identification patterns of a profile, matched against the device
/// description fields of the same names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileIdentification {
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub manufacturer_url: Option<String>,
    pub model_description: Option<String>,
    pub model_name: Option<String>,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub serial_number: Option<String>,
}

/// The device-description fields a profile is matched against.
#[derive(Debug, Clone, Default)]
pub struct DeviceFields {
    pub friendly_name: String,
    pub manufacturer: String,
    pub manufacturer_url: String,
    pub model_description: String,
    pub model_name: String,
    pub model_number: String,
    pub model_url: String,
    pub serial_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub identification: ProfileIdentification,
    pub supported_media_types: Vec<MediaKind>,
    /// Some renderers require the DIDL document XML-escaped a second time
    /// inside CurrentURIMetaData.
    #[serde(default)]
    pub requires_escaped_metadata: bool,
}

impl DeviceProfile {
    /// The catch-all profile used when nothing matches.
    pub fn generic() -> Self {
        DeviceProfile {
            id: "generic".to_string(),
            name: "Generic Device".to_string(),
            identification: ProfileIdentification::default(),
            supported_media_types: vec![MediaKind::Audio, MediaKind::Video, MediaKind::Photo],
            requires_escaped_metadata: false,
        }
    }

    pub fn supports(&self, kind: MediaKind) -> bool {
        self.supported_media_types.contains(&kind)
    }

    /// All non-empty patterns must match; a profile with no patterns
    /// matches nothing (it can only be assigned explicitly).
    pub fn matches(&self, device: &DeviceFields) -> bool {
        let ident = &self.identification;
        let pairs: [(&Option<String>, &str); 8] = [
            (&ident.friendly_name, &device.friendly_name),
            (&ident.manufacturer, &device.manufacturer),
            (&ident.manufacturer_url, &device.manufacturer_url),
            (&ident.model_description, &device.model_description),
            (&ident.model_name, &device.model_name),
            (&ident.model_number, &device.model_number),
            (&ident.model_url, &device.model_url),
            (&ident.serial_number, &device.serial_number),
        ];

        let mut any_pattern = false;
        for (pattern, value) in pairs {
            let Some(pattern) = pattern.as_deref().filter(|p| !p.is_empty()) else {
                continue;
            };
            any_pattern = true;
            if !field_matches(pattern, value) {
                return false;
            }
        }
        any_pattern
    }
}

/// Case-insensitive regex-or-substring match. Empty input never matches.
fn field_matches(pattern: &str, value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => re.is_match(value),
        // Patterns that are not valid regexes fall back to substring.
        Err(_) => value.to_lowercase().contains(&pattern.to_lowercase()),
    }
}

/// Profile store contract (§ backing storage lives in the host).
pub trait ProfileRepository: Send + Sync {
    /// Resolve a profile for a device. `auto_create` asks the store to
    /// persist a new profile seeded from `protocol_info` when nothing
    /// matches; stores without persistence just return the generic one.
    fn profile_for(
        &self,
        device: &DeviceFields,
        protocol_info: &str,
        auto_create: bool,
    ) -> Arc<DeviceProfile>;

    fn delete_profile(&self, id: &str);
}

/// In-memory repository: a fixed profile list plus the generic fallback.
pub struct MemoryProfileRepository {
    profiles: Mutex<Vec<Arc<DeviceProfile>>>,
}

impl MemoryProfileRepository {
    pub fn new(profiles: Vec<DeviceProfile>) -> Self {
        Self {
            profiles: Mutex::new(profiles.into_iter().map(Arc::new).collect()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl ProfileRepository for MemoryProfileRepository {
    fn profile_for(
        &self,
        device: &DeviceFields,
        _protocol_info: &str,
        _auto_create: bool,
    ) -> Arc<DeviceProfile> {
        let profiles = self.profiles.lock().unwrap();
        for profile in profiles.iter() {
            if profile.matches(device) {
                debug!(
                    profile = profile.name.as_str(),
                    device = device.friendly_name.as_str(),
                    "matched device profile"
                );
                return Arc::clone(profile);
            }
        }
        Arc::new(DeviceProfile::generic())
    }

    fn delete_profile(&self, id: &str) {
        self.profiles.lock().unwrap().retain(|p| p.id != id);
    }
}
