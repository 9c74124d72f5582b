//! Discovery event payloads.
//!
//! SSDP itself runs in the host application; we only consume the parsed
//! NOTIFY/M-SEARCH-response data it hands over.

use std::collections::HashMap;
use std::net::IpAddr;

pub const MEDIA_RENDERER_URN: &str = "urn:schemas-upnp-org:device:MediaRenderer:";

/// A device sighting (alive or byebye) as delivered by the discovery layer.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Description URL from the LOCATION header.
    pub location: String,
    /// Address the announcement came from.
    pub endpoint: Option<IpAddr>,
    /// Unique Service Name, e.g. `uuid:abcd::urn:...:MediaRenderer:1`.
    pub usn: String,
    /// Notification type (NT) or search target (ST).
    pub nt: Option<String>,
    /// Remaining headers, uppercased names.
    pub headers: HashMap<String, String>,
}

impl DiscoveredDevice {
    /// True when either USN or NT names a MediaRenderer device type.
    pub fn mentions_media_renderer(&self) -> bool {
        let in_usn = self.usn.contains(MEDIA_RENDERER_URN);
        let in_nt = self
            .nt
            .as_deref()
            .is_some_and(|nt| nt.contains(MEDIA_RENDERER_URN));
        in_usn || in_nt
    }

    /// The device UUID embedded in the USN, lowercased, without prefix.
    pub fn uuid(&self) -> Option<String> {
        uuid_from_usn(&self.usn)
    }
}

/// Extract the `uuid:` component of a USN.
///
/// USNs look like `uuid:1234::urn:schemas-upnp-org:device:MediaRenderer:1`
/// or just `uuid:1234`.
pub fn uuid_from_usn(usn: &str) -> Option<String> {
    let rest = usn.trim().strip_prefix("uuid:")?;
    let uuid = rest.split("::").next().unwrap_or(rest).trim();
    if uuid.is_empty() {
        None
    } else {
        Some(uuid.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(usn: &str, nt: Option<&str>) -> DiscoveredDevice {
        DiscoveredDevice {
            location: "http://10.0.0.9:49152/description.xml".to_string(),
            endpoint: None,
            usn: usn.to_string(),
            nt: nt.map(str::to_string),
            headers: HashMap::new(),
        }
    }

    #[test]
    fn uuid_extraction() {
        assert_eq!(
            uuid_from_usn("uuid:ABCD-123::urn:schemas-upnp-org:device:MediaRenderer:1"),
            Some("abcd-123".to_string())
        );
        assert_eq!(uuid_from_usn("uuid:abcd-123"), Some("abcd-123".to_string()));
        assert_eq!(uuid_from_usn("urn:no-uuid-here"), None);
        assert_eq!(uuid_from_usn("uuid:"), None);
    }

    #[test]
    fn renderer_detection_checks_both_fields() {
        assert!(device(
            "uuid:x::urn:schemas-upnp-org:device:MediaRenderer:1",
            None
        )
        .mentions_media_renderer());
        assert!(device(
            "uuid:x",
            Some("urn:schemas-upnp-org:device:MediaRenderer:1")
        )
        .mentions_media_renderer());
        assert!(!device("uuid:x", Some("upnp:rootdevice")).mentions_media_renderer());
    }
}
