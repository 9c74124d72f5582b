//! Device description documents.
//!
//! The description.xml served at a device's LOCATION names the device and
//! lists its services. A MediaRenderer exposes exactly the three services
//! we care about; anything else in the list is ignored.

use std::io::BufRead;

use quick_xml::{events::Event, Reader};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("Missing required device element: {0}")]
    MissingField(&'static str),
    #[error("Not a MediaRenderer device: {0}")]
    NotARenderer(String),
}

/// The three MediaRenderer services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    ConnectionManager,
    RenderingControl,
    AVTransport,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [
        ServiceKind::ConnectionManager,
        ServiceKind::RenderingControl,
        ServiceKind::AVTransport,
    ];

    /// Match a serviceType URN, any version.
    fn matches_urn(self, urn: &str) -> bool {
        let lower = urn.to_ascii_lowercase();
        match self {
            ServiceKind::ConnectionManager => {
                lower.contains("urn:schemas-upnp-org:service:connectionmanager:")
            }
            ServiceKind::RenderingControl => {
                lower.contains("urn:schemas-upnp-org:service:renderingcontrol:")
            }
            ServiceKind::AVTransport => {
                lower.contains("urn:schemas-upnp-org:service:avtransport:")
            }
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ServiceKind::ConnectionManager => "ConnectionManager",
            ServiceKind::RenderingControl => "RenderingControl",
            ServiceKind::AVTransport => "AVTransport",
        }
    }
}

/// One service endpoint, URLs resolved absolute against the description
/// location.
#[derive(Debug, Clone)]
pub struct DeviceService {
    pub service_type: String,
    pub scpd_url: String,
    pub control_url: String,
    pub event_sub_url: String,
}

/// Parsed device description. Immutable once built; a refresh replaces the
/// whole value.
#[derive(Debug, Clone)]
pub struct DeviceDescription {
    pub udn: String,
    pub device_type: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub manufacturer_url: String,
    pub model_name: String,
    pub model_number: String,
    pub model_description: String,
    pub model_url: String,
    pub serial_number: String,
    /// The description.xml URL this document was fetched from.
    pub location: String,
    connection_manager: Option<DeviceService>,
    rendering_control: Option<DeviceService>,
    avtransport: Option<DeviceService>,
}

impl DeviceDescription {
    pub fn service(&self, kind: ServiceKind) -> Option<&DeviceService> {
        match kind {
            ServiceKind::ConnectionManager => self.connection_manager.as_ref(),
            ServiceKind::RenderingControl => self.rendering_control.as_ref(),
            ServiceKind::AVTransport => self.avtransport.as_ref(),
        }
    }

    pub fn is_media_renderer(&self) -> bool {
        self.device_type
            .starts_with("urn:schemas-upnp-org:device:MediaRenderer:")
    }

    /// The device UUID, without the `uuid:` prefix.
    pub fn uuid(&self) -> &str {
        self.udn.strip_prefix("uuid:").unwrap_or(&self.udn)
    }
}

#[derive(Default)]
struct ServiceDraft {
    service_type: Option<String>,
    scpd_url: Option<String>,
    control_url: Option<String>,
    event_sub_url: Option<String>,
}

/// Fetch-free parser: the caller supplies the document body and the URL it
/// came from (needed to absolutize relative service URLs).
pub fn parse_description<R: BufRead>(
    input: R,
    location: &str,
) -> Result<DeviceDescription, DescriptionError> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();

    let mut udn = String::new();
    let mut device_type: Option<String> = None;
    let mut friendly_name: Option<String> = None;
    let mut manufacturer = String::new();
    let mut manufacturer_url = String::new();
    let mut model_name = String::new();
    let mut model_number = String::new();
    let mut model_description = String::new();
    let mut model_url = String::new();
    let mut serial_number = String::new();

    let mut connection_manager: Option<DeviceService> = None;
    let mut rendering_control: Option<DeviceService> = None;
    let mut avtransport: Option<DeviceService> = None;

    let mut in_device = false;
    let mut in_service = false;
    let mut current_tag: Option<String> = None;
    let mut draft = ServiceDraft::default();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.as_str() {
                    "device" => {
                        in_device = true;
                        current_tag = None;
                    }
                    "service" if in_device => {
                        in_service = true;
                        current_tag = None;
                        draft = ServiceDraft::default();
                    }
                    _ => {
                        if in_device {
                            current_tag = Some(name);
                        }
                    }
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.as_str() {
                    "device" => in_device = false,
                    "service" if in_service => {
                        in_service = false;
                        if let Some(service) = finish_service(&draft, location) {
                            for kind in ServiceKind::ALL {
                                if kind.matches_urn(&service.service_type) {
                                    let slot = match kind {
                                        ServiceKind::ConnectionManager => &mut connection_manager,
                                        ServiceKind::RenderingControl => &mut rendering_control,
                                        ServiceKind::AVTransport => &mut avtransport,
                                    };
                                    // Keep the first occurrence.
                                    if slot.is_none() {
                                        debug!(
                                            kind = kind.label(),
                                            service_type = service.service_type.as_str(),
                                            control_url = service.control_url.as_str(),
                                            "found service"
                                        );
                                        *slot = Some(service.clone());
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
                current_tag = None;
            }
            Event::Text(e) => {
                if !in_device {
                    buf.clear();
                    continue;
                }
                let Some(tag) = &current_tag else {
                    buf.clear();
                    continue;
                };
                let text = e.unescape()?.into_owned();

                if in_service {
                    match tag.as_str() {
                        "serviceType" => draft.service_type = Some(text),
                        "SCPDURL" => draft.scpd_url = Some(text),
                        "controlURL" => draft.control_url = Some(text),
                        "eventSubURL" => draft.event_sub_url = Some(text),
                        _ => {}
                    }
                } else {
                    match tag.as_str() {
                        "UDN" => udn = text,
                        "deviceType" => device_type = Some(text),
                        "friendlyName" => friendly_name = Some(text),
                        "manufacturer" => manufacturer = text,
                        "manufacturerURL" => manufacturer_url = text,
                        "modelName" => model_name = text,
                        "modelNumber" => model_number = text,
                        "modelDescription" => model_description = text,
                        "modelURL" => model_url = text,
                        "serialNumber" => serial_number = text,
                        _ => {}
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let device_type = device_type.ok_or(DescriptionError::MissingField("deviceType"))?;
    let friendly_name = friendly_name.ok_or(DescriptionError::MissingField("friendlyName"))?;
    if udn.is_empty() {
        return Err(DescriptionError::MissingField("UDN"));
    }

    Ok(DeviceDescription {
        udn,
        device_type,
        friendly_name,
        manufacturer,
        manufacturer_url,
        model_name,
        model_number,
        model_description,
        model_url,
        serial_number,
        location: location.to_string(),
        connection_manager,
        rendering_control,
        avtransport,
    })
}

fn finish_service(draft: &ServiceDraft, location: &str) -> Option<DeviceService> {
    let service_type = draft.service_type.clone()?;
    let control_url = draft.control_url.clone()?;
    let resolve_optional = |url: Option<&str>| match url {
        Some(u) if !u.is_empty() => resolve_url(location, u),
        _ => String::new(),
    };
    Some(DeviceService {
        service_type,
        scpd_url: resolve_optional(draft.scpd_url.as_deref()),
        control_url: resolve_url(location, &control_url),
        event_sub_url: resolve_optional(draft.event_sub_url.as_deref()),
    })
}

/// Resolve a possibly relative service URL against the description URL.
///
/// - Already absolute (http:// or https://): returned as-is.
/// - Otherwise resolved against the scheme://host:port of `description_url`.
pub fn resolve_url(description_url: &str, service_url: &str) -> String {
    if service_url.starts_with("http://") || service_url.starts_with("https://") {
        return service_url.to_string();
    }

    if let Some((scheme, rest)) = description_url.split_once("://") {
        let authority = match rest.find('/') {
            Some(pos) => &rest[..pos],
            None => rest,
        };
        let base = format!("{scheme}://{authority}");

        if service_url.starts_with('/') {
            return format!("{base}{service_url}");
        }
        return format!("{base}/{service_url}");
    }

    service_url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Living Room TV</friendlyName>
    <manufacturer>Samsung Electronics</manufacturer>
    <manufacturerURL>http://www.samsung.com</manufacturerURL>
    <modelName>UE40ES8000</modelName>
    <modelNumber>1.0</modelNumber>
    <serialNumber>0815</serialNumber>
    <UDN>uuid:01234567-89ab-cdef-0123-456789abcdef</UDN>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:RenderingControl</serviceId>
        <SCPDURL>/rcr.xml</SCPDURL>
        <controlURL>/upnp/control/RenderingControl1</controlURL>
        <eventSubURL>/upnp/event/RenderingControl1</eventSubURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:ConnectionManager:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:ConnectionManager</serviceId>
        <SCPDURL>/cm.xml</SCPDURL>
        <controlURL>/upnp/control/ConnectionManager1</controlURL>
        <eventSubURL>/upnp/event/ConnectionManager1</eventSubURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <SCPDURL>http://10.0.0.2:7676/avt.xml</SCPDURL>
        <controlURL>/upnp/control/AVTransport1</controlURL>
        <eventSubURL>/upnp/event/AVTransport1</eventSubURL>
      </service>
      <service>
        <serviceType>urn:samsung.com:service:MainTVAgent2:1</serviceType>
        <SCPDURL>/tv.xml</SCPDURL>
        <controlURL>/tv/control</controlURL>
        <eventSubURL>/tv/event</eventSubURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    #[test]
    fn parses_renderer_description() {
        let desc =
            parse_description(DESCRIPTION.as_bytes(), "http://10.0.0.2:7676/smp_2_").unwrap();
        assert!(desc.is_media_renderer());
        assert_eq!(desc.friendly_name, "Living Room TV");
        assert_eq!(desc.manufacturer, "Samsung Electronics");
        assert_eq!(desc.uuid(), "01234567-89ab-cdef-0123-456789abcdef");

        let avt = desc.service(ServiceKind::AVTransport).unwrap();
        assert_eq!(
            avt.control_url,
            "http://10.0.0.2:7676/upnp/control/AVTransport1"
        );
        // Absolute SCPD URLs pass through untouched.
        assert_eq!(avt.scpd_url, "http://10.0.0.2:7676/avt.xml");

        let rc = desc.service(ServiceKind::RenderingControl).unwrap();
        assert_eq!(rc.event_sub_url, "http://10.0.0.2:7676/upnp/event/RenderingControl1");
    }

    #[test]
    fn vendor_services_are_ignored() {
        let desc =
            parse_description(DESCRIPTION.as_bytes(), "http://10.0.0.2:7676/smp_2_").unwrap();
        for kind in ServiceKind::ALL {
            assert!(desc.service(kind).is_some());
        }
    }

    #[test]
    fn missing_friendly_name_is_an_error() {
        let xml = r#"<root><device>
            <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
            <UDN>uuid:x</UDN>
        </device></root>"#;
        assert!(matches!(
            parse_description(xml.as_bytes(), "http://host/d.xml"),
            Err(DescriptionError::MissingField("friendlyName"))
        ));
    }

    #[test]
    fn resolve_url_variants() {
        assert_eq!(
            resolve_url("http://10.0.0.2:7676/desc.xml", "/control"),
            "http://10.0.0.2:7676/control"
        );
        assert_eq!(
            resolve_url("http://10.0.0.2:7676/desc.xml", "control"),
            "http://10.0.0.2:7676/control"
        );
        assert_eq!(
            resolve_url("http://10.0.0.2:7676/desc.xml", "http://other/x"),
            "http://other/x"
        );
    }
}
