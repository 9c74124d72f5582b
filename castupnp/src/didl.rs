//! The little DIDL-Lite a control point needs.
//!
//! Rich metadata documents come from the media server; this module only
//! provides the minimal fallback document some renderers insist on
//! receiving with `SetAVTransportURI`, plus the escaping helpers.

use quick_xml::escape::escape;

pub const DIDL_NAMESPACE: &str = "urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/";

/// Fields for the minimal metadata document.
#[derive(Debug, Clone, Default)]
pub struct MinimalItem<'a> {
    pub id: &'a str,
    pub title: &'a str,
    /// upnp:class, e.g. `object.item.audioItem.musicTrack`.
    pub upnp_class: &'a str,
    pub protocol_info: &'a str,
    pub url: &'a str,
}

/// Build a minimal single-item DIDL-Lite document.
///
/// Kept deliberately small: renderers that reject an empty
/// CurrentURIMetaData accept this form, and renderers that parse metadata
/// get a well-formed document with the resource URL.
pub fn build_minimal_metadata(item: &MinimalItem<'_>) -> String {
    let id = if item.id.is_empty() { "0" } else { item.id };
    format!(
        concat!(
            r#"<DIDL-Lite xmlns="{ns}" xmlns:dc="http://purl.org/dc/elements/1.1/" "#,
            r#"xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/">"#,
            r#"<item id="{id}" parentID="-1" restricted="1">"#,
            "<dc:title>{title}</dc:title>",
            "<upnp:class>{class}</upnp:class>",
            r#"<res protocolInfo="{protocol}">{url}</res>"#,
            "</item></DIDL-Lite>"
        ),
        ns = DIDL_NAMESPACE,
        id = escape(id),
        title = escape(item.title),
        class = escape(item.upnp_class),
        protocol = escape(item.protocol_info),
        url = escape(item.url),
    )
}

/// upnp:class value for a media kind label.
pub fn upnp_class_for(kind_label: &str) -> &'static str {
    match kind_label {
        "Audio" => "object.item.audioItem.musicTrack",
        "Photo" => "object.item.imageItem.photo",
        _ => "object.item.videoItem",
    }
}
