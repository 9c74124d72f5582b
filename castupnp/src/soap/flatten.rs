//! Flattening of action replies into a key/value map.
//!
//! The session engine does not care about reply structure, only about
//! named values. A reply element tree is flattened with these rules:
//!
//! - text content of a direct child of the response → keyed by its local
//!   name (`TrackDuration`),
//! - text content of a deeper element → keyed by both its local name and
//!   `parent.local` (`res` and `item.res`),
//! - attributes → keyed `local.attr` (`item.id`, `DIDL-Lite.xmlns`),
//! - a text value that is itself an escaped DIDL-Lite document (renderers
//!   ship track metadata that way) is parsed and merged into the same map,
//! - duplicate keys: the last value wins.

use std::collections::HashMap;
use std::io::BufReader;

use xmltree::Element;

/// Flatten `root`'s content into a key/value map.
pub fn flatten_response(root: &Element) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for child in root.children.iter().filter_map(|n| n.as_element()) {
        flatten_into(child, None, &mut out);
    }
    out
}

fn flatten_into(elem: &Element, parent: Option<&str>, out: &mut HashMap<String, String>) {
    let local = local_name(&elem.name);
    let key = match parent {
        Some(p) => format!("{p}.{local}"),
        None => local.to_string(),
    };

    for (attr, value) in &elem.attributes {
        out.insert(format!("{local}.{}", local_name(attr)), value.clone());
    }

    if let Some(text) = elem.get_text() {
        let text = text.trim().to_string();
        if !text.is_empty() {
            if text.starts_with("<DIDL-Lite") {
                // xmltree has already unescaped the entity-encoded metadata.
                if let Ok(didl) = Element::parse(BufReader::new(text.as_bytes())) {
                    flatten_into(&didl, None, out);
                }
            }
            if parent.is_some() {
                out.insert(local.to_string(), text.clone());
            }
            out.insert(key, text);
        }
    }

    for child in elem.children.iter().filter_map(|n| n.as_element()) {
        flatten_into(child, Some(local), out);
    }
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soap::parse_envelope;

    #[test]
    fn flattens_position_info_reply() {
        let xml = br#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:GetPositionInfoResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
      <Track>1</Track>
      <TrackDuration>00:03:45</TrackDuration>
      <RelTime>00:01:02</RelTime>
    </u:GetPositionInfoResponse>
  </s:Body>
</s:Envelope>"#;
        let envelope = parse_envelope(xml).unwrap();
        let response = envelope.action_response("GetPositionInfo").unwrap();
        let map = flatten_response(response);
        assert_eq!(map.get("Track").map(String::as_str), Some("1"));
        assert_eq!(map.get("TrackDuration").map(String::as_str), Some("00:03:45"));
        assert_eq!(map.get("RelTime").map(String::as_str), Some("00:01:02"));
    }

    #[test]
    fn embedded_didl_metadata_is_merged() {
        let xml = br#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:GetPositionInfoResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
      <TrackMetaData>&lt;DIDL-Lite xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/"&gt;&lt;item id="11" parentID="1" restricted="1"&gt;&lt;res protocolInfo="http-get:*:audio/mpeg:*"&gt;http://server/Audio/11/stream.mp3&lt;/res&gt;&lt;/item&gt;&lt;/DIDL-Lite&gt;</TrackMetaData>
      <TrackURI>http://server/Audio/11/stream.mp3</TrackURI>
    </u:GetPositionInfoResponse>
  </s:Body>
</s:Envelope>"#;
        let envelope = parse_envelope(xml).unwrap();
        let response = envelope.action_response("GetPositionInfo").unwrap();
        let map = flatten_response(response);
        assert_eq!(map.get("item.id").map(String::as_str), Some("11"));
        assert_eq!(
            map.get("item.res").map(String::as_str),
            Some("http://server/Audio/11/stream.mp3")
        );
        assert_eq!(
            map.get("res").map(String::as_str),
            Some("http://server/Audio/11/stream.mp3")
        );
        assert_eq!(
            map.get("DIDL-Lite.xmlns").map(String::as_str),
            Some("urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/")
        );
        assert!(map.contains_key("TrackMetaData"));
    }

    #[test]
    fn duplicate_keys_keep_the_last_value() {
        let xml = br#"<root><a>first</a><a>second</a></root>"#;
        let root = Element::parse(BufReader::new(&xml[..])).unwrap();
        let map = flatten_response(&root);
        assert_eq!(map.get("a").map(String::as_str), Some("second"));
    }

    #[test]
    fn attributes_use_dotted_keys() {
        let xml = br#"<root><item id="42" restricted="1"/></root>"#;
        let root = Element::parse(BufReader::new(&xml[..])).unwrap();
        let map = flatten_response(&root);
        assert_eq!(map.get("item.id").map(String::as_str), Some("42"));
        assert_eq!(map.get("item.restricted").map(String::as_str), Some("1"));
    }
}
