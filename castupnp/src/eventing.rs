//! GENA event notification bodies.
//!
//! A NOTIFY body is an `e:propertyset` whose properties usually contain a
//! single `LastChange` value: an entity-escaped XML document of the form
//!
//! ```text
//! <Event xmlns="...AVT/RCS..."><InstanceID val="0">
//!   <TransportState val="PLAYING"/>
//!   <Volume channel="Master" val="31"/>
//! </InstanceID></Event>
//! ```
//!
//! [`parse_event_properties`] reduces all of that to a flat map with
//! `Name.val` keys, which is exactly the shape the session reconciler
//! consumes. Properties outside `LastChange` (some renderers event plain
//! state variables) are merged under their own names.

use std::collections::HashMap;
use std::io::BufReader;

use xmltree::Element;

use crate::errors::UpnpError;

/// Parse a NOTIFY body into a flat key/value map.
pub fn parse_event_properties(body: &str) -> Result<HashMap<String, String>, UpnpError> {
    let root = Element::parse(BufReader::new(body.as_bytes()))?;

    let mut out = HashMap::new();
    collect_properties(&root, &mut out);
    Ok(out)
}

fn collect_properties(elem: &Element, out: &mut HashMap<String, String>) {
    for child in elem.children.iter().filter_map(|n| n.as_element()) {
        if child.name.ends_with("LastChange") {
            if let Some(text) = child.get_text() {
                let text = text.trim();
                if !text.is_empty() {
                    merge_last_change(text, out);
                }
            }
        } else if child.name.ends_with("property") || child.name.ends_with("propertyset") {
            collect_properties(child, out);
        } else if let Some(text) = child.get_text() {
            let text = text.trim().to_string();
            if !text.is_empty() {
                out.insert(local_name(&child.name).to_string(), text);
            }
        }
    }
}

/// Parse the inner (already unescaped) LastChange document and merge its
/// state-variable updates as `Name.val` keys.
fn merge_last_change(inner: &str, out: &mut HashMap<String, String>) {
    let Ok(event) = Element::parse(BufReader::new(inner.as_bytes())) else {
        // A renderer that ships broken inner XML still gets its other
        // properties applied.
        return;
    };

    for instance in event.children.iter().filter_map(|n| n.as_element()) {
        if !instance.name.ends_with("InstanceID") {
            continue;
        }
        for var in instance.children.iter().filter_map(|n| n.as_element()) {
            // Multi-channel variables: only Master is ours.
            if let Some(channel) = var.attributes.get("channel") {
                if channel != "Master" {
                    continue;
                }
            }
            let local = local_name(&var.name);
            for (attr, value) in &var.attributes {
                if attr == "channel" {
                    continue;
                }
                out.insert(format!("{local}.{attr}"), value.clone());
            }
            // Some firmwares put the value in text rather than in @val.
            if let Some(text) = var.get_text() {
                let text = text.trim().to_string();
                if !text.is_empty() && !var.attributes.contains_key("val") {
                    out.insert(format!("{local}.val"), text);
                }
            }
        }
    }
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}
