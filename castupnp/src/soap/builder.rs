//! Action request envelope construction.

use xmltree::{Element, EmitterConfig, XMLNode};

/// Build the SOAP 1.1 request envelope for a UPnP action.
///
/// The action element is emitted as `<m:Action xmlns:m="SERVICE_TYPE">`
/// with the prepared argument elements as children, in schema order:
///
/// ```text
/// <s:Envelope><s:Body><m:Play xmlns:m="urn:...:AVTransport:1">
///   <InstanceID>0</InstanceID><Speed>1</Speed>
/// </m:Play></s:Body></s:Envelope>
/// ```
pub fn build_action_request(
    service_type: &str,
    action: &str,
    args: Vec<Element>,
) -> Result<String, xmltree::Error> {
    let mut action_elem = Element::new(&format!("m:{action}"));
    action_elem
        .attributes
        .insert("xmlns:m".to_string(), service_type.to_string());
    for arg in args {
        action_elem.children.push(XMLNode::Element(arg));
    }

    let mut body = Element::new("s:Body");
    body.children.push(XMLNode::Element(action_elem));

    let mut envelope = Element::new("s:Envelope");
    envelope.attributes.insert(
        "xmlns:s".to_string(),
        "http://schemas.xmlsoap.org/soap/envelope/".to_string(),
    );
    envelope.attributes.insert(
        "s:encodingStyle".to_string(),
        "http://schemas.xmlsoap.org/soap/encoding/".to_string(),
    );
    envelope.children.push(XMLNode::Element(body));

    let mut buf = Vec::new();
    let config = EmitterConfig::new().write_document_declaration(true);
    envelope.write_with_config(&mut buf, config)?;

    Ok(String::from_utf8(buf).expect("xmltree emits valid UTF-8"))
}

/// A plain `<Name>value</Name>` argument element.
pub(crate) fn text_element(name: &str, value: &str) -> Element {
    let mut elem = Element::new(name);
    if !value.is_empty() {
        elem.children.push(XMLNode::Text(value.to_string()));
    }
    elem
}
