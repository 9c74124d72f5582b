//! Reply envelope parsing.

use std::io::BufReader;

use xmltree::Element;

use crate::errors::UpnpError;

/// A parsed SOAP envelope. Only the body matters to a control point;
/// renderers never send us meaningful headers.
#[derive(Debug, Clone)]
pub struct SoapEnvelope {
    pub body: SoapBody,
}

#[derive(Debug, Clone)]
pub struct SoapBody {
    pub content: Element,
}

/// Parse a SOAP envelope from raw bytes.
///
/// Renderers disagree on namespace prefixes (`s:`, `SOAP-ENV:`, none at
/// all), so elements are matched by local-name suffix throughout.
pub fn parse_envelope(xml: &[u8]) -> Result<SoapEnvelope, UpnpError> {
    let reader = BufReader::new(xml);
    let root = Element::parse(reader)?;

    if !root.name.ends_with("Envelope") {
        return Err(UpnpError::MissingEnvelope);
    }

    let body = root
        .children
        .iter()
        .find_map(|n| n.as_element().filter(|e| e.name.ends_with("Body")))
        .ok_or(UpnpError::MissingBody)?;

    Ok(SoapEnvelope {
        body: SoapBody {
            content: body.clone(),
        },
    })
}

impl SoapEnvelope {
    /// Find the `<ActionResponse>` element for `action`, if present.
    pub fn action_response(&self, action: &str) -> Option<&Element> {
        let wanted = format!("{action}Response");
        self.body.content.children.iter().find_map(|n| {
            n.as_element().filter(|e| e.name.ends_with(wanted.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_envelope() {
        let xml = br#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <u:PlayResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"/>
  </s:Body>
</s:Envelope>"#;
        let envelope = parse_envelope(xml).unwrap();
        assert!(envelope.action_response("Play").is_some());
        assert!(envelope.action_response("Pause").is_none());
    }

    #[test]
    fn rejects_non_envelope_root() {
        let xml = br#"<html><body>not soap</body></html>"#;
        assert!(matches!(
            parse_envelope(xml),
            Err(UpnpError::MissingEnvelope)
        ));
    }

    #[test]
    fn rejects_missing_body() {
        let xml = br#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"/>"#;
        assert!(matches!(parse_envelope(xml), Err(UpnpError::MissingBody)));
    }
}
