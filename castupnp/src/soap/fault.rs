//! SOAP fault extraction.

use xmltree::Element;

use super::SoapEnvelope;

/// A fault reported by a renderer: the SOAP `faultstring` plus the UPnP
/// error detail when the device includes one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFaultInfo {
    pub fault_string: String,
    pub error_code: u32,
    pub error_description: String,
}

/// Extract a fault from a reply envelope, if the body carries one.
pub fn parse_fault(envelope: &SoapEnvelope) -> Option<SoapFaultInfo> {
    let fault = find_child_with_suffix(&envelope.body.content, "Fault")?;

    let fault_string = find_child_with_suffix(fault, "faultstring")
        .and_then(element_text)
        .unwrap_or_default();

    let (error_code, error_description) = match find_child_with_suffix(fault, "detail")
        .and_then(|d| find_child_with_suffix(d, "UPnPError"))
    {
        Some(upnp_error) => {
            let code = find_child_with_suffix(upnp_error, "errorCode")
                .and_then(element_text)
                .and_then(|t| t.parse::<u32>().ok())
                .unwrap_or(501);
            let desc = find_child_with_suffix(upnp_error, "errorDescription")
                .and_then(element_text)
                .unwrap_or_default();
            (code, desc)
        }
        None => (501, String::new()),
    };

    Some(SoapFaultInfo {
        fault_string,
        error_code,
        error_description,
    })
}

fn find_child_with_suffix<'a>(parent: &'a Element, suffix: &str) -> Option<&'a Element> {
    parent
        .children
        .iter()
        .find_map(|node| node.as_element().filter(|e| e.name.ends_with(suffix)))
}

fn element_text(elem: &Element) -> Option<String> {
    elem.get_text()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soap::parse_envelope;

    #[test]
    fn extracts_upnp_error_detail() {
        let xml = br#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>
        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
          <errorCode>718</errorCode>
          <errorDescription>Invalid InstanceID</errorDescription>
        </UPnPError>
      </detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#;
        let envelope = parse_envelope(xml).unwrap();
        let fault = parse_fault(&envelope).unwrap();
        assert_eq!(fault.fault_string, "UPnPError");
        assert_eq!(fault.error_code, 718);
        assert_eq!(fault.error_description, "Invalid InstanceID");
    }

    #[test]
    fn fault_without_detail_defaults_to_action_failed() {
        let xml = br#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Server</faultcode>
      <faultstring>Internal Error</faultstring>
    </s:Fault>
  </s:Body>
</s:Envelope>"#;
        let envelope = parse_envelope(xml).unwrap();
        let fault = parse_fault(&envelope).unwrap();
        assert_eq!(fault.fault_string, "Internal Error");
        assert_eq!(fault.error_code, 501);
    }

    #[test]
    fn success_reply_has_no_fault() {
        let xml = br#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body><u:StopResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1"/></s:Body>
</s:Envelope>"#;
        let envelope = parse_envelope(xml).unwrap();
        assert!(parse_fault(&envelope).is_none());
    }
}
