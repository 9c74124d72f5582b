//! HTTP layer: SOAP action invocation, description fetches and GENA
//! subscription management.
//!
//! One renderer only ever sees one request at a time (the command queue
//! serializes them), so a per-call agent with a global timeout is all the
//! connection management we need.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};
use ureq::Agent;

use castupnp::soap::{flatten_response, parse_envelope, parse_fault};

use crate::errors::ControlError;

/// Identity headers sent with every request to a device.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub user_agent: String,
    pub friendly_name: String,
}

/// A successful action reply.
#[derive(Debug)]
pub struct SoapReply {
    /// Flattened response values.
    pub values: HashMap<String, String>,
    /// Wall-clock duration of the HTTP exchange.
    pub round_trip: Duration,
}

fn agent_with_timeout(timeout: Duration) -> Agent {
    Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build()
        .into()
}

/// Invoke a UPnP SOAP action.
///
/// - `control_url`: the service control endpoint
/// - `service_type`: service URN
/// - `body`: the prepared request envelope
/// - `content_features`: value for `contentFeatures.dlna.org`, sent
///   together with `transferMode.dlna.org: Streaming`
pub fn invoke_upnp_action(
    control_url: &str,
    service_type: &str,
    action: &str,
    body: &str,
    content_features: Option<&str>,
    timeout: Duration,
    identity: &ClientIdentity,
) -> Result<SoapReply, ControlError> {
    debug!(
        url = control_url,
        action,
        service_type,
        body_len = body.len(),
        "sending SOAP request"
    );
    trace!(body, "SOAP request body");

    let agent = agent_with_timeout(timeout);
    let soap_action = format!(r#""{service_type}#{action}""#);

    let started = Instant::now();
    let mut request = agent
        .post(control_url)
        .header("Content-Type", r#"text/xml; charset="utf-8""#)
        .header("SOAPACTION", &soap_action)
        .header("User-Agent", &identity.user_agent)
        .header("FriendlyName.dlna.org", &identity.friendly_name);
    if let Some(features) = content_features {
        if !features.is_empty() {
            request = request
                .header("contentFeatures.dlna.org", features)
                .header("transferMode.dlna.org", "Streaming");
        }
    }

    let mut response = request
        .send(body)
        .map_err(|e| ControlError::Network(format!("{action} to {control_url}: {e}")))?;
    let round_trip = started.elapsed();

    let status = response.status();
    let raw_body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| ControlError::Network(format!("reading {action} reply: {e}")))?;

    let envelope = parse_envelope(raw_body.as_bytes());

    if !status.is_success() {
        if let Ok(env) = &envelope {
            if let Some(fault) = parse_fault(env) {
                warn!(
                    url = control_url,
                    action,
                    status = status.as_u16(),
                    error_code = fault.error_code,
                    "SOAP call returned fault"
                );
                return Err(ControlError::SoapFault {
                    action: action.to_string(),
                    fault_string: fault.fault_string,
                    error_code: fault.error_code,
                    error_description: fault.error_description,
                });
            }
        }
        warn!(
            url = control_url,
            action,
            status = status.as_u16(),
            body_snippet = %snippet(&raw_body),
            "SOAP call returned non-success status"
        );
        return Err(ControlError::Network(format!(
            "{action} failed with HTTP status {status}"
        )));
    }

    let envelope =
        envelope.map_err(|e| ControlError::MalformedXml(format!("{action} reply: {e}")))?;

    // A 200 carrying a fault happens on sloppy firmware.
    if let Some(fault) = parse_fault(&envelope) {
        return Err(ControlError::SoapFault {
            action: action.to_string(),
            fault_string: fault.fault_string,
            error_code: fault.error_code,
            error_description: fault.error_description,
        });
    }

    let values = match envelope.action_response(action) {
        Some(response_elem) => flatten_response(response_elem),
        None => HashMap::new(),
    };

    debug!(action, round_trip_ms = round_trip.as_millis() as u64, "SOAP response parsed");
    Ok(SoapReply { values, round_trip })
}

/// Fetch an XML document (device description, SCPD) with the
/// UPnP-conforming headers.
pub fn fetch_device_xml(
    url: &str,
    timeout: Duration,
    identity: &ClientIdentity,
) -> Result<String, ControlError> {
    debug!(url, "fetching device XML");
    let agent = agent_with_timeout(timeout);

    let mut response = agent
        .get(url)
        .header("User-Agent", &identity.user_agent)
        .header("FriendlyName.dlna.org", &identity.friendly_name)
        .header("Accept", "text/xml")
        .call()
        .map_err(|e| ControlError::Network(format!("GET {url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ControlError::Network(format!(
            "GET {url} failed with HTTP status {status}"
        )));
    }

    response
        .body_mut()
        .read_to_string()
        .map_err(|e| ControlError::Network(format!("reading {url}: {e}")))
}

/// Outcome of a SUBSCRIBE request.
#[derive(Debug, Clone)]
pub struct SubscribeOutcome {
    pub sid: String,
    /// Lease granted by the device, seconds.
    pub timeout_seconds: u32,
}

/// Issue a GENA SUBSCRIBE.
///
/// First subscription: pass `callback_url` (and optionally the state
/// variables of interest); renewal: pass the existing `sid` instead.
pub fn subscribe_events(
    event_sub_url: &str,
    callback_url: Option<&str>,
    sid: Option<&str>,
    state_vars: Option<&str>,
    requested_timeout_secs: u32,
    http_timeout: Duration,
    identity: &ClientIdentity,
) -> Result<SubscribeOutcome, ControlError> {
    let agent = agent_with_timeout(http_timeout);

    let mut builder = ureq::http::Request::builder()
        .method(subscribe_method())
        .uri(event_sub_url)
        .header("User-Agent", &identity.user_agent)
        .header("TIMEOUT", format!("Second-{requested_timeout_secs}"));

    match (sid, callback_url) {
        (Some(sid), _) => {
            builder = builder.header("SID", sid);
        }
        (None, Some(callback)) => {
            builder = builder
                .header("CALLBACK", format!("<{callback}>"))
                .header("NT", "upnp:event");
            if let Some(vars) = state_vars {
                builder = builder.header("STATEVAR", vars);
            }
        }
        (None, None) => {
            return Err(ControlError::Network(
                "SUBSCRIBE needs either a callback URL or a SID".to_string(),
            ));
        }
    }

    let request = builder
        .body(())
        .map_err(|e| ControlError::Network(format!("building SUBSCRIBE: {e}")))?;

    let response = agent
        .run(request)
        .map_err(|e| ControlError::Network(format!("SUBSCRIBE {event_sub_url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ControlError::Network(format!(
            "SUBSCRIBE {event_sub_url} failed with HTTP status {status}"
        )));
    }

    let granted_sid = response
        .headers()
        .get("SID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| sid.map(str::to_string))
        .ok_or_else(|| {
            ControlError::MalformedXml("SUBSCRIBE response without SID header".to_string())
        })?;

    let timeout_seconds = response
        .headers()
        .get("TIMEOUT")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_second_header)
        .unwrap_or(requested_timeout_secs);

    debug!(url = event_sub_url, sid = granted_sid.as_str(), timeout_seconds, "subscribed");
    Ok(SubscribeOutcome {
        sid: granted_sid,
        timeout_seconds,
    })
}

/// Issue a GENA UNSUBSCRIBE. Best-effort by contract: the caller may be
/// tearing down a device that already left the network.
pub fn unsubscribe_events(
    event_sub_url: &str,
    sid: &str,
    http_timeout: Duration,
    identity: &ClientIdentity,
) -> Result<(), ControlError> {
    let agent = agent_with_timeout(http_timeout);

    let request = ureq::http::Request::builder()
        .method(unsubscribe_method())
        .uri(event_sub_url)
        .header("User-Agent", &identity.user_agent)
        .header("SID", sid)
        .body(())
        .map_err(|e| ControlError::Network(format!("building UNSUBSCRIBE: {e}")))?;

    let response = agent
        .run(request)
        .map_err(|e| ControlError::Network(format!("UNSUBSCRIBE {event_sub_url}: {e}")))?;

    if !response.status().is_success() {
        return Err(ControlError::Network(format!(
            "UNSUBSCRIBE {event_sub_url} failed with HTTP status {}",
            response.status()
        )));
    }
    Ok(())
}

fn subscribe_method() -> ureq::http::Method {
    ureq::http::Method::from_bytes(b"SUBSCRIBE").expect("static method name")
}

fn unsubscribe_method() -> ureq::http::Method {
    ureq::http::Method::from_bytes(b"UNSUBSCRIBE").expect("static method name")
}

/// Parse the "Second-1800" TIMEOUT header form.
fn parse_second_header(value: &str) -> Option<u32> {
    value
        .trim()
        .strip_prefix("Second-")
        .and_then(|s| s.parse().ok())
}

fn snippet(body: &str) -> String {
    const MAX_LEN: usize = 256;
    let trimmed = body.trim();
    if trimmed.len() <= MAX_LEN {
        trimmed.to_string()
    } else {
        format!("{}…", &trimmed[..MAX_LEN])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_header_parsing() {
        assert_eq!(parse_second_header("Second-1800"), Some(1800));
        assert_eq!(parse_second_header(" Second-60"), Some(60));
        assert_eq!(parse_second_header("infinite"), None);
        assert_eq!(parse_second_header("Second-x"), None);
    }

    #[test]
    fn custom_methods_are_valid() {
        assert_eq!(subscribe_method().as_str(), "SUBSCRIBE");
        assert_eq!(unsubscribe_method().as_str(), "UNSUBSCRIBE");
    }

    #[test]
    fn snippet_truncates() {
        let long = "x".repeat(400);
        assert!(snippet(&long).len() < 280);
        assert_eq!(snippet("short"), "short");
    }
}
