//! SOAP 1.1 support for the control point side of UPnP.
//!
//! This module only deals with the client perspective: building action
//! request envelopes, parsing reply envelopes, extracting faults, and
//! flattening replies into the key/value form the session engine consumes.

mod builder;
mod envelope;
mod fault;
mod flatten;

pub use builder::build_action_request;
pub(crate) use builder::text_element;
pub use envelope::{parse_envelope, SoapBody, SoapEnvelope};
pub use fault::{parse_fault, SoapFaultInfo};
pub use flatten::flatten_response;
