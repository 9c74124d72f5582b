//! # castupnp: UPnP AV protocol plumbing
//!
//! Wire-format concerns shared by the CastBridge control point:
//!
//! - [`soap`] : SOAP 1.1 envelopes, faults, action requests and the
//!   flattened key/value view of action replies,
//! - [`scpd`] : service descriptions (SCPD) parsed into an action schema,
//! - [`description`] : device description documents and their service table,
//! - [`eventing`] : GENA `LastChange` notification bodies,
//! - [`didl`] : the little DIDL-Lite we need on the control side,
//! - [`ssdp`] : the discovery event payloads handed to us by the host.
//!
//! Nothing in this crate performs network I/O; it only turns bytes into
//! structures and back.

pub mod description;
pub mod didl;
pub mod errors;
pub mod eventing;
pub mod scpd;
pub mod soap;
pub mod ssdp;

pub use description::{DeviceDescription, DeviceService, ServiceKind};
pub use errors::UpnpError;
pub use scpd::{ActionArgument, ArgumentDirection, ServiceAction, ServiceSchema, StateVariable};
pub use soap::{SoapEnvelope, SoapFaultInfo};
pub use ssdp::DiscoveredDevice;
