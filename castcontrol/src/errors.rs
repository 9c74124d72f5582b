use thiserror::Error;

/// Failure taxonomy of the session engine.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Malformed XML: {0}")]
    MalformedXml(String),
    #[error("{action} returned UPnP error {error_code}: {error_description}")]
    SoapFault {
        action: String,
        fault_string: String,
        error_code: u32,
        error_description: String,
    },
    #[error("Renderer does not support {0}")]
    DeviceUnsupported(String),
    #[error("Session disposed")]
    Cancelled,
    #[error("Host rejected request: {0}")]
    HostRejected(String),
}

impl ControlError {
    pub fn device_unsupported(what: &str) -> Self {
        ControlError::DeviceUnsupported(what.to_string())
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, ControlError::SoapFault { .. })
    }
}

impl From<castupnp::UpnpError> for ControlError {
    fn from(err: castupnp::UpnpError) -> Self {
        ControlError::MalformedXml(err.to_string())
    }
}
