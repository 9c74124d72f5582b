use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpnpError {
    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("XML document error: {0}")]
    XmlTree(#[from] xmltree::ParseError),
    #[error("Missing SOAP Envelope")]
    MissingEnvelope,
    #[error("Missing SOAP Body")]
    MissingBody,
    #[error("Missing required element: {0}")]
    MissingElement(&'static str),
    #[error("Invalid {0} value: {1}")]
    BadValue(&'static str, String),
}
