use crate::soap::SoapFault;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket or HTTP failure.
    #[error("transport: {0}")]
    Transport(String),
    /// Broken HTTP or XML framing.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// A peer violated UPnP semantics: missing required headers or tags,
    /// unexpected status, mismatched SID on renewal.
    #[error("protocol: {0}")]
    Protocol(String),
    /// An action invocation that came back as a SOAP fault envelope.
    #[error("{0}")]
    Fault(SoapFault),
    /// Description documents missing required fields or internally
    /// inconsistent (e.g. an argument referencing an unknown state variable).
    #[error("description build: {0}")]
    Build(String),
}

impl Error {
    pub(crate) fn transport(e: impl std::fmt::Display) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
