//! Error types for the GENA client

use thiserror::Error;

/// Errors that can occur while talking to a device's event endpoint
#[derive(Debug, Error)]
pub enum GenaError {
    /// The event URL could not be used for a request
    #[error("Invalid event URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Connection, DNS or timeout failure reaching the device
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device answered with something other than 200 OK
    #[error("{method} failed: HTTP {status}")]
    UnexpectedStatus { method: &'static str, status: u16 },

    /// A header required on a 200 response was absent
    #[error("Missing {0} header in response")]
    MissingHeader(&'static str),

    /// A header required on a 200 response could not be parsed
    #[error("Malformed {name} header: '{value}'")]
    MalformedHeader { name: &'static str, value: String },
}

impl GenaError {
    /// Whether the failure happened before the device produced a response.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for GenaError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
