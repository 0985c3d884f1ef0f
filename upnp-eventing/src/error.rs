//! Error types for the upnp-eventing crate.

use gena_client::GenaError;

/// Result type for subscription operations.
pub type Result<T> = std::result::Result<T, SubscriptionError>;

/// Errors that can occur while managing event subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The device could not be reached (connection, DNS, timeout)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device answered, but not with a usable GENA response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No subscription is registered under this ID
    #[error("Subscription not found: {0}")]
    NotFound(String),

    /// The ID is held by a different device/subscriber pair
    #[error("Subscription ID already in use: {0}")]
    DuplicateId(String),

    /// The listener has not published its address yet
    #[error("Subscription server is not started")]
    NotStarted,

    /// `start` was called on a server that is already running
    #[error("Subscription server is already started")]
    AlreadyStarted,

    /// The server has been stopped and accepts no more work
    #[error("Subscription server is stopped")]
    Stopped,

    /// The inbound listener failed to bind or terminated abnormally
    #[error("Listener error: {0}")]
    Listener(String),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SubscriptionError {
    /// Whether the failure happened before the device produced an answer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<GenaError> for SubscriptionError {
    fn from(error: GenaError) -> Self {
        if error.is_transport() {
            Self::Transport(error.to_string())
        } else {
            Self::Protocol(error.to_string())
        }
    }
}

impl From<callback_server::CallbackError> for SubscriptionError {
    fn from(error: callback_server::CallbackError) -> Self {
        Self::Listener(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SubscriptionError::NotFound("uuid:1".to_string()).to_string(),
            "Subscription not found: uuid:1"
        );
        assert_eq!(
            SubscriptionError::DuplicateId("1".to_string()).to_string(),
            "Subscription ID already in use: 1"
        );
        assert_eq!(
            SubscriptionError::AlreadyStarted.to_string(),
            "Subscription server is already started"
        );
        assert_eq!(
            SubscriptionError::Configuration("bad".to_string()).to_string(),
            "Configuration error: bad"
        );
    }

    #[test]
    fn test_gena_error_classification() {
        let transport: SubscriptionError = GenaError::Transport("connection refused".into()).into();
        assert!(transport.is_transport());

        let status: SubscriptionError = GenaError::UnexpectedStatus {
            method: "SUBSCRIBE",
            status: 500,
        }
        .into();
        assert_eq!(
            status,
            SubscriptionError::Protocol("SUBSCRIBE failed: HTTP 500".to_string())
        );

        let missing: SubscriptionError = GenaError::MissingHeader("SID").into();
        assert!(matches!(missing, SubscriptionError::Protocol(_)));
    }
}
