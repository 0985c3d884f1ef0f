//! Lifecycle notices emitted by the subscription server.

use std::time::SystemTime;

/// Why a subscription left the registry without an UNSUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryReason {
    /// Every renewal attempt failed
    RenewalFailed {
        attempts: u32,
        last_error: String,
    },
    /// The timeout elapsed and the subscription was not set to auto-renew
    NotRenewed,
}

/// Asynchronous notices about subscriptions managed in the background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A renewal succeeded; `id` differs from `previous_id` when the device
    /// granted a new SID.
    Renewed {
        previous_id: String,
        id: String,
        expires_at: SystemTime,
    },

    /// The subscription was removed from the registry.
    Expired {
        id: String,
        event_url: String,
        reason: ExpiryReason,
    },
}

impl LifecycleEvent {
    /// The current SID the event refers to.
    pub fn subscription_id(&self) -> &str {
        match self {
            Self::Renewed { id, .. } | Self::Expired { id, .. } => id,
        }
    }
}
