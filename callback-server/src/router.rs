//! Event routing for HTTP callback notifications.
//!
//! This module provides the `EventRouter` which hands each accepted NOTIFY
//! request to a [`NotificationSink`]. The sink owns the correlation between
//! subscription IDs and subscribers; the router only counts outcomes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Generic notification payload for UPnP event notifications.
///
/// This represents an unparsed NOTIFY request that has been received via
/// HTTP callback. The body is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
    /// The subscription ID from the `SID` header
    pub subscription_id: String,
    /// The raw event body
    pub body: String,
    /// Event sequence number from the `SEQ` header, when present and numeric
    pub seq: Option<u32>,
}

/// Reasons a sink refuses a notification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// No subscription is registered under this SID
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),
    /// The subscription exists but its timeout has elapsed
    #[error("Subscription expired: {0}")]
    Expired(String),
}

/// Receiver of correlated NOTIFY payloads.
///
/// `deliver` runs on the HTTP worker handling the request; the server answers
/// the device only after it returns, so implementations should hand off
/// quickly.
pub trait NotificationSink: Send + Sync {
    /// Accept a notification or explain why it cannot be matched.
    fn deliver(&self, payload: NotificationPayload) -> Result<(), DeliveryError>;
}

/// Snapshot of routing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Notifications accepted by the sink
    pub routed: u64,
    /// Notifications the sink refused
    pub rejected: u64,
}

/// Routes events from HTTP callbacks to a sink.
pub struct EventRouter {
    sink: Arc<dyn NotificationSink>,
    routed: AtomicU64,
    rejected: AtomicU64,
}

impl EventRouter {
    /// Create a new event router delivering into `sink`.
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            routed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Route an incoming event to the sink.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the sink accepted the payload, otherwise the sink's reason.
    pub fn route_event(&self, payload: NotificationPayload) -> Result<(), DeliveryError> {
        let subscription_id = payload.subscription_id.clone();

        match self.sink.deliver(payload) {
            Ok(()) => {
                self.routed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(sid = %subscription_id, "notification routed");
                Ok(())
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sid = %subscription_id, error = %e, "notification rejected");
                Err(e)
            }
        }
    }

    /// Current routed/rejected counters.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.routed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}
