//! Subscription records and the subscriber capability.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// A correlated NOTIFY delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEvent {
    /// SID the device sent the notification for
    pub subscription_id: String,
    /// Request body, verbatim
    pub body: String,
}

/// Receiver of event notifications for one or more subscriptions.
///
/// `notify` is invoked on the listener task that accepted the NOTIFY, while
/// the registry is read-locked. It must not call back into the registry or
/// the server, and should hand heavy work off to another task.
pub trait Subscriber: Send + Sync {
    fn notify(&self, event: NotifyEvent);
}

/// An event subscription granted by a device.
#[derive(Clone)]
pub struct Subscription {
    /// Device-assigned subscription ID
    pub id: String,
    /// Event endpoint of the device service
    pub event_url: String,
    /// Where the device delivers NOTIFY requests
    pub callback_url: String,
    /// Timeout granted by the device, in seconds
    pub timeout_seconds: u32,
    /// Grant time plus the granted timeout
    pub expires_at: SystemTime,
    /// Whether the renewal scheduler keeps this subscription alive
    pub auto_renew: bool,
    /// Routing target for notifications
    pub subscriber: Arc<dyn Subscriber>,
}

impl Subscription {
    /// Create a record for a grant received at `granted_at`.
    pub fn new(
        id: impl Into<String>,
        event_url: impl Into<String>,
        callback_url: impl Into<String>,
        timeout_seconds: u32,
        auto_renew: bool,
        subscriber: Arc<dyn Subscriber>,
        granted_at: SystemTime,
    ) -> Self {
        Self {
            id: id.into(),
            event_url: event_url.into(),
            callback_url: callback_url.into(),
            timeout_seconds,
            expires_at: expiry_after(granted_at, timeout_seconds),
            auto_renew,
            subscriber,
        }
    }

    /// Whether the subscription has not yet expired at `now`.
    pub fn is_active(&self, now: SystemTime) -> bool {
        self.expires_at > now
    }

    /// Time remaining until expiry, `None` once expired.
    pub fn time_until_expiry(&self, now: SystemTime) -> Option<Duration> {
        self.expires_at
            .duration_since(now)
            .ok()
            .filter(|remaining| !remaining.is_zero())
    }

    /// Time until the renewal for this subscription is due.
    ///
    /// Zero if the renewal window has already opened.
    pub fn time_until_renewal(&self, now: SystemTime, margin: Duration) -> Duration {
        self.time_until_expiry(now)
            .map(|remaining| remaining.saturating_sub(margin))
            .unwrap_or(Duration::ZERO)
    }

    /// Whether this record belongs to the given device/subscriber pair.
    pub fn is_owned_by(&self, event_url: &str, subscriber: &Arc<dyn Subscriber>) -> bool {
        self.event_url == event_url && same_subscriber(&self.subscriber, subscriber)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_url", &self.event_url)
            .field("callback_url", &self.callback_url)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("expires_at", &self.expires_at)
            .field("auto_renew", &self.auto_renew)
            .finish_non_exhaustive()
    }
}

/// `granted_at + timeout_seconds`, saturating on overflow.
pub(crate) fn expiry_after(granted_at: SystemTime, timeout_seconds: u32) -> SystemTime {
    let timeout = Duration::from_secs(u64::from(timeout_seconds));
    granted_at.checked_add(timeout).unwrap_or(granted_at)
}

/// Identity comparison of two subscriber handles (same allocation).
pub(crate) fn same_subscriber(a: &Arc<dyn Subscriber>, b: &Arc<dyn Subscriber>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
