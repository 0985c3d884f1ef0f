//! Automatic subscription renewal.
//!
//! This module contains the RenewalScheduler which handles:
//! - One cancellable background task per auto-renewing subscription
//! - Waking up a safety margin before each subscription expires
//! - Retry logic with exponential backoff for failed renewals
//! - Expiring subscriptions once every attempt has failed
//! - Emitting renewal lifecycle events

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::SubscriptionClient;
use crate::config::ServerConfig;
use crate::error::SubscriptionError;
use crate::event::{ExpiryReason, LifecycleEvent};
use crate::subscription::Subscription;

/// Lower bound between two renewals of the same subscription, so a device
/// granting a tiny timeout cannot put the task into a busy loop.
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(250);

/// Scheduler for automatic subscription renewal.
///
/// Every scheduled subscription gets its own task, so a slow or failing device
/// never delays renewals for another. Tasks are tracked by the subscription's
/// current SID; when a renewal hands out a new SID the task is re-filed under
/// it, and [`cancel`](Self::cancel) works with whichever SID the registry
/// currently uses.
///
/// # Renewal Task
///
/// Each task loops:
/// 1. Sleeps until `expires_at - margin` (see [`ServerConfig::renewal_margin`])
/// 2. Renews, retrying with exponential backoff on failure
/// 3. On success emits [`LifecycleEvent::Renewed`] and starts over
/// 4. After `max_renewal_attempts` failures removes the subscription from the
///    registry, emits a single [`LifecycleEvent::Expired`] and exits
///
/// The task also exits quietly when the subscription disappears from the
/// registry, for example after an UNSUBSCRIBE.
#[derive(Clone)]
pub struct RenewalScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    client: SubscriptionClient,
    config: ServerConfig,
    events: mpsc::Sender<LifecycleEvent>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Why a renewal loop stopped.
enum RenewalStop {
    /// The subscription is no longer registered
    Gone,
    /// Every attempt failed
    Exhausted { attempts: u32, last_error: String },
}

impl RenewalScheduler {
    /// Create a scheduler renewing through `client`.
    ///
    /// # Arguments
    ///
    /// * `client` - Client used for renewal SUBSCRIBE requests
    /// * `config` - Margin and retry policy
    /// * `events` - Channel sender for lifecycle events
    pub fn new(
        client: SubscriptionClient,
        config: ServerConfig,
        events: mpsc::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                client,
                config,
                events,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start (or restart) automatic renewal for subscription `id`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule(&self, id: &str) {
        let mut tasks = self.inner.tasks.lock();
        if let Some(previous) = tasks.remove(id) {
            previous.abort();
        }

        let handle = tokio::spawn(Self::renewal_task(self.inner.clone(), id.to_string()));
        tasks.insert(id.to_string(), handle);
        tracing::debug!(sid = id, "renewal scheduled");
    }

    /// Stop automatic renewal for subscription `id`.
    ///
    /// Returns whether a renewal task was running.
    pub fn cancel(&self, id: &str) -> bool {
        match self.inner.tasks.lock().remove(id) {
            Some(handle) => {
                handle.abort();
                tracing::debug!(sid = id, "renewal cancelled");
                true
            }
            None => false,
        }
    }

    /// Stop every renewal task.
    pub fn cancel_all(&self) {
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain().map(|(_, h)| h).collect();
        for handle in &tasks {
            handle.abort();
        }
        if !tasks.is_empty() {
            tracing::debug!(count = tasks.len(), "all renewals cancelled");
        }
    }

    /// Whether a renewal task is running for `id`.
    pub fn is_scheduled(&self, id: &str) -> bool {
        self.inner.tasks.lock().contains_key(id)
    }

    /// Number of renewal tasks currently running.
    pub fn scheduled_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    async fn renewal_task(inner: Arc<SchedulerInner>, mut id: String) {
        loop {
            let subscription = match inner.client.registry().get(&id) {
                Ok(subscription) => subscription,
                Err(_) => {
                    inner.forget(&id);
                    return;
                }
            };

            let margin = inner.config.renewal_margin(subscription.timeout_seconds);
            let delay = subscription
                .time_until_renewal(SystemTime::now(), margin)
                .max(MIN_RENEWAL_INTERVAL);
            tokio::time::sleep(delay).await;

            match Self::renew_with_retry(&inner, &id).await {
                Ok(renewed) => {
                    if renewed.id != id {
                        inner.refile(&id, &renewed.id);
                    }
                    inner.emit(LifecycleEvent::Renewed {
                        previous_id: std::mem::replace(&mut id, renewed.id.clone()),
                        id: renewed.id,
                        expires_at: renewed.expires_at,
                    });
                }
                Err(RenewalStop::Gone) => {
                    inner.forget(&id);
                    return;
                }
                Err(RenewalStop::Exhausted {
                    attempts,
                    last_error,
                }) => {
                    Self::handle_subscription_expiration(&inner, &id, attempts, last_error);
                    return;
                }
            }
        }
    }

    /// Renew a subscription with exponential backoff retry logic.
    ///
    /// # Retry Algorithm
    ///
    /// - Attempt 1: Immediate
    /// - Attempt 2: Wait `retry_backoff_base * 2^0` (e.g., 2 seconds)
    /// - Attempt 3: Wait `retry_backoff_base * 2^1` (e.g., 4 seconds)
    /// - etc.
    async fn renew_with_retry(
        inner: &SchedulerInner,
        id: &str,
    ) -> Result<Subscription, RenewalStop> {
        let max_attempts = inner.config.max_renewal_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let backoff = inner.config.retry_delay(attempt);
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }

            match inner.client.renew(id).await {
                Ok(renewed) => return Ok(renewed),
                Err(SubscriptionError::NotFound(_)) => return Err(RenewalStop::Gone),
                Err(e) => {
                    tracing::warn!(
                        sid = id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "failed to renew subscription"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(RenewalStop::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Remove the subscription after all renewal attempts failed and emit an
    /// `Expired` event, unless something else removed it first.
    fn handle_subscription_expiration(
        inner: &SchedulerInner,
        id: &str,
        attempts: u32,
        last_error: String,
    ) {
        inner.forget(id);

        let Some(expired) = inner.client.registry().take(id) else {
            return;
        };

        tracing::warn!(sid = id, attempts, "subscription expired after failed renewals");
        inner.emit(LifecycleEvent::Expired {
            id: expired.id,
            event_url: expired.event_url,
            reason: ExpiryReason::RenewalFailed {
                attempts,
                last_error,
            },
        });
    }
}

impl SchedulerInner {
    /// Move the task handle filed under `old_id` to `new_id`.
    fn refile(&self, old_id: &str, new_id: &str) {
        let mut tasks = self.tasks.lock();
        if let Some(handle) = tasks.remove(old_id) {
            tasks.insert(new_id.to_string(), handle);
        }
    }

    /// Drop the task handle for `id`; called by the task itself on exit.
    fn forget(&self, id: &str) {
        self.tasks.lock().remove(id);
    }

    fn emit(&self, event: LifecycleEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!(error = %e, "lifecycle event dropped");
        }
    }
}
