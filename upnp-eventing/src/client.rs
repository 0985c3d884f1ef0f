//! Outbound subscription client.
//!
//! Wraps the wire-level [`GenaClient`] and keeps the [`SubscriptionRegistry`]
//! in step with what devices grant. A failed request never mutates the
//! registry, and nothing here retries; retries for renewals belong to the
//! renewal scheduler.

use gena_client::{GenaClient, UnsubscribeOutcome};
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::ServerConfig;
use crate::error::{Result, SubscriptionError};
use crate::registry::SubscriptionRegistry;
use crate::subscription::{Subscriber, Subscription};

/// Stateful client issuing SUBSCRIBE/UNSUBSCRIBE requests and recording the
/// results in the registry.
#[derive(Clone)]
pub struct SubscriptionClient {
    gena: GenaClient,
    registry: Arc<SubscriptionRegistry>,
}

impl SubscriptionClient {
    /// Create a client using the request timeouts from `config`.
    pub fn new(config: &ServerConfig, registry: Arc<SubscriptionRegistry>) -> Result<Self> {
        let gena = GenaClient::with_timeouts(config.connect_timeout, config.request_timeout)
            .map_err(|e| SubscriptionError::Configuration(e.to_string()))?;
        Ok(Self { gena, registry })
    }

    /// The registry this client writes to.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Subscribe to `event_url`, or renew `existing_id` when given.
    ///
    /// A first-time subscription stores a new record keyed by the SID the
    /// device granted. A renewal requires the record to exist and to belong to
    /// the same device and subscriber; the stored record is then re-keyed if
    /// the device handed out a new SID, its expiry refreshed and its
    /// `auto_renew` flag replaced by the caller's.
    ///
    /// # Returns
    ///
    /// The SID now identifying the subscription.
    ///
    /// # Errors
    ///
    /// - `NotFound` if `existing_id` is not registered
    /// - `DuplicateId` if `existing_id` belongs to another device/subscriber
    /// - `Transport` / `Protocol` if the device request fails
    pub async fn subscribe(
        &self,
        event_url: &str,
        callback_url: &str,
        existing_id: Option<&str>,
        timeout_seconds: u32,
        auto_renew: bool,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<String> {
        match existing_id {
            None => {
                let grant = self
                    .gena
                    .subscribe(event_url, callback_url, timeout_seconds)
                    .await?;

                let subscription = Subscription::new(
                    grant.sid.clone(),
                    event_url,
                    callback_url,
                    grant.timeout_seconds,
                    auto_renew,
                    subscriber,
                    SystemTime::now(),
                );
                self.registry.put(subscription)?;

                tracing::info!(
                    sid = %grant.sid,
                    event_url,
                    timeout_seconds = grant.timeout_seconds,
                    "subscribed"
                );
                Ok(grant.sid)
            }
            Some(id) => {
                let current = self.registry.get(id)?;
                if !current.is_owned_by(event_url, &subscriber) {
                    return Err(SubscriptionError::DuplicateId(id.to_string()));
                }
                let renewed = self.renew_with_timeout(&current, timeout_seconds).await?;
                if renewed.auto_renew != auto_renew {
                    self.registry.set_auto_renew(&renewed.id, auto_renew)?;
                }
                Ok(renewed.id)
            }
        }
    }

    /// Renew a registered subscription with its stored timeout.
    pub async fn renew(&self, id: &str) -> Result<Subscription> {
        let current = self.registry.get(id)?;
        self.renew_with_timeout(&current, current.timeout_seconds)
            .await
    }

    async fn renew_with_timeout(
        &self,
        current: &Subscription,
        timeout_seconds: u32,
    ) -> Result<Subscription> {
        let grant = self
            .gena
            .renew(
                &current.event_url,
                &current.callback_url,
                &current.id,
                timeout_seconds,
            )
            .await?;

        let renewed = self.registry.apply_renewal(
            &current.id,
            &grant.sid,
            grant.timeout_seconds,
            SystemTime::now(),
        )?;

        if renewed.id != current.id {
            tracing::info!(previous_sid = %current.id, sid = %renewed.id, "subscription re-keyed on renewal");
        }
        tracing::debug!(
            sid = %renewed.id,
            timeout_seconds = renewed.timeout_seconds,
            "subscription renewed"
        );
        Ok(renewed)
    }

    /// Cancel the subscription `id` at `event_url`.
    ///
    /// The entry is removed when the device acknowledges the cancellation or
    /// no longer knows the SID. On any other failure the entry stays so the
    /// caller may retry.
    pub async fn unsubscribe(&self, event_url: &str, id: &str) -> Result<()> {
        let outcome = self.gena.unsubscribe(event_url, id).await?;

        if outcome == UnsubscribeOutcome::UnknownToDevice {
            tracing::debug!(sid = id, "device no longer knew the subscription");
        }
        self.registry.remove(id);

        tracing::info!(sid = id, event_url, "unsubscribed");
        Ok(())
    }
}
