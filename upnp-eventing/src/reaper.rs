//! Background removal of expired subscriptions.

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::event::{ExpiryReason, LifecycleEvent};
use crate::registry::SubscriptionRegistry;

/// Periodically purges subscriptions whose timeout elapsed without renewal.
///
/// Only entries with `auto_renew == false` are purged; renewing entries are
/// owned by the renewal scheduler. Each purged entry produces one
/// [`LifecycleEvent::Expired`] with [`ExpiryReason::NotRenewed`].
pub struct ExpiryReaper {
    background_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl ExpiryReaper {
    /// Spawn the sweep task. Must be called from within a Tokio runtime.
    pub fn start(
        registry: Arc<SubscriptionRegistry>,
        event_sender: mpsc::Sender<LifecycleEvent>,
        sweep_interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let background_task = tokio::spawn(Self::sweep_task(
            registry,
            event_sender,
            sweep_interval,
            shutdown_rx,
        ));

        Self {
            background_task: Some(background_task),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Stop the sweep task, waiting up to 5 seconds for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }

        if let Some(task) = self.background_task.take() {
            if timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("expiry reaper did not stop within 5 seconds");
            }
        }
    }

    async fn sweep_task(
        registry: Arc<SubscriptionRegistry>,
        event_sender: mpsc::Sender<LifecycleEvent>,
        sweep_interval: Duration,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut ticker = interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    Self::sweep(&registry, &event_sender, SystemTime::now());
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Purge expired entries and report each one.
    fn sweep(
        registry: &SubscriptionRegistry,
        event_sender: &mpsc::Sender<LifecycleEvent>,
        now: SystemTime,
    ) -> usize {
        let expired = registry.purge_expired(now);
        let count = expired.len();

        for subscription in expired {
            tracing::info!(sid = %subscription.id, "subscription expired without renewal");
            let notice = LifecycleEvent::Expired {
                id: subscription.id,
                event_url: subscription.event_url,
                reason: ExpiryReason::NotRenewed,
            };
            if let Err(e) = event_sender.try_send(notice) {
                tracing::debug!(error = %e, "lifecycle event dropped");
            }
        }

        count
    }
}

impl Drop for ExpiryReaper {
    fn drop(&mut self) {
        if let Some(task) = self.background_task.take() {
            task.abort();
        }
    }
}
