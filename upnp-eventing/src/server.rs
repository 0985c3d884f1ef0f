//! Subscription server façade.
//!
//! The [`SubscriptionServer`] owns every moving part of client-side eventing:
//! the registry, the inbound NOTIFY listener, the outbound client, the renewal
//! scheduler and the expiry reaper. It is the only place with an explicit
//! start/stop lifecycle and decides the teardown order.

use callback_server::{
    CallbackServer, DeliveryError, NotificationPayload, NotificationSink,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};

use crate::client::SubscriptionClient;
use crate::config::ServerConfig;
use crate::error::{Result, SubscriptionError};
use crate::event::LifecycleEvent;
use crate::reaper::ExpiryReaper;
use crate::registry::SubscriptionRegistry;
use crate::renewal::RenewalScheduler;
use crate::subscription::Subscriber;

/// How often `start` checks that the listener task is still alive.
const LISTENER_HEALTH_INTERVAL: Duration = Duration::from_millis(250);

/// Where the listener is in its lifecycle, as seen by `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ListenerState {
    Pending,
    Ready { local_addr: SocketAddr, callback_url: String },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct Lifecycle {
    phase: Phase,
    listener: Option<CallbackServer>,
    reaper: Option<ExpiryReaper>,
}

/// Delivers correlated NOTIFY requests from the listener into the registry.
struct RegistrySink {
    registry: Arc<SubscriptionRegistry>,
}

impl NotificationSink for RegistrySink {
    fn deliver(&self, payload: NotificationPayload) -> std::result::Result<(), DeliveryError> {
        tracing::debug!(sid = %payload.subscription_id, seq = ?payload.seq, "dispatching notification");
        self.registry
            .dispatch(&payload.subscription_id, SystemTime::now(), payload.body)
    }
}

/// Client-side UPnP event subscription server.
///
/// Share it behind an `Arc`: one task runs [`start`](Self::start), which
/// only returns after [`stop`](Self::stop), while others subscribe and
/// unsubscribe.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use upnp_eventing::{NotifyEvent, ServerConfig, Subscriber, SubscriptionServer};
///
/// struct Printer;
///
/// impl Subscriber for Printer {
///     fn notify(&self, event: NotifyEvent) {
///         println!("{}: {}", event.subscription_id, event.body);
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> upnp_eventing::Result<()> {
///     let server = Arc::new(SubscriptionServer::new(ServerConfig::default())?);
///
///     let runner = server.clone();
///     let listener = tokio::spawn(async move { runner.start("0.0.0.0:0".parse().unwrap()).await });
///
///     let sid = server
///         .subscribe("http://192.168.1.20:1400/event", None, 1800, true, Arc::new(Printer))
///         .await?;
///     println!("subscribed as {sid}");
///
///     server.stop().await?;
///     let _ = listener.await;
///     Ok(())
/// }
/// ```
pub struct SubscriptionServer {
    config: ServerConfig,
    registry: Arc<SubscriptionRegistry>,
    client: SubscriptionClient,
    scheduler: RenewalScheduler,
    lifecycle: Mutex<Lifecycle>,
    listener_state: watch::Sender<ListenerState>,
    event_receiver: Mutex<Option<mpsc::Receiver<LifecycleEvent>>>,
    event_sender: mpsc::Sender<LifecycleEvent>,
}

impl SubscriptionServer {
    /// Create a server; nothing is bound until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if `config` fails validation.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(SubscriptionRegistry::new());
        let client = SubscriptionClient::new(&config, registry.clone())?;
        let (event_sender, event_receiver) = mpsc::channel(config.event_buffer_size);
        let scheduler = RenewalScheduler::new(client.clone(), config.clone(), event_sender.clone());
        let (listener_state, _) = watch::channel(ListenerState::Pending);

        Ok(Self {
            config,
            registry,
            client,
            scheduler,
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Idle,
                listener: None,
                reaper: None,
            }),
            listener_state,
            event_receiver: Mutex::new(Some(event_receiver)),
            event_sender,
        })
    }

    /// Take the receiver of lifecycle notices.
    ///
    /// Returns `None` after the first call. Notices are dropped while the
    /// channel is full.
    pub fn lifecycle_events(&self) -> Option<mpsc::Receiver<LifecycleEvent>> {
        self.event_receiver.lock().take()
    }

    /// Bind the NOTIFY listener on `local_addr` and serve until [`stop`](Self::stop).
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted` if the server is running
    /// - `Stopped` if the server was stopped
    /// - `Listener` if the address cannot be bound
    pub async fn start(&self, local_addr: SocketAddr) -> Result<()> {
        let mut stopped = self.listener_state.subscribe();

        {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.phase {
                Phase::Running => return Err(SubscriptionError::AlreadyStarted),
                Phase::Stopped => return Err(SubscriptionError::Stopped),
                Phase::Idle => {}
            }

            let sink = Arc::new(RegistrySink {
                registry: self.registry.clone(),
            });
            let listener = CallbackServer::bind(local_addr, sink)?;
            let reaper = ExpiryReaper::start(
                self.registry.clone(),
                self.event_sender.clone(),
                self.config.expiry_sweep_interval,
            );

            self.listener_state.send_replace(ListenerState::Ready {
                local_addr: listener.local_addr(),
                callback_url: listener.base_url().to_string(),
            });
            tracing::info!(
                local_addr = %listener.local_addr(),
                callback_url = listener.base_url(),
                "subscription server started"
            );

            lifecycle.phase = Phase::Running;
            lifecycle.listener = Some(listener);
            lifecycle.reaper = Some(reaper);
        }

        let mut health = tokio::time::interval(LISTENER_HEALTH_INTERVAL);
        loop {
            tokio::select! {
                _ = stopped.wait_for(|state| *state == ListenerState::Closed) => return Ok(()),
                _ = health.tick() => {
                    if self.take_exited_listener() {
                        tracing::error!("callback listener exited unexpectedly");
                        self.listener_state.send_replace(ListenerState::Closed);
                        return Err(SubscriptionError::Listener(
                            "listener task exited unexpectedly".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Drop the listener if its task ended while the server is running.
    fn take_exited_listener(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.phase != Phase::Running {
            return false;
        }
        let exited = lifecycle
            .listener
            .as_ref()
            .map_or(true, CallbackServer::is_finished);
        if exited {
            lifecycle.listener = None;
        }
        exited
    }

    /// Subscribe to `event_url`, or renew `existing_id`, on behalf of `subscriber`.
    ///
    /// Waits up to `startup_timeout` for the listener, so it may be called
    /// while [`start`](Self::start) is still binding. When `auto_renew` is set
    /// the renewal scheduler keeps the subscription alive afterwards.
    ///
    /// # Returns
    ///
    /// The SID the device granted.
    pub async fn subscribe(
        &self,
        event_url: &str,
        existing_id: Option<&str>,
        timeout_seconds: u32,
        auto_renew: bool,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<String> {
        let callback_url = self.wait_for_listener().await?;

        let was_scheduled = existing_id.is_some_and(|id| self.scheduler.cancel(id));

        let result = self
            .client
            .subscribe(
                event_url,
                &callback_url,
                existing_id,
                timeout_seconds,
                auto_renew,
                subscriber,
            )
            .await;

        match result {
            Ok(id) => {
                if self.schedule_if_running(&id, auto_renew) {
                    return Ok(id);
                }

                // stop() ran while the request was in flight
                tracing::warn!(sid = %id, "server stopped during subscribe, cancelling");
                if let Err(e) = self.client.unsubscribe(event_url, &id).await {
                    tracing::warn!(sid = %id, error = %e, "failed to cancel subscription granted after stop");
                }
                self.registry.remove(&id);
                Err(SubscriptionError::Stopped)
            }
            Err(e) => {
                if let Some(id) = existing_id.filter(|_| was_scheduled) {
                    self.schedule_if_running(id, true);
                }
                Err(e)
            }
        }
    }

    /// Schedule renewal for `id` when `auto_renew` is set, unless the server
    /// has been stopped.
    ///
    /// Returns `false` if the server is stopped. The lifecycle lock is held
    /// while scheduling, so `stop()` either sees the task or refuses it.
    fn schedule_if_running(&self, id: &str, auto_renew: bool) -> bool {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.phase == Phase::Stopped {
            return false;
        }
        if auto_renew {
            self.scheduler.schedule(id);
        }
        true
    }

    /// Cancel subscription `id` at its device.
    ///
    /// # Errors
    ///
    /// - `NotFound` if `id` is not registered (for example, already unsubscribed)
    /// - `Transport` / `Protocol` if the device request fails; the entry and
    ///   its renewal stay in place
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        if self.phase() == Phase::Stopped {
            return Err(SubscriptionError::Stopped);
        }

        let subscription = self.registry.get(id)?;
        let was_scheduled = self.scheduler.cancel(id);

        match self.client.unsubscribe(&subscription.event_url, id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if was_scheduled && self.registry.contains(id) {
                    self.schedule_if_running(id, true);
                }
                Err(e)
            }
        }
    }

    /// Shut the server down.
    ///
    /// Stops renewals and the reaper, sends a best-effort UNSUBSCRIBE for every
    /// active subscription (bounded by `shutdown_timeout`), empties the
    /// registry, then stops the listener and lets [`start`](Self::start)
    /// return. Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let (listener, reaper) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.phase == Phase::Stopped {
                return Ok(());
            }
            lifecycle.phase = Phase::Stopped;
            (lifecycle.listener.take(), lifecycle.reaper.take())
        };

        self.scheduler.cancel_all();
        if let Some(reaper) = reaper {
            reaper.shutdown().await;
        }

        self.unsubscribe_all().await;
        self.registry.clear();

        self.listener_state.send_replace(ListenerState::Closed);
        if let Some(listener) = listener {
            listener.shutdown().await?;
        }

        tracing::info!("subscription server stopped");
        Ok(())
    }

    async fn unsubscribe_all(&self) {
        let active: Vec<_> = self.registry.list_active(SystemTime::now()).collect();
        if active.is_empty() {
            return;
        }

        let requests = active.iter().map(|subscription| async move {
            let result = self
                .client
                .unsubscribe(&subscription.event_url, &subscription.id)
                .await;
            if let Err(e) = &result {
                tracing::warn!(sid = %subscription.id, error = %e, "failed to unsubscribe during shutdown");
            }
            result
        });

        match tokio::time::timeout(self.config.shutdown_timeout, join_all(requests)).await {
            Ok(results) => {
                let failed = results.iter().filter(|r| r.is_err()).count();
                tracing::debug!(total = results.len(), failed, "shutdown unsubscribe sweep finished");
            }
            Err(_) => {
                tracing::warn!(
                    timeout = ?self.config.shutdown_timeout,
                    "shutdown unsubscribe sweep timed out"
                );
            }
        }
    }

    async fn wait_for_listener(&self) -> Result<String> {
        if self.phase() == Phase::Stopped {
            return Err(SubscriptionError::Stopped);
        }

        let mut state = self.listener_state.subscribe();
        let ready = tokio::time::timeout(
            self.config.startup_timeout,
            state.wait_for(|state| *state != ListenerState::Pending),
        )
        .await
        .map_err(|_| SubscriptionError::NotStarted)?
        .map_err(|_| SubscriptionError::Stopped)?
        .clone();

        match ready {
            ListenerState::Ready { callback_url, .. } => Ok(callback_url),
            _ => Err(SubscriptionError::Stopped),
        }
    }

    fn phase(&self) -> Phase {
        self.lifecycle.lock().phase
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.listener_state.borrow() {
            ListenerState::Ready { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    /// Callback URL advertised to devices, once started.
    pub fn callback_url(&self) -> Option<String> {
        match &*self.listener_state.borrow() {
            ListenerState::Ready { callback_url, .. } => Some(callback_url.clone()),
            _ => None,
        }
    }

    /// The subscription registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// The renewal scheduler.
    pub fn renewal_scheduler(&self) -> &RenewalScheduler {
        &self.scheduler
    }
}
