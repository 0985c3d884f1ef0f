//! # upnp-eventing
//!
//! Client-side UPnP/GENA eventing: subscribe to state changes published by
//! UPnP devices, receive their NOTIFY callbacks on a local HTTP listener and
//! route each notification to the subscriber that asked for it.
//!
//! ## Architecture
//!
//! - [`SubscriptionServer`]: façade owning the listener, the registry and the
//!   background tasks, with an explicit `start`/`stop` lifecycle
//! - [`SubscriptionRegistry`]: SID-keyed table correlating inbound NOTIFY
//!   requests with subscribers
//! - [`SubscriptionClient`]: SUBSCRIBE / renewal / UNSUBSCRIBE requests that
//!   keep the registry in step with what devices grant
//! - [`RenewalScheduler`]: one task per auto-renewing subscription, with
//!   bounded retries before the subscription is expired
//! - [`ExpiryReaper`]: purges subscriptions whose timeout elapsed without
//!   renewal
//!
//! Renewals and expiries are reported asynchronously as [`LifecycleEvent`]s
//! through [`SubscriptionServer::lifecycle_events`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use upnp_eventing::{NotifyEvent, ServerConfig, Subscriber, SubscriptionServer};
//!
//! struct Printer;
//!
//! impl Subscriber for Printer {
//!     fn notify(&self, event: NotifyEvent) {
//!         println!("{} -> {}", event.subscription_id, event.body);
//!     }
//! }
//!
//! # async fn run() -> upnp_eventing::Result<()> {
//! let server = Arc::new(SubscriptionServer::new(ServerConfig::default())?);
//! let runner = server.clone();
//! tokio::spawn(async move { runner.start("0.0.0.0:3400".parse().unwrap()).await });
//!
//! server
//!     .subscribe("http://192.168.1.20:1400/event", None, 1800, true, Arc::new(Printer))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod event;
pub mod logging;
mod reaper;
mod registry;
mod renewal;
mod server;
mod subscription;

pub use client::SubscriptionClient;
pub use config::ServerConfig;
pub use error::{Result, SubscriptionError};
pub use event::{ExpiryReason, LifecycleEvent};
pub use reaper::ExpiryReaper;
pub use registry::{ActiveSubscriptions, SubscriptionRegistry};
pub use renewal::RenewalScheduler;
pub use server::SubscriptionServer;
pub use subscription::{NotifyEvent, Subscriber, Subscription};

pub use callback_server::DeliveryError;
