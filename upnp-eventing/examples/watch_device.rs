//! Subscribe to a device's event URL and print every notification.
//!
//! ```text
//! cargo run -p upnp-eventing --example watch_device -- \
//!     http://192.168.1.20:1400/MediaRenderer/AVTransport/Event 0.0.0.0:3400
//! ```
//!
//! Set `UPNP_EVENTING_LOG_MODE=development` to see the library's logs.

use std::sync::Arc;
use upnp_eventing::logging::init_logging_from_env;
use upnp_eventing::{LifecycleEvent, NotifyEvent, ServerConfig, Subscriber, SubscriptionServer};

struct PrintingSubscriber;

impl Subscriber for PrintingSubscriber {
    fn notify(&self, event: NotifyEvent) {
        println!("📨 [{}] {}", event.subscription_id, event.body);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;

    let mut args = std::env::args().skip(1);
    let event_url = args
        .next()
        .ok_or("usage: watch_device <event-url> [listen-addr]")?;
    let listen_addr = args
        .next()
        .unwrap_or_else(|| "0.0.0.0:3400".to_string())
        .parse::<std::net::SocketAddr>()?;

    let server = Arc::new(SubscriptionServer::new(ServerConfig::default())?);
    let mut lifecycle = server
        .lifecycle_events()
        .ok_or("lifecycle events already taken")?;

    let runner = server.clone();
    let listener = tokio::spawn(async move { runner.start(listen_addr).await });

    let sid = server
        .subscribe(&event_url, None, 1800, true, Arc::new(PrintingSubscriber))
        .await?;
    println!(
        "✅ Subscribed to {event_url} as {sid} (callback {})",
        server.callback_url().unwrap_or_default()
    );

    tokio::spawn(async move {
        while let Some(event) = lifecycle.recv().await {
            match event {
                LifecycleEvent::Renewed {
                    previous_id, id, ..
                } => println!("🔄 Renewed {previous_id} -> {id}"),
                LifecycleEvent::Expired { id, reason, .. } => {
                    println!("⌛ Subscription {id} expired: {reason:?}")
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("🛑 Stopping...");
    server.stop().await?;
    listener.await??;
    Ok(())
}
