//! Test helpers and mock devices for integration testing.
//!
//! This module provides:
//! - A warp-based mock UPnP device accepting SUBSCRIBE/UNSUBSCRIBE
//! - A recording subscriber
//! - Helpers to raise NOTIFY requests at a callback URL

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use upnp_eventing::{NotifyEvent, SubscriptionServer, Subscriber};
use warp::http::{HeaderMap, Method, Response, StatusCode};
use warp::Filter;

/// What the mock device does with SUBSCRIBE requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscribeMode {
    /// 200 with a fresh SID and the requested TIMEOUT
    Grant = 0,
    /// 500 for every SUBSCRIBE
    Fail = 1,
}

/// Headers observed by the device.
#[derive(Debug, Default, Clone)]
pub struct DeviceState {
    pub subscribe_count: u32,
    /// SID header of the most recent SUBSCRIBE (empty for first-time ones)
    pub subscribe_sid: String,
    pub callback_url: String,
    pub timeout: String,
    pub nt: String,
    pub unsubscribe_count: u32,
    pub unsubscribe_sid: String,
}

/// Mock UPnP device serving SUBSCRIBE/UNSUBSCRIBE on any path.
#[derive(Clone)]
pub struct MockDevice {
    addr: SocketAddr,
    state: Arc<Mutex<DeviceState>>,
    mode: Arc<AtomicU8>,
    next_sid: Arc<AtomicU32>,
    /// TIMEOUT granted instead of the requested one, when non-zero
    granted_timeout: Arc<AtomicU32>,
    /// Delay before answering each SUBSCRIBE
    subscribe_delay_ms: Arc<AtomicU64>,
    /// Status returned for UNSUBSCRIBE
    unsubscribe_status: Arc<AtomicU16>,
}

impl MockDevice {
    /// Start a device on `addr` (port 0 picks a free port).
    pub fn start(addr: SocketAddr) -> Self {
        let state = Arc::new(Mutex::new(DeviceState::default()));
        let mode = Arc::new(AtomicU8::new(SubscribeMode::Grant as u8));
        let next_sid = Arc::new(AtomicU32::new(1));
        let granted_timeout = Arc::new(AtomicU32::new(0));
        let subscribe_delay_ms = Arc::new(AtomicU64::new(0));
        let unsubscribe_status = Arc::new(AtomicU16::new(200));

        let route = warp::method()
            .and(warp::header::headers_cloned())
            .then({
                let state = state.clone();
                let mode = mode.clone();
                let next_sid = next_sid.clone();
                let granted_timeout = granted_timeout.clone();
                let subscribe_delay_ms = subscribe_delay_ms.clone();
                let unsubscribe_status = unsubscribe_status.clone();
                move |method: Method, headers: HeaderMap| {
                    let state = state.clone();
                    let mode = mode.clone();
                    let next_sid = next_sid.clone();
                    let granted_timeout = granted_timeout.clone();
                    let subscribe_delay_ms = subscribe_delay_ms.clone();
                    let unsubscribe_status = unsubscribe_status.clone();
                    async move {
                        let header = |name: &str| {
                            headers
                                .get(name)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or_default()
                                .to_string()
                        };

                        match method.as_str() {
                            "SUBSCRIBE" => {
                                let requested_timeout = header("TIMEOUT");
                                {
                                    let mut state = state.lock().unwrap();
                                    state.subscribe_count += 1;
                                    state.subscribe_sid = header("SID");
                                    state.callback_url = header("CALLBACK");
                                    state.timeout = requested_timeout.clone();
                                    state.nt = header("NT");
                                }

                                let delay = subscribe_delay_ms.load(Ordering::SeqCst);
                                if delay > 0 {
                                    tokio::time::sleep(Duration::from_millis(delay)).await;
                                }

                                if mode.load(Ordering::SeqCst) == SubscribeMode::Fail as u8 {
                                    return Response::builder()
                                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                                        .body(String::new())
                                        .unwrap();
                                }

                                let timeout = match granted_timeout.load(Ordering::SeqCst) {
                                    0 => requested_timeout,
                                    seconds => format!("Second-{seconds}"),
                                };
                                let sid = next_sid.fetch_add(1, Ordering::SeqCst);
                                Response::builder()
                                    .status(StatusCode::OK)
                                    .header("SID", sid.to_string())
                                    .header("TIMEOUT", timeout)
                                    .body(String::new())
                                    .unwrap()
                            }
                            "UNSUBSCRIBE" => {
                                {
                                    let mut state = state.lock().unwrap();
                                    state.unsubscribe_count += 1;
                                    state.unsubscribe_sid = header("SID");
                                }
                                Response::builder()
                                    .status(unsubscribe_status.load(Ordering::SeqCst))
                                    .body(String::new())
                                    .unwrap()
                            }
                            _ => Response::builder()
                                .status(StatusCode::METHOD_NOT_ALLOWED)
                                .body(String::new())
                                .unwrap(),
                        }
                    }
                }
            });

        let (addr, server) = warp::serve(route).bind_ephemeral(addr);
        tokio::spawn(server);

        Self {
            addr,
            state,
            mode,
            next_sid,
            granted_timeout,
            subscribe_delay_ms,
            unsubscribe_status,
        }
    }

    /// Start a device on a free loopback port.
    pub fn start_ephemeral() -> Self {
        Self::start(([127, 0, 0, 1], 0).into())
    }

    pub fn event_url(&self) -> String {
        format!("http://{}/upnp/event/basicevent1", self.addr)
    }

    pub fn state(&self) -> DeviceState {
        self.state.lock().unwrap().clone()
    }

    pub fn set_mode(&self, mode: SubscribeMode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    /// Grant `seconds` regardless of the requested TIMEOUT.
    pub fn grant_timeout(&self, seconds: u32) {
        self.granted_timeout.store(seconds, Ordering::SeqCst);
    }

    /// Hold every SUBSCRIBE response for `delay`.
    pub fn delay_subscribe(&self, delay: Duration) {
        self.subscribe_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Answer UNSUBSCRIBE with `status` from now on.
    pub fn set_unsubscribe_status(&self, status: u16) {
        self.unsubscribe_status.store(status, Ordering::SeqCst);
    }

    /// Send a NOTIFY to the callback URL from the last SUBSCRIBE.
    ///
    /// Returns the HTTP status the listener answered with.
    pub async fn raise_event(&self, sid: &str, body: &str) -> u16 {
        let callback = self.state().callback_url;
        let url = callback.trim_start_matches('<').trim_end_matches('>').to_string();
        send_notify(&url, sid, body).await
    }
}

/// Send a property change NOTIFY to `url`.
pub async fn send_notify(url: &str, sid: &str, body: &str) -> u16 {
    reqwest::Client::new()
        .request(reqwest::Method::from_bytes(b"NOTIFY").unwrap(), url)
        .header("NT", "upnp:event")
        .header("NTS", "upnp:propchange")
        .header("SID", sid)
        .header("SEQ", "0")
        .body(body.to_string())
        .send()
        .await
        .expect("NOTIFY request failed")
        .status()
        .as_u16()
}

/// Subscriber recording every notification it receives.
#[derive(Default)]
pub struct MockSubscriber {
    events: Mutex<Vec<NotifyEvent>>,
}

impl MockSubscriber {
    pub fn notify_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn last_event(&self) -> Option<NotifyEvent> {
        self.events.lock().unwrap().last().cloned()
    }
}

impl Subscriber for MockSubscriber {
    fn notify(&self, event: NotifyEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Start `server` on `addr` in the background and wait for it to listen.
pub async fn start_server(
    server: &Arc<SubscriptionServer>,
    addr: SocketAddr,
) -> tokio::task::JoinHandle<upnp_eventing::Result<()>> {
    let runner = server.clone();
    let handle = tokio::spawn(async move { runner.start(addr).await });

    for _ in 0..200 {
        if server.local_addr().is_some() {
            return handle;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("subscription server did not start");
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
