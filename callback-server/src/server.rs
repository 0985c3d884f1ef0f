//! HTTP server for receiving UPnP event notifications.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::oneshot;
use warp::http::header::{HeaderValue, ALLOW};
use warp::http::{Method, StatusCode};
use warp::{Filter, Rejection, Reply};

use super::router::{DeliveryError, EventRouter, NotificationPayload, NotificationSink};

const NT_UPNP_EVENT: &str = "upnp:event";
const NTS_PROPCHANGE: &str = "upnp:propchange";

/// Errors raised while running the callback server.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// The listener could not be bound
    #[error("Failed to bind callback server on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// The server task ended abnormally
    #[error("Callback server task failed: {0}")]
    Task(String),
}

/// HTTP callback server for receiving UPnP event notifications.
///
/// The `CallbackServer` binds to a local address and accepts UPnP NOTIFY
/// requests on any path. It validates the GENA headers and hands each event to
/// an [`EventRouter`], answering the device once the router has accepted or
/// refused it. Every other HTTP method is answered with 405.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use callback_server::{CallbackServer, DeliveryError, NotificationPayload, NotificationSink};
///
/// struct PrintSink;
///
/// impl NotificationSink for PrintSink {
///     fn deliver(&self, payload: NotificationPayload) -> Result<(), DeliveryError> {
///         println!("event for {}: {}", payload.subscription_id, payload.body);
///         Ok(())
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let server = CallbackServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(PrintSink))
///         .expect("Failed to bind callback server");
///
///     println!("Server listening at: {}", server.base_url());
///     server.shutdown().await.unwrap();
/// }
/// ```
pub struct CallbackServer {
    /// The address the listener is bound to
    local_addr: SocketAddr,
    /// The base URL handed to devices as the callback
    base_url: String,
    /// Event router for handling incoming events
    event_router: Arc<EventRouter>,
    /// Shutdown signal sender
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Server task handle
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind the listener and start serving on a background task.
    ///
    /// Port 0 asks the OS for a free port; [`local_addr`](Self::local_addr)
    /// reports the one chosen. When `addr` is unspecified (`0.0.0.0`) the
    /// base URL advertises the address of the interface used for outbound
    /// traffic instead.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(addr: SocketAddr, sink: Arc<dyn NotificationSink>) -> Result<Self, CallbackError> {
        let event_router = Arc::new(EventRouter::new(sink));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let routes = notify_route(event_router.clone()).recover(handle_rejection);

        let (local_addr, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(addr, async move {
                let _ = shutdown_rx.await;
            })
            .map_err(|e| CallbackError::Bind {
                addr,
                reason: e.to_string(),
            })?;

        let server_handle = tokio::spawn(server);

        let advertised = SocketAddr::new(Self::advertised_ip(local_addr.ip()), local_addr.port());
        let base_url = format!("http://{advertised}");

        tracing::info!(%local_addr, %base_url, "callback server listening");

        Ok(Self {
            local_addr,
            base_url,
            event_router,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        })
    }

    /// Get the callback URL devices should deliver NOTIFY requests to.
    ///
    /// The format is `http://<ip>:<port>`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the port the server is bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Get a reference to the event router.
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.event_router
    }

    /// Whether the server task has already stopped.
    pub fn is_finished(&self) -> bool {
        self.server_handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Shutdown the callback server gracefully.
    ///
    /// Stops accepting connections, then waits for in-flight requests to
    /// complete.
    pub async fn shutdown(mut self) -> Result<(), CallbackError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| CallbackError::Task(e.to_string()))?;
        }

        tracing::info!(local_addr = %self.local_addr, "callback server stopped");
        Ok(())
    }

    /// Pick the IP to advertise for a bound IP.
    fn advertised_ip(bound: IpAddr) -> IpAddr {
        if bound.is_unspecified() {
            Self::detect_local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        } else {
            bound
        }
    }

    /// Detect the local IP address for callback URLs.
    ///
    /// This uses a UDP socket connection to determine the local IP address
    /// that would be used for outbound connections. No data is actually sent.
    fn detect_local_ip() -> Option<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }

    /// Validate the GENA headers of a NOTIFY request.
    ///
    /// `SID` is required. `NT` and `NTS`, when present, must carry the
    /// property change values.
    fn validate_upnp_headers(
        sid: Option<&str>,
        nt: Option<&str>,
        nts: Option<&str>,
    ) -> Result<String, PreconditionFailed> {
        let sid = sid
            .map(str::trim)
            .filter(|sid| !sid.is_empty())
            .ok_or(PreconditionFailed::MissingSid)?;

        if nt.is_some_and(|nt| nt.trim() != NT_UPNP_EVENT) {
            return Err(PreconditionFailed::InvalidNotificationType);
        }
        if nts.is_some_and(|nts| nts.trim() != NTS_PROPCHANGE) {
            return Err(PreconditionFailed::InvalidNotificationType);
        }

        Ok(sid.to_string())
    }
}

/// The NOTIFY endpoint; accepts any path.
fn notify_route(
    router: Arc<EventRouter>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::method()
        .and(warp::path::full())
        .and(warp::header::optional::<String>("sid"))
        .and(warp::header::optional::<String>("nt"))
        .and(warp::header::optional::<String>("nts"))
        .and(warp::header::optional::<String>("seq"))
        .and(warp::body::bytes())
        .and_then(
            move |method: Method,
                  path: warp::path::FullPath,
                  sid: Option<String>,
                  nt: Option<String>,
                  nts: Option<String>,
                  seq: Option<String>,
                  body: bytes::Bytes| {
                let router = router.clone();
                async move {
                    if method.as_str() != "NOTIFY" {
                        tracing::debug!(%method, path = path.as_str(), "rejecting non-NOTIFY request");
                        return Err(warp::reject::custom(MethodNotAllowed));
                    }

                    let sid = CallbackServer::validate_upnp_headers(
                        sid.as_deref(),
                        nt.as_deref(),
                        nts.as_deref(),
                    )
                    .map_err(|reason| {
                        tracing::warn!(path = path.as_str(), %reason, "invalid NOTIFY headers");
                        warp::reject::custom(reason)
                    })?;

                    let seq = seq.as_deref().and_then(|s| s.trim().parse::<u32>().ok());
                    let body = String::from_utf8_lossy(&body).into_owned();

                    tracing::debug!(
                        sid = %sid,
                        seq = ?seq,
                        path = path.as_str(),
                        body_len = body.len(),
                        "incoming NOTIFY"
                    );

                    let payload = NotificationPayload {
                        subscription_id: sid,
                        body,
                        seq,
                    };

                    match router.route_event(payload) {
                        Ok(()) => Ok(warp::reply::with_status("", StatusCode::OK)),
                        Err(DeliveryError::UnknownSubscription(_)) => {
                            Err(warp::reject::custom(PreconditionFailed::UnknownSubscription))
                        }
                        Err(DeliveryError::Expired(_)) => {
                            Err(warp::reject::custom(PreconditionFailed::ExpiredSubscription))
                        }
                    }
                }
            },
        )
}

/// Rejection for methods other than NOTIFY.
#[derive(Debug)]
struct MethodNotAllowed;

impl warp::reject::Reject for MethodNotAllowed {}

/// Rejection answered with 412 Precondition Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreconditionFailed {
    MissingSid,
    InvalidNotificationType,
    UnknownSubscription,
    ExpiredSubscription,
}

impl std::fmt::Display for PreconditionFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Self::MissingSid => "Missing SID header",
            Self::InvalidNotificationType => "Invalid NT or NTS header",
            Self::UnknownSubscription => "Subscription not found",
            Self::ExpiredSubscription => "Subscription expired",
        };
        f.write_str(message)
    }
}

impl warp::reject::Reject for PreconditionFailed {}

/// Handle rejections and convert them to HTTP responses.
async fn handle_rejection(err: Rejection) -> Result<warp::reply::Response, Infallible> {
    let (code, message) = if let Some(reason) = err.find::<PreconditionFailed>() {
        (StatusCode::PRECONDITION_FAILED, reason.to_string())
    } else if err.find::<MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Only NOTIFY is accepted".to_string(),
        )
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else {
        (StatusCode::BAD_REQUEST, "Malformed request".to_string())
    };

    let mut response = warp::reply::with_status(message, code).into_response();
    if code == StatusCode::METHOD_NOT_ALLOWED {
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("NOTIFY"));
    }
    Ok(response)
}
