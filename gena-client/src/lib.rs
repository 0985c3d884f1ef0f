//! Private GENA client for UPnP event subscriptions
//!
//! This crate issues the outbound half of the UPnP eventing protocol: the
//! `SUBSCRIBE`, renewal `SUBSCRIBE` and `UNSUBSCRIBE` requests a control
//! point sends to a device's event URL. It keeps no subscription state; the
//! caller owns whatever it learns from the device's response headers.

mod error;

pub use error::GenaError;

use reqwest::{Method, StatusCode};
use std::time::Duration;
use url::Url;

/// Notification type sent with a first-time subscription.
pub const NT_UPNP_EVENT: &str = "upnp:event";

/// Notification sub type carried by property change NOTIFY requests.
pub const NTS_PROPCHANGE: &str = "upnp:propchange";

const TIMEOUT_PREFIX: &str = "Second-";

/// Response from a successful SUBSCRIBE (initial or renewal)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionResponse {
    /// Subscription ID returned by the device
    pub sid: String,
    /// Timeout granted by the device (in seconds)
    pub timeout_seconds: u32,
}

/// How the device answered an UNSUBSCRIBE request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// The device acknowledged the cancellation with 200 OK
    Unsubscribed,
    /// The device no longer knows the SID (404 or 412)
    UnknownToDevice,
}

/// A minimal GENA client for UPnP device event endpoints
#[derive(Debug, Clone)]
pub struct GenaClient {
    http: reqwest::Client,
}

impl GenaClient {
    /// Create a client with a 5 second connect timeout and 10 second request timeout
    pub fn new() -> Result<Self, GenaError> {
        Self::with_timeouts(Duration::from_secs(5), Duration::from_secs(10))
    }

    /// Create a client with explicit connect and overall request timeouts
    pub fn with_timeouts(connect: Duration, request: Duration) -> Result<Self, GenaError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect)
            .timeout(request)
            .build()?;
        Ok(Self { http })
    }

    /// Subscribe to events published at `event_url`
    ///
    /// # Arguments
    /// * `event_url` - Full event URL of the device service
    /// * `callback_url` - URL where the device should deliver NOTIFY requests
    /// * `timeout_seconds` - Requested subscription timeout in seconds
    ///
    /// # Returns
    /// The SID and the timeout actually granted by the device
    pub async fn subscribe(
        &self,
        event_url: &str,
        callback_url: &str,
        timeout_seconds: u32,
    ) -> Result<SubscriptionResponse, GenaError> {
        let url = parse_event_url(event_url)?;
        tracing::debug!(%url, callback_url, timeout_seconds, "sending SUBSCRIBE");

        let response = self
            .http
            .request(gena_method("SUBSCRIBE")?, url)
            .header("CALLBACK", format_callback_header(callback_url))
            .header("NT", NT_UPNP_EVENT)
            .header("TIMEOUT", format_timeout_header(timeout_seconds))
            .send()
            .await?;

        Self::read_grant(response, "SUBSCRIBE")
    }

    /// Renew an existing subscription
    ///
    /// The device may hand back a different SID than the one being renewed;
    /// the returned value is authoritative.
    pub async fn renew(
        &self,
        event_url: &str,
        callback_url: &str,
        sid: &str,
        timeout_seconds: u32,
    ) -> Result<SubscriptionResponse, GenaError> {
        let url = parse_event_url(event_url)?;
        tracing::debug!(%url, sid, timeout_seconds, "sending renewal SUBSCRIBE");

        let response = self
            .http
            .request(gena_method("SUBSCRIBE")?, url)
            .header("CALLBACK", format_callback_header(callback_url))
            .header("SID", sid)
            .header("TIMEOUT", format_timeout_header(timeout_seconds))
            .send()
            .await?;

        Self::read_grant(response, "SUBSCRIBE")
    }

    /// Cancel a subscription
    pub async fn unsubscribe(
        &self,
        event_url: &str,
        sid: &str,
    ) -> Result<UnsubscribeOutcome, GenaError> {
        let url = parse_event_url(event_url)?;
        tracing::debug!(%url, sid, "sending UNSUBSCRIBE");

        let response = self
            .http
            .request(gena_method("UNSUBSCRIBE")?, url)
            .header("SID", sid)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(UnsubscribeOutcome::Unsubscribed),
            StatusCode::NOT_FOUND | StatusCode::PRECONDITION_FAILED => {
                Ok(UnsubscribeOutcome::UnknownToDevice)
            }
            status => Err(GenaError::UnexpectedStatus {
                method: "UNSUBSCRIBE",
                status: status.as_u16(),
            }),
        }
    }

    fn read_grant(
        response: reqwest::Response,
        method: &'static str,
    ) -> Result<SubscriptionResponse, GenaError> {
        if response.status() != StatusCode::OK {
            return Err(GenaError::UnexpectedStatus {
                method,
                status: response.status().as_u16(),
            });
        }

        let headers = response.headers();

        let raw_sid = headers.get("SID").ok_or(GenaError::MissingHeader("SID"))?;
        let sid = String::from_utf8_lossy(raw_sid.as_bytes()).trim().to_string();
        if sid.is_empty() {
            return Err(GenaError::MalformedHeader {
                name: "SID",
                value: sid,
            });
        }

        let raw_timeout = headers
            .get("TIMEOUT")
            .ok_or(GenaError::MissingHeader("TIMEOUT"))?;
        let raw_timeout = String::from_utf8_lossy(raw_timeout.as_bytes()).into_owned();
        let timeout_seconds =
            parse_timeout_header(&raw_timeout).ok_or(GenaError::MalformedHeader {
                name: "TIMEOUT",
                value: raw_timeout,
            })?;

        Ok(SubscriptionResponse {
            sid,
            timeout_seconds,
        })
    }
}

/// Format the `CALLBACK` header value, which the protocol wraps in angle brackets.
pub fn format_callback_header(callback_url: &str) -> String {
    format!("<{callback_url}>")
}

/// Format a `TIMEOUT` header value such as `Second-1800`.
pub fn format_timeout_header(timeout_seconds: u32) -> String {
    format!("{TIMEOUT_PREFIX}{timeout_seconds}")
}

/// Parse a `TIMEOUT` header value of the form `Second-<n>`.
///
/// The prefix is matched case-insensitively. `Second-infinite` and anything
/// without a numeric suffix yield `None`.
pub fn parse_timeout_header(value: &str) -> Option<u32> {
    let value = value.trim();
    let prefix = value.get(..TIMEOUT_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(TIMEOUT_PREFIX) {
        return None;
    }
    value[TIMEOUT_PREFIX.len()..].parse::<u32>().ok()
}

fn parse_event_url(event_url: &str) -> Result<Url, GenaError> {
    let url = Url::parse(event_url).map_err(|e| GenaError::InvalidUrl {
        url: event_url.to_string(),
        reason: e.to_string(),
    })?;

    if url.scheme() != "http" {
        return Err(GenaError::InvalidUrl {
            url: event_url.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    Ok(url)
}

fn gena_method(name: &'static str) -> Result<Method, GenaError> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| GenaError::InvalidRequest(format!("method {name}: {e}")))
}
