//! Generic UPnP callback server for receiving event notifications.
//!
//! This crate provides a lightweight HTTP server for handling UPnP NOTIFY
//! requests. It knows the GENA header rules but nothing about which
//! subscriptions exist: correlation is delegated to a [`NotificationSink`].
//!
//! # Overview
//!
//! - [`CallbackServer`]: HTTP server bound to a local address that accepts
//!   NOTIFY requests on any path and answers every other method with 405.
//! - [`EventRouter`]: hands accepted notifications to the sink and keeps
//!   routed/rejected counters.
//! - [`NotificationPayload`]: subscription ID, raw body and sequence number of
//!   one NOTIFY request.
//!
//! # Status codes
//!
//! | Situation | Status |
//! |---|---|
//! | Sink accepted the notification | 200 |
//! | Missing `SID`, bad `NT`/`NTS`, unknown or expired subscription | 412 |
//! | Method other than NOTIFY | 405 |
//!
//! # Private Workspace Crate
//!
//! This crate is intended for internal use within the workspace and is not
//! published to crates.io.

pub mod router;
mod server;

pub use router::{DeliveryError, EventRouter, NotificationPayload, NotificationSink, RouterStats};
pub use server::{CallbackError, CallbackServer};
