//! Configuration types for the upnp-eventing crate
//!
//! This module defines the settings that control outbound request timeouts,
//! the renewal policy and the lifecycle of the subscription server.

use std::time::Duration;

use crate::error::SubscriptionError;

/// Configuration for the SubscriptionServer
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Connect timeout for outbound SUBSCRIBE/UNSUBSCRIBE requests
    /// Default: 5 seconds
    pub connect_timeout: Duration,

    /// Overall timeout for one outbound request
    /// Default: 10 seconds
    pub request_timeout: Duration,

    /// Renewal margin as a percentage of the granted timeout
    /// Default: 10
    pub renewal_margin_percent: u8,

    /// Lower bound for the renewal margin
    /// Default: 5 seconds
    pub min_renewal_margin: Duration,

    /// Renewal attempts before a subscription is expired
    /// Default: 3
    pub max_renewal_attempts: u32,

    /// Base delay for exponential backoff between renewal attempts
    /// Default: 2 seconds
    pub retry_backoff_base: Duration,

    /// How often the reaper removes expired, non-renewed subscriptions
    /// Default: 30 seconds
    pub expiry_sweep_interval: Duration,

    /// Capacity of the lifecycle event channel
    /// Default: 100
    pub event_buffer_size: usize,

    /// How long `subscribe` waits for the listener to come up
    /// Default: 5 seconds
    pub startup_timeout: Duration,

    /// Upper bound for the best-effort UNSUBSCRIBE sweep in `stop`
    /// Default: 5 seconds
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            renewal_margin_percent: 10,
            min_renewal_margin: Duration::from_secs(5),
            max_renewal_attempts: 3,
            retry_backoff_base: Duration::from_secs(2),
            expiry_sweep_interval: Duration::from_secs(30),
            event_buffer_size: 100,
            startup_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Create a new ServerConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ServerConfig for devices granting short timeouts on a LAN
    pub fn fast_renewal() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(4),
            renewal_margin_percent: 20,
            min_renewal_margin: Duration::from_secs(1),
            retry_backoff_base: Duration::from_millis(500),
            expiry_sweep_interval: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), SubscriptionError> {
        if self.max_renewal_attempts == 0 {
            return Err(SubscriptionError::Configuration(
                "Max renewal attempts must be greater than 0".to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(SubscriptionError::Configuration(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.renewal_margin_percent > 100 {
            return Err(SubscriptionError::Configuration(
                "Renewal margin percent must be at most 100".to_string(),
            ));
        }

        if self.expiry_sweep_interval == Duration::ZERO {
            return Err(SubscriptionError::Configuration(
                "Expiry sweep interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Margin before expiry at which a renewal is issued for `timeout_seconds`.
    ///
    /// The larger of the percentage margin and `min_renewal_margin`, never
    /// more than the timeout itself.
    pub fn renewal_margin(&self, timeout_seconds: u32) -> Duration {
        let timeout = Duration::from_secs(u64::from(timeout_seconds));
        let proportional = timeout * u32::from(self.renewal_margin_percent) / 100;
        proportional.max(self.min_renewal_margin).min(timeout)
    }

    /// Delay before renewal attempt `attempt` (1-based).
    ///
    /// - Attempt 1: Immediate
    /// - Attempt 2: `retry_backoff_base * 2^0`
    /// - Attempt 3: `retry_backoff_base * 2^1`
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt - 2);
        self.retry_backoff_base.saturating_mul(multiplier)
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    pub fn with_renewal_margin(mut self, percent: u8, minimum: Duration) -> Self {
        self.renewal_margin_percent = percent;
        self.min_renewal_margin = minimum;
        self
    }

    pub fn with_retry_policy(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
        self.max_renewal_attempts = max_attempts;
        self.retry_backoff_base = backoff_base;
        self
    }

    pub fn with_expiry_sweep_interval(mut self, interval: Duration) -> Self {
        self.expiry_sweep_interval = interval;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
