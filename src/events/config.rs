//! Configuration for the event-bus client.

use std::time::Duration;

/// Configuration for the event-bus connection.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Websocket URL of the event bus.
    pub websocket_url: String,

    /// Protocol-level ping cadence while connected.
    pub ping_interval: Duration,

    /// Fixed delay between reconnect attempts.
    pub reconnect_interval: Duration,

    /// Reconnect attempts before the client parks itself disconnected.
    pub max_reconnect_attempts: u32,

    /// Age at which a pending subscription is dropped instead of replayed.
    pub subscription_expiry: Duration,
}

impl EventBusConfig {
    /// Defaults for the given environment.
    pub fn default_for(environment: &str) -> Self {
        Self {
            websocket_url: format!("wss://events.godbolt.org/{environment}"),
            ping_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            subscription_expiry: Duration::from_secs(60),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CE_WEBSOCKET_URL`: Event bus URL (default: derived from the environment)
    pub fn from_env(environment: &str) -> Self {
        let mut config = Self::default_for(environment);
        if let Ok(url) = std::env::var("CE_WEBSOCKET_URL") {
            if !url.is_empty() {
                config.websocket_url = url;
            }
        }
        config
    }
}
