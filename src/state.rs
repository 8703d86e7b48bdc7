//! Application state for the compile router.

use std::sync::Arc;
use std::time::Duration;

use crate::events::{EventBusHandle, ResultCorrelator};
use crate::forward::HttpForwarder;
use crate::queue::QueueSubmitter;
use crate::routing::RoutingResolver;

/// Environments the router may be deployed to.
pub const ENVIRONMENTS: &[&str] = &["prod", "beta", "staging"];

/// Application state shared across all handlers
pub struct AppState {
    /// Top-level configuration
    pub config: RouterConfig,

    /// Per-compiler routing resolution
    pub routing: RoutingResolver,

    /// Queue submission
    pub submitter: QueueSubmitter,

    /// Result correlation
    pub correlator: Arc<ResultCorrelator>,

    /// Event-bus handle, for health reporting and shutdown
    pub bus: EventBusHandle,

    /// Direct backend forwarding
    pub forwarder: HttpForwarder,
}

impl AppState {
    /// Drop all cached routing and color state. Test hook.
    pub fn reset_caches(&self) {
        self.routing.reset();
    }
}

/// Top-level router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deployment environment (prod, beta, or staging)
    pub environment: String,

    /// Port to listen on
    pub port: u16,

    /// How long a request waits for its correlated result
    pub timeout: Duration,
}

impl RouterConfig {
    /// Create config from environment variables.
    ///
    /// Environment variables:
    /// - `CE_ENVIRONMENT`: Deployment environment, required (prod, beta, staging)
    /// - `CE_PORT`: Listen port (default: 10240)
    /// - `CE_COMPILATION_TIMEOUT`: Result wait in seconds (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("CE_ENVIRONMENT").map_err(|_| ConfigError::MissingEnvironment)?;
        let mut config = Self::for_environment(environment)?;
        if let Some(port) = std::env::var("CE_PORT").ok().and_then(|s| s.parse().ok()) {
            config.port = port;
        }
        if let Some(secs) = std::env::var("CE_COMPILATION_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Defaults for a validated environment name.
    pub fn for_environment(environment: impl Into<String>) -> Result<Self, ConfigError> {
        let environment = environment.into();
        if !ENVIRONMENTS.contains(&environment.as_str()) {
            return Err(ConfigError::UnknownEnvironment(environment));
        }
        Ok(Self {
            environment,
            port: 10240,
            timeout: Duration::from_secs(60),
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("CE_ENVIRONMENT must be set (prod, beta, or staging)")]
    MissingEnvironment,

    #[error("unknown environment {0:?} (expected prod, beta, or staging)")]
    UnknownEnvironment(String),
}
