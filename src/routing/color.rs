//! Active blue/green color resolution.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::stores::ParameterStore;

/// Color assumed when the parameter store cannot answer.
pub const DEFAULT_COLOR: &str = "blue";

/// Process-wide cache of the currently-active deployment color.
///
/// Lookup failures return [`DEFAULT_COLOR`] without poisoning the cache, so
/// the next call retries the parameter store.
pub struct ActiveColorCache {
    params: Arc<dyn ParameterStore>,
    ttl: Duration,
    cached: Mutex<Option<(String, Instant)>>,
}

impl ActiveColorCache {
    pub fn new(params: Arc<dyn ParameterStore>, ttl: Duration) -> Self {
        Self {
            params,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// The active color for `environment`, cached for the configured TTL.
    pub async fn get(&self, environment: &str) -> String {
        let now = Instant::now();
        {
            let cached = self.cached.lock().expect("color cache poisoned");
            if let Some((color, stamped)) = cached.as_ref() {
                if now.duration_since(*stamped) < self.ttl {
                    return color.clone();
                }
            }
        }

        let name = format!("/compiler-explorer/{environment}/active-color");
        match self.params.get_parameter(&name).await {
            Ok(Some(color)) if !color.is_empty() => {
                debug!(environment = %environment, color = %color, "resolved active color");
                *self.cached.lock().expect("color cache poisoned") = Some((color.clone(), now));
                color
            }
            Ok(_) => {
                warn!(parameter = %name, "active color parameter missing; assuming blue");
                DEFAULT_COLOR.to_string()
            }
            Err(e) => {
                warn!(parameter = %name, error = %e, "active color lookup failed; assuming blue");
                DEFAULT_COLOR.to_string()
            }
        }
    }

    /// Forget the cached color. Test hook.
    pub fn reset(&self) {
        *self.cached.lock().expect("color cache poisoned") = None;
    }
}
