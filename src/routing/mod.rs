//! Per-compiler routing resolution.
//!
//! Decides, for each compiler id, whether a request goes to a direct HTTP
//! backend or to a colored compilation queue. Lookups hit the external routing
//! table (composite `{environment}#{compilerId}` key first, bare legacy key
//! second) and are cached process-wide; every failure path degrades to the
//! environment's default colored queue so a request is never refused here.

pub mod color;
pub mod config;

pub use color::{ActiveColorCache, DEFAULT_COLOR};
pub use config::RoutingConfig;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::stores::{RoutingRecord, RoutingStore, StoreError};

/// Where a request should be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingTarget {
    /// Forward directly to this base URL.
    Url(String),
    /// Publish to this queue URL.
    Queue(String),
}

/// A resolved routing decision.
#[derive(Debug, Clone)]
pub struct RoutingInfo {
    pub target: RoutingTarget,
    pub environment: String,
}

impl RoutingInfo {
    pub fn is_url(&self) -> bool {
        matches!(self.target, RoutingTarget::Url(_))
    }
}

/// Resolves and caches per-compiler routing.
pub struct RoutingResolver {
    config: RoutingConfig,
    environment: String,
    store: Arc<dyn RoutingStore>,
    color: ActiveColorCache,
    cache: Mutex<HashMap<String, RoutingInfo>>,
}

impl RoutingResolver {
    pub fn new(
        config: RoutingConfig,
        environment: impl Into<String>,
        store: Arc<dyn RoutingStore>,
        color: ActiveColorCache,
    ) -> Self {
        Self {
            config,
            environment: environment.into(),
            store,
            color,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Look up routing for `compiler_id`. Infallible: store trouble falls
    /// back to the default colored queue.
    pub async fn lookup(&self, compiler_id: &str) -> RoutingInfo {
        let cache_key = self.composite_key(compiler_id);
        if let Some(hit) = self
            .cache
            .lock()
            .expect("routing cache poisoned")
            .get(&cache_key)
        {
            debug!(compiler_id = %compiler_id, "routing cache hit");
            return hit.clone();
        }

        match self.resolve(compiler_id).await {
            Ok(info) => {
                self.cache
                    .lock()
                    .expect("routing cache poisoned")
                    .insert(cache_key, info.clone());
                info
            }
            Err(e) => {
                // Transient store trouble: serve the fallback but leave the
                // cache empty so the next request retries the table.
                warn!(
                    compiler_id = %compiler_id,
                    error = %e,
                    "routing lookup failed; falling back to default colored queue"
                );
                self.default_queue_routing("unknown").await
            }
        }
    }

    /// Drop all cached routing and color state. Test hook.
    pub fn reset(&self) {
        self.cache.lock().expect("routing cache poisoned").clear();
        self.color.reset();
    }

    async fn resolve(&self, compiler_id: &str) -> Result<RoutingInfo, StoreError> {
        let composite = self.composite_key(compiler_id);
        let record = match self
            .store
            .get_routing(&self.config.table_name, &composite)
            .await?
        {
            Some(record) => Some(record),
            None => {
                self.store
                    .get_routing(&self.config.table_name, compiler_id)
                    .await?
            }
        };

        let Some(record) = record else {
            debug!(compiler_id = %compiler_id, "no routing entry; using default colored queue");
            return Ok(self.default_queue_routing("unknown").await);
        };

        Ok(self.routing_from_record(record).await)
    }

    async fn routing_from_record(&self, record: RoutingRecord) -> RoutingInfo {
        let environment = record
            .environment
            .clone()
            .unwrap_or_else(|| self.environment.clone());

        if record.routing_type.as_deref() == Some("url") {
            if let Some(target_url) = record.target_url.filter(|url| !url.is_empty()) {
                return RoutingInfo {
                    target: RoutingTarget::Url(target_url),
                    environment,
                };
            }
        }

        // Queue routing, explicitly or by omission.
        match record.queue_name.filter(|name| !name.is_empty()) {
            Some(queue_name) => {
                let active = self.color.get(&self.environment).await;
                RoutingInfo {
                    target: RoutingTarget::Queue(self.queue_url_from_name(&queue_name, &active)),
                    environment,
                }
            }
            None => self.default_queue_routing(&environment).await,
        }
    }

    async fn default_queue_routing(&self, environment: &str) -> RoutingInfo {
        let active = self.color.get(&self.environment).await;
        let url = format!(
            "{}/{}-compilation-queue-{}.fifo",
            self.config.sqs_base_url, self.environment, active
        );
        RoutingInfo {
            target: RoutingTarget::Queue(url),
            environment: environment.to_string(),
        }
    }

    /// Build a full queue URL from a table-supplied name: append the active
    /// color unless the name already carries one, and ensure `.fifo`.
    fn queue_url_from_name(&self, queue_name: &str, active_color: &str) -> String {
        let mut name = queue_name
            .strip_suffix(".fifo")
            .unwrap_or(queue_name)
            .to_string();
        if !name.ends_with("-blue") && !name.ends_with("-green") {
            name = format!("{name}-{active_color}");
        }
        format!("{}/{}.fifo", self.config.sqs_base_url, name)
    }

    fn composite_key(&self, compiler_id: &str) -> String {
        format!("{}#{}", self.environment, compiler_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::{MemoryParameterStore, MemoryRoutingStore, OpLog};
    use std::time::Duration;

    struct Fixture {
        resolver: RoutingResolver,
        store: Arc<MemoryRoutingStore>,
        params: Arc<MemoryParameterStore>,
        log: OpLog,
    }

    fn fixture() -> Fixture {
        let log = OpLog::default();
        let store = Arc::new(MemoryRoutingStore::with_log(log.clone()));
        let params = Arc::new(MemoryParameterStore::new());
        params.insert("/compiler-explorer/prod/active-color", "blue");
        let color = ActiveColorCache::new(params.clone(), Duration::from_secs(30));
        let resolver = RoutingResolver::new(
            RoutingConfig::default(),
            "prod",
            store.clone(),
            color,
        );
        Fixture {
            resolver,
            store,
            params,
            log,
        }
    }

    fn url_record(target: &str) -> RoutingRecord {
        RoutingRecord {
            routing_type: Some("url".to_string()),
            target_url: Some(target.to_string()),
            queue_name: None,
            environment: Some("prod".to_string()),
        }
    }

    #[tokio::test]
    async fn resolves_url_routing() {
        let f = fixture();
        f.store
            .insert("prod#gcc12", url_record("https://backend.example"));

        let info = f.resolver.lookup("gcc12").await;
        assert_eq!(
            info.target,
            RoutingTarget::Url("https://backend.example".to_string())
        );
        assert_eq!(info.environment, "prod");
    }

    #[tokio::test]
    async fn url_routing_without_target_degrades_to_queue() {
        let f = fixture();
        f.store.insert("prod#gcc12", url_record(""));

        let info = f.resolver.lookup("gcc12").await;
        assert_eq!(
            info.target,
            RoutingTarget::Queue(
                "https://sqs.us-east-1.amazonaws.com/compiler-explorer/prod-compilation-queue-blue.fifo"
                    .to_string()
            )
        );
    }

    #[tokio::test]
    async fn queue_name_gets_color_and_fifo_suffix() {
        let f = fixture();
        f.params
            .insert("/compiler-explorer/prod/active-color", "green");
        f.store.insert(
            "prod#rustc",
            RoutingRecord {
                routing_type: Some("queue".to_string()),
                queue_name: Some("rust-builds".to_string()),
                environment: Some("prod".to_string()),
                ..Default::default()
            },
        );

        let info = f.resolver.lookup("rustc").await;
        assert_eq!(
            info.target,
            RoutingTarget::Queue(
                "https://sqs.us-east-1.amazonaws.com/compiler-explorer/rust-builds-green.fifo"
                    .to_string()
            )
        );
    }

    #[tokio::test]
    async fn explicitly_colored_queue_name_is_kept() {
        let f = fixture();
        f.store.insert(
            "prod#clang",
            RoutingRecord {
                routing_type: Some("queue".to_string()),
                queue_name: Some("special-blue.fifo".to_string()),
                environment: Some("prod".to_string()),
                ..Default::default()
            },
        );

        let info = f.resolver.lookup("clang").await;
        assert_eq!(
            info.target,
            RoutingTarget::Queue(
                "https://sqs.us-east-1.amazonaws.com/compiler-explorer/special-blue.fifo"
                    .to_string()
            )
        );
    }

    #[tokio::test]
    async fn falls_back_to_legacy_bare_key() {
        let f = fixture();
        f.store
            .insert("gcc-old", url_record("https://legacy.example"));

        let info = f.resolver.lookup("gcc-old").await;
        assert_eq!(
            info.target,
            RoutingTarget::Url("https://legacy.example".to_string())
        );
        // Composite first, then legacy.
        let gets: Vec<String> = f
            .log
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("routing:get"))
            .collect();
        assert_eq!(
            gets,
            vec![
                "routing:get:CompilerRouting:prod#gcc-old",
                "routing:get:CompilerRouting:gcc-old"
            ]
        );
    }

    #[tokio::test]
    async fn missing_entry_uses_default_queue_with_unknown_environment() {
        let f = fixture();
        let info = f.resolver.lookup("mystery").await;
        assert_eq!(info.environment, "unknown");
        assert_eq!(
            info.target,
            RoutingTarget::Queue(
                "https://sqs.us-east-1.amazonaws.com/compiler-explorer/prod-compilation-queue-blue.fifo"
                    .to_string()
            )
        );
    }

    #[tokio::test]
    async fn cache_hit_skips_the_store() {
        let f = fixture();
        f.store
            .insert("prod#gcc12", url_record("https://backend.example"));

        f.resolver.lookup("gcc12").await;
        let reads_after_first = f.log.entries().len();
        f.resolver.lookup("gcc12").await;
        assert_eq!(f.log.entries().len(), reads_after_first);

        f.resolver.reset();
        f.resolver.lookup("gcc12").await;
        assert!(f.log.entries().len() > reads_after_first);
    }

    #[tokio::test]
    async fn store_failure_is_not_cached() {
        let f = fixture();
        f.store
            .insert("prod#gcc12", url_record("https://backend.example"));
        f.store.set_failing(true);

        let info = f.resolver.lookup("gcc12").await;
        assert!(!info.is_url());
        assert_eq!(info.environment, "unknown");

        f.store.set_failing(false);
        let info = f.resolver.lookup("gcc12").await;
        assert_eq!(
            info.target,
            RoutingTarget::Url("https://backend.example".to_string())
        );
    }
}
