//! Compile Router Library
//!
//! Request-routing front door for a multi-tenant compilation service. Clients
//! POST source and build options for a compiler; the router picks that
//! compiler's backend (a FIFO work queue with results correlated back over a
//! shared event bus, or a direct HTTP backend) and answers synchronously.

use axum::{
    extract::DefaultBodyLimit,
    http::{header, Method, StatusCode},
    routing::{get, options, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

pub mod error;
pub mod events;
pub mod forward;
pub mod metrics;
pub mod queue;
pub mod routes;
pub mod routing;
pub mod shaping;
pub mod state;
pub mod stores;

pub use state::{AppState, RouterConfig};

use events::{EventBusClient, EventBusConfig, ResultCorrelator};
use forward::HttpForwarder;
use queue::{QueueConfig, QueueSubmitter};
use routing::{ActiveColorCache, RoutingConfig, RoutingResolver};
use stores::memory::{MemoryObjectStore, MemoryParameterStore, MemoryQueue, MemoryRoutingStore};
use stores::{MessageQueue, ObjectStore, ParameterStore, RoutingStore};

/// Largest request body accepted on the compile routes.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Handles to the external services, injected at startup.
pub struct ServiceDeps {
    pub routing_store: Arc<dyn RoutingStore>,
    pub parameter_store: Arc<dyn ParameterStore>,
    pub object_store: Arc<dyn ObjectStore>,
    pub message_queue: Arc<dyn MessageQueue>,
}

impl ServiceDeps {
    /// In-memory stand-ins for every external service.
    pub fn in_memory() -> Self {
        Self {
            routing_store: Arc::new(MemoryRoutingStore::new()),
            parameter_store: Arc::new(MemoryParameterStore::new()),
            object_store: Arc::new(MemoryObjectStore::new()),
            message_queue: Arc::new(MemoryQueue::new()),
        }
    }
}

/// Run the compile router server.
///
/// Starts the event-bus client and correlator, then serves HTTP until a
/// shutdown signal arrives. In-flight waiters are not drained on shutdown.
pub async fn run_server(config: RouterConfig, deps: ServiceDeps) -> anyhow::Result<()> {
    if let Err(e) = metrics::register_metrics() {
        warn!("Failed to register Prometheus metrics: {}", e);
    }

    let bus_config = EventBusConfig::from_env(&config.environment);
    let routing_config = RoutingConfig::from_env();
    let queue_config = QueueConfig::from_env();

    info!(
        environment = %config.environment,
        port = config.port,
        websocket_url = %bus_config.websocket_url,
        timeout_secs = config.timeout.as_secs(),
        "Starting compile router v{}",
        env!("CARGO_PKG_VERSION")
    );

    let (bus_client, bus, bus_messages) = EventBusClient::new(bus_config);
    tokio::spawn(bus_client.run());

    let correlator = Arc::new(ResultCorrelator::new(
        bus.clone(),
        deps.object_store.clone(),
        queue_config.results_bucket.clone(),
        queue_config.results_prefix.clone(),
    ));
    tokio::spawn(correlator.clone().run(bus_messages));

    let color = ActiveColorCache::new(deps.parameter_store.clone(), routing_config.color_ttl);
    let state = Arc::new(AppState {
        routing: RoutingResolver::new(
            routing_config,
            config.environment.clone(),
            deps.routing_store.clone(),
            color,
        ),
        submitter: QueueSubmitter::new(
            queue_config,
            config.environment.clone(),
            deps.message_queue.clone(),
            deps.object_store.clone(),
        ),
        correlator,
        bus: bus.clone(),
        forwarder: HttpForwarder::new(),
        config: config.clone(),
    });

    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Compile router listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Suppresses reconnect and drops any stray subscriptions server-side.
    bus.close();
    info!("Shutdown complete");
    Ok(())
}

/// Build the axum router with the full middleware stack.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION]);

    // OPTIONS answers 200 on every path. The CORS layer only short-circuits
    // OPTIONS requests that carry preflight headers, so each route also takes
    // OPTIONS directly and a wildcard covers everything unrouted.
    Router::new()
        .route(
            "/healthcheck",
            get(routes::healthcheck).options(options_ok),
        )
        .route("/metrics", get(routes::metrics).options(options_ok))
        .route(
            "/api/compiler/:compiler_id/compile",
            post(routes::compile).options(options_ok),
        )
        .route(
            "/api/compiler/:compiler_id/cmake",
            post(routes::cmake).options(options_ok),
        )
        .route(
            "/:environment/api/compiler/:compiler_id/compile",
            post(routes::compile_env).options(options_ok),
        )
        .route(
            "/:environment/api/compiler/:compiler_id/cmake",
            post(routes::cmake_env).options(options_ok),
        )
        .route("/", options(options_ok).fallback(not_found))
        .route("/*path", options(options_ok).fallback(not_found))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Empty 200 for any OPTIONS request, preflight or not.
async fn options_ok() -> StatusCode {
    StatusCode::OK
}

/// Non-OPTIONS requests to unrouted paths keep their 404.
async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::client::EventBusHandle;
    use crate::events::ResultCorrelator;
    use crate::stores::memory::{
        MemoryObjectStore, MemoryParameterStore, MemoryQueue, MemoryRoutingStore,
    };
    use std::time::Duration;

    fn test_state() -> Arc<AppState> {
        let (bus, mut commands, _connected) = EventBusHandle::test_pair();
        tokio::spawn(async move { while commands.recv().await.is_some() {} });

        let objects = Arc::new(MemoryObjectStore::new());
        let correlator = Arc::new(ResultCorrelator::new(
            bus.clone(),
            objects.clone(),
            "storage.godbolt.org",
            "cache/",
        ));
        Arc::new(AppState {
            config: RouterConfig::for_environment("prod").unwrap(),
            routing: RoutingResolver::new(
                RoutingConfig::default(),
                "prod",
                Arc::new(MemoryRoutingStore::new()),
                ActiveColorCache::new(
                    Arc::new(MemoryParameterStore::new()),
                    Duration::from_secs(30),
                ),
            ),
            submitter: QueueSubmitter::new(
                QueueConfig::default(),
                "prod",
                Arc::new(MemoryQueue::new()),
                objects,
            ),
            correlator,
            bus,
            forwarder: HttpForwarder::new(),
        })
    }

    async fn serve(state: Arc<AppState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn bare_options_returns_200_with_no_body_on_any_path() {
        let base = serve(test_state()).await;
        let client = reqwest::Client::new();

        // No Access-Control-Request-Method header anywhere here, so none of
        // these are CORS preflights.
        for path in [
            "/",
            "/healthcheck",
            "/metrics",
            "/api/compiler/gcc12/compile",
            "/api/compiler/gcc12/cmake",
            "/beta/api/compiler/gcc12/compile",
            "/no/such/path",
        ] {
            let response = client
                .request(reqwest::Method::OPTIONS, format!("{base}{path}"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 200, "OPTIONS {path}");
            assert!(
                response.bytes().await.unwrap().is_empty(),
                "OPTIONS {path} should have an empty body"
            );
        }
    }

    #[tokio::test]
    async fn preflight_options_still_returns_200() {
        let base = serve(test_state()).await;
        let client = reqwest::Client::new();

        let response = client
            .request(
                reqwest::Method::OPTIONS,
                format!("{base}/api/compiler/gcc12/compile"),
            )
            .header("origin", "https://godbolt.org")
            .header("access-control-request-method", "POST")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "*"
        );
    }

    #[tokio::test]
    async fn unrouted_paths_still_404_for_other_methods() {
        let base = serve(test_state()).await;
        let response = reqwest::get(format!("{base}/no/such/path")).await.unwrap();
        assert_eq!(response.status(), 404);
        let response = reqwest::get(format!("{base}/")).await.unwrap();
        assert_eq!(response.status(), 404);
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
