//! Compile and cmake facade handlers.
//!
//! Each request gets a fresh correlation id, a subscription on the event bus,
//! and a routing decision: queue-routed requests are published and then parked
//! on the correlator; URL-routed requests are forwarded directly and the
//! subscription is released.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{
        header::{ACCEPT, CONTENT_LENGTH},
        HeaderMap, HeaderValue,
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::RouterError;
use crate::forward::ForwardedResponse;
use crate::metrics;
use crate::routing::RoutingTarget;
use crate::state::AppState;

/// Grace period for a fresh subscription to reach the bus before the request
/// is published anywhere a result could come from.
const SUBSCRIBE_SETTLE: Duration = Duration::from_millis(50);

/// Response bodies past this size are logged, not rejected.
const LARGE_BODY_BYTES: usize = 1024 * 1024;

/// Compile via a compiler backend
///
/// POST /api/compiler/:compiler_id/compile
pub async fn compile(
    State(state): State<Arc<AppState>>,
    Path(compiler_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_compilation(state, compiler_id, false, headers, query, body).await
}

/// Run a cmake build via a compiler backend
///
/// POST /api/compiler/:compiler_id/cmake
pub async fn cmake(
    State(state): State<Arc<AppState>>,
    Path(compiler_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_compilation(state, compiler_id, true, headers, query, body).await
}

/// Environment-prefixed compile route.
///
/// POST /:environment/api/compiler/:compiler_id/compile
///
/// The prefix names the environment the load balancer carved the path from;
/// routing itself always follows the process environment.
pub async fn compile_env(
    State(state): State<Arc<AppState>>,
    Path((environment, compiler_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    debug!(prefix = %environment, "environment-prefixed compile request");
    handle_compilation(state, compiler_id, false, headers, query, body).await
}

/// Environment-prefixed cmake route.
///
/// POST /:environment/api/compiler/:compiler_id/cmake
pub async fn cmake_env(
    State(state): State<Arc<AppState>>,
    Path((environment, compiler_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    debug!(prefix = %environment, "environment-prefixed cmake request");
    handle_compilation(state, compiler_id, true, headers, query, body).await
}

async fn handle_compilation(
    state: Arc<AppState>,
    compiler_id: String,
    is_cmake: bool,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
) -> Response {
    let route_kind = if is_cmake { "cmake" } else { "compile" };
    let guid = Uuid::new_v4().to_string();
    info!(
        guid = %guid,
        compiler_id = %compiler_id,
        is_cmake,
        bytes = body.len(),
        "handling compilation request"
    );

    // Subscribe before anything is published so the result cannot outrun the
    // waiter, then give the subscription a moment to reach the bus.
    if let Err(e) = state.correlator.subscribe(&guid) {
        error!(guid = %guid, error = %e, "event bus subscription failed");
        metrics::record_request(route_kind, "subscribe_error");
        return e.into_response();
    }
    tokio::time::sleep(SUBSCRIBE_SETTLE).await;

    let routing = state.routing.lookup(&compiler_id).await;
    debug!(
        guid = %guid,
        compiler_id = %compiler_id,
        routing = ?routing,
        "routing resolved"
    );

    match routing.target {
        RoutingTarget::Url(target_url) => {
            // The response comes back over HTTP, not the bus.
            state.correlator.unsubscribe(&guid);
            match state
                .forwarder
                .forward(&compiler_id, &target_url, body, is_cmake, &headers)
                .await
            {
                Ok(forwarded) => {
                    metrics::record_request(route_kind, "forwarded");
                    emit_forwarded(forwarded)
                }
                Err(e) => {
                    metrics::record_request(route_kind, "forward_error");
                    e.into_response()
                }
            }
        }
        RoutingTarget::Queue(queue_url) => {
            if let Err(e) = state
                .submitter
                .send_to_queue(
                    &guid,
                    &compiler_id,
                    &body,
                    is_cmake,
                    &headers,
                    &query,
                    &queue_url,
                )
                .await
            {
                error!(guid = %guid, error = %e, "queue submission failed");
                state.correlator.unsubscribe(&guid);
                metrics::record_request(route_kind, "publish_error");
                return e.into_response();
            }

            match state
                .correlator
                .wait_for_result(&guid, state.config.timeout)
                .await
            {
                Ok(result) => {
                    metrics::record_request(route_kind, "ok");
                    let accept = headers.get(ACCEPT).and_then(|v| v.to_str().ok());
                    shape(result, accept, &query)
                }
                Err(e @ RouterError::Timeout { .. }) => {
                    warn!(guid = %guid, "compilation timed out");
                    metrics::record_request(route_kind, "timeout");
                    e.into_response()
                }
                Err(e) => {
                    error!(guid = %guid, error = %e, "waiting for result failed");
                    metrics::record_request(route_kind, "error");
                    e.into_response()
                }
            }
        }
    }
}

fn shape(result: serde_json::Value, accept: Option<&str>, query: &HashMap<String, String>) -> Response {
    let filter_ansi = query
        .get("filterAnsi")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    crate::shaping::shape_response(result, accept, filter_ansi)
}

/// Re-emit a backend response: explicit content-length, filtered headers.
fn emit_forwarded(forwarded: ForwardedResponse) -> Response {
    let length = forwarded.body.len();
    metrics::FORWARDED_BODY_BYTES.observe(length as f64);
    if length > LARGE_BODY_BYTES {
        warn!(bytes = length, "forwarded response body exceeds 1 MiB");
    }

    let mut response = Response::new(Body::from(forwarded.body));
    *response.status_mut() = forwarded.status;
    *response.headers_mut() = forwarded.headers;
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(length));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::client::{BusCommand, EventBusHandle};
    use crate::events::ResultCorrelator;
    use crate::forward::HttpForwarder;
    use crate::queue::{QueueConfig, QueueSubmitter};
    use crate::routing::{ActiveColorCache, RoutingConfig, RoutingResolver};
    use crate::state::RouterConfig;
    use crate::stores::memory::{
        MemoryObjectStore, MemoryParameterStore, MemoryQueue, MemoryRoutingStore, OpLog,
    };
    use crate::stores::RoutingRecord;
    use axum::body::to_bytes;
    use axum::routing::post;
    use axum::Router;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    struct Harness {
        state: Arc<AppState>,
        queue: Arc<MemoryQueue>,
        routing_store: Arc<MemoryRoutingStore>,
        messages: mpsc::UnboundedSender<Value>,
        log: OpLog,
    }

    fn harness_with_bus(
        bus: EventBusHandle,
        timeout: Duration,
    ) -> (Harness, Arc<MemoryObjectStore>) {
        let log = OpLog::default();
        let routing_store = Arc::new(MemoryRoutingStore::with_log(log.clone()));
        let params = Arc::new(MemoryParameterStore::new());
        params.insert("/compiler-explorer/prod/active-color", "blue");
        let objects = Arc::new(MemoryObjectStore::with_log(log.clone()));
        let queue = Arc::new(MemoryQueue::with_log(log.clone()));

        let correlator = Arc::new(ResultCorrelator::new(
            bus.clone(),
            objects.clone(),
            "storage.godbolt.org",
            "cache/",
        ));
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        tokio::spawn(correlator.clone().run(message_rx));

        let mut config = RouterConfig::for_environment("prod").unwrap();
        config.timeout = timeout;

        let state = Arc::new(AppState {
            config,
            routing: RoutingResolver::new(
                RoutingConfig::default(),
                "prod",
                routing_store.clone(),
                ActiveColorCache::new(params, Duration::from_secs(30)),
            ),
            submitter: QueueSubmitter::new(
                QueueConfig::default(),
                "prod",
                queue.clone(),
                objects.clone(),
            ),
            correlator,
            bus,
            forwarder: HttpForwarder::new(),
        });

        (
            Harness {
                state,
                queue,
                routing_store,
                messages: message_tx,
                log,
            },
            objects,
        )
    }

    /// Harness whose bus commands are mirrored into the shared op log.
    fn harness(timeout: Duration) -> Harness {
        let (bus, mut commands, _connected) = EventBusHandle::test_pair();
        let (h, _objects) = harness_with_bus(bus, timeout);
        let log = h.log.clone();
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                let entry = match command {
                    BusCommand::Subscribe(t) => format!("bus:subscribe:{t}"),
                    BusCommand::Unsubscribe(t) => format!("bus:unsubscribe:{t}"),
                    BusCommand::Ack(t) => format!("bus:ack:{t}"),
                    BusCommand::Delivered(t) => format!("bus:delivered:{t}"),
                    BusCommand::Close => "bus:close".to_string(),
                };
                log.record(entry);
            }
        });
        h
    }

    /// Feed a result onto the bus as soon as the queue sees a message.
    fn respond_when_published(h: &Harness, result_for: impl Fn(&str) -> Value + Send + 'static) {
        let queue = h.queue.clone();
        let messages = h.messages.clone();
        tokio::spawn(async move {
            loop {
                if let Some(message) = queue.messages().first() {
                    let body: Value = serde_json::from_str(&message.body).unwrap();
                    let guid = body["guid"].as_str().unwrap().to_string();
                    let _ = messages.send(result_for(&guid));
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers
    }

    #[tokio::test]
    async fn queue_path_round_trip() {
        let h = harness(Duration::from_secs(5));
        respond_when_published(&h, |guid| {
            json!({"guid": guid, "code": 0, "asm": [{"text": "ret"}]})
        });

        let response = handle_compilation(
            h.state.clone(),
            "gcc12".to_string(),
            false,
            json_headers(),
            HashMap::new(),
            Bytes::from_static(br#"{"source":"int main(){return 0;}","options":["-O2"]}"#),
        )
        .await;

        assert_eq!(response.status(), 200);
        let body = json_body(response).await;
        assert_eq!(body, json!({"code": 0, "asm": [{"text": "ret"}]}));

        // The published message carried the request body fields.
        let published: Value = serde_json::from_str(&h.queue.messages()[0].body).unwrap();
        assert_eq!(published["source"], "int main(){return 0;}");
        assert_eq!(published["options"], json!(["-O2"]));
        assert_eq!(published["compilerId"], "gcc12");
    }

    #[tokio::test]
    async fn subscribe_reaches_the_bus_before_the_queue() {
        let h = harness(Duration::from_secs(5));
        respond_when_published(&h, |guid| json!({"guid": guid, "code": 0}));

        handle_compilation(
            h.state.clone(),
            "gcc12".to_string(),
            false,
            json_headers(),
            HashMap::new(),
            Bytes::new(),
        )
        .await;

        let entries = h.log.entries();
        let subscribe_at = entries
            .iter()
            .position(|e| e.starts_with("bus:subscribe:"))
            .expect("subscribe was recorded");
        let publish_at = entries
            .iter()
            .position(|e| e.starts_with("sqs:send:"))
            .expect("publish was recorded");
        assert!(
            subscribe_at < publish_at,
            "subscribe must precede publish: {entries:?}"
        );
    }

    #[tokio::test]
    async fn timeout_yields_408_with_guid_in_message() {
        let h = harness(Duration::from_secs(1));

        let response = handle_compilation(
            h.state.clone(),
            "gcc12".to_string(),
            false,
            json_headers(),
            HashMap::new(),
            Bytes::new(),
        )
        .await;

        assert_eq!(response.status(), 408);
        let body = json_body(response).await;
        let message = body["error"].as_str().unwrap();
        assert!(message.starts_with("Compilation timeout: No response received within 1 seconds"));
        assert!(message.contains("for GUID: "));
    }

    #[tokio::test]
    async fn queue_publish_failure_yields_500() {
        let h = harness(Duration::from_secs(5));
        h.queue.set_failing(true);

        let response = handle_compilation(
            h.state.clone(),
            "gcc12".to_string(),
            false,
            json_headers(),
            HashMap::new(),
            Bytes::new(),
        )
        .await;

        assert_eq!(response.status(), 500);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("submit"));
    }

    #[tokio::test]
    async fn subscribe_failure_yields_500() {
        let (bus, commands, _connected) = EventBusHandle::test_pair();
        drop(commands);
        let (h, _objects) = harness_with_bus(bus, Duration::from_secs(5));

        let response = handle_compilation(
            h.state.clone(),
            "gcc12".to_string(),
            false,
            json_headers(),
            HashMap::new(),
            Bytes::new(),
        )
        .await;

        assert_eq!(response.status(), 500);
        assert!(h.queue.messages().is_empty());
    }

    #[tokio::test]
    async fn lightweight_result_is_hydrated_before_shaping() {
        let (bus, mut commands, _connected) = EventBusHandle::test_pair();
        let (h, objects) = harness_with_bus(bus, Duration::from_secs(5));
        tokio::spawn(async move { while commands.recv().await.is_some() {} });
        objects.seed(
            "storage.godbolt.org",
            "cache/abc.json",
            Bytes::from_static(br#"{"code":0,"asm":[{"text":"ret"}]}"#),
        );
        respond_when_published(&h, |guid| json!({"guid": guid, "s3Key": "abc.json"}));

        let response = handle_compilation(
            h.state.clone(),
            "gcc12".to_string(),
            false,
            json_headers(),
            HashMap::new(),
            Bytes::new(),
        )
        .await;

        assert_eq!(response.status(), 200);
        let body = json_body(response).await;
        // Hydrated payload, with both bookkeeping fields stripped.
        assert_eq!(body, json!({"code": 0, "asm": [{"text": "ret"}]}));
    }

    #[tokio::test]
    async fn url_routing_forwards_and_rewrites_framing() {
        let backend = Router::new().route(
            "/custom/path",
            post(|body: Bytes| async move {
                (
                    [
                        ("content-type", "application/json"),
                        ("via", "1.1 upstream"),
                        ("x-backend", "custom"),
                    ],
                    body,
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, backend).await.unwrap();
        });

        let h = harness(Duration::from_secs(5));
        h.routing_store.insert(
            "prod#gcc12",
            RoutingRecord {
                routing_type: Some("url".to_string()),
                target_url: Some(format!("http://{addr}/custom/path/")),
                environment: Some("prod".to_string()),
                ..Default::default()
            },
        );

        let payload = br#"{"code":0}"#;
        let response = handle_compilation(
            h.state.clone(),
            "gcc12".to_string(),
            false,
            json_headers(),
            HashMap::new(),
            Bytes::from_static(payload),
        )
        .await;

        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()[CONTENT_LENGTH],
            payload.len().to_string().as_str()
        );
        assert!(!response.headers().contains_key("via"));
        assert!(!response.headers().contains_key("transfer-encoding"));
        assert_eq!(response.headers()["x-backend"], "custom");

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], payload);

        // Nothing went near the queue, and the stray subscription was released.
        assert!(h.queue.messages().is_empty());
        let entries = h.log.entries();
        assert!(entries.iter().any(|e| e.starts_with("bus:unsubscribe:")));
    }

    #[tokio::test]
    async fn forward_failure_yields_502() {
        let h = harness(Duration::from_secs(5));
        // Nothing listens on this port.
        h.routing_store.insert(
            "prod#gcc12",
            RoutingRecord {
                routing_type: Some("url".to_string()),
                target_url: Some("http://127.0.0.1:9/unreachable".to_string()),
                environment: Some("prod".to_string()),
                ..Default::default()
            },
        );

        let response = handle_compilation(
            h.state.clone(),
            "gcc12".to_string(),
            false,
            json_headers(),
            HashMap::new(),
            Bytes::new(),
        )
        .await;

        assert_eq!(response.status(), 502);
    }

    #[tokio::test]
    async fn text_accept_gets_plain_projection() {
        let h = harness(Duration::from_secs(5));
        respond_when_published(&h, |guid| {
            json!({"guid": guid, "code": 0, "asm": [{"text": "ret"}]})
        });

        let mut headers = json_headers();
        headers.insert(ACCEPT, HeaderValue::from_static("text/plain"));
        let response = handle_compilation(
            h.state.clone(),
            "gcc12".to_string(),
            false,
            headers,
            HashMap::new(),
            Bytes::new(),
        )
        .await;

        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; charset=utf-8"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("Compiler Explorer"));
        assert!(text.contains("ret"));
    }
}
