//! Queue submission.
//!
//! Builds the compilation message for a request, diverts oversized messages to
//! the object store, and publishes to the resolved FIFO queue with the
//! correlation id as deduplication id.

pub mod config;

pub use config::QueueConfig;

use axum::http::HeaderMap;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::RouterError;
use crate::metrics;
use crate::stores::{MessageQueue, ObjectStore};

/// Message group used for every publish; ordering is global per queue.
const MESSAGE_GROUP: &str = "default";

/// Fields every compilation message carries, with their empty defaults.
/// Defaults never overwrite values supplied by the request body.
fn defaulted_fields() -> [(&'static str, Value); 8] {
    [
        ("source", json!("")),
        ("options", json!([])),
        ("filters", json!({})),
        ("backendOptions", json!({})),
        ("tools", json!([])),
        ("libraries", json!([])),
        ("files", json!([])),
        ("executeParameters", json!({})),
    ]
}

/// Publishes compilation requests to the work queue.
pub struct QueueSubmitter {
    config: QueueConfig,
    environment: String,
    queue: Arc<dyn MessageQueue>,
    objects: Arc<dyn ObjectStore>,
}

impl QueueSubmitter {
    pub fn new(
        config: QueueConfig,
        environment: impl Into<String>,
        queue: Arc<dyn MessageQueue>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            environment: environment.into(),
            queue,
            objects,
        }
    }

    /// Build and publish the message for one request.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_to_queue(
        &self,
        guid: &str,
        compiler_id: &str,
        body: &Bytes,
        is_cmake: bool,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
        queue_url: &str,
    ) -> Result<(), RouterError> {
        let parsed = parse_body(body, content_type(headers));
        let message = build_message(guid, compiler_id, is_cmake, headers, query, parsed);
        let serialized = serde_json::to_string(&Value::Object(message))
            .map_err(|e| RouterError::Internal(format!("message serialization failed: {e}")))?;

        let payload = if serialized.len() > self.config.max_message_size {
            self.overflow(guid, compiler_id, serialized).await?
        } else {
            serialized
        };

        debug!(
            guid = %guid,
            compiler_id = %compiler_id,
            queue_url = %queue_url,
            bytes = payload.len(),
            "publishing compilation message"
        );
        self.queue
            .send_message(queue_url, payload, MESSAGE_GROUP, guid)
            .await
            .map_err(|e| RouterError::QueuePublish(e.to_string()))
    }

    /// Park the full message in the object store and return the small
    /// reference envelope to enqueue instead.
    async fn overflow(
        &self,
        guid: &str,
        compiler_id: &str,
        serialized: String,
    ) -> Result<String, RouterError> {
        let original_size = serialized.len();
        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ");
        let key = format!(
            "{}{}/{}/{}.json",
            self.config.overflow_prefix, self.environment, timestamp, guid
        );

        warn!(
            guid = %guid,
            compiler_id = %compiler_id,
            size = original_size,
            limit = self.config.max_message_size,
            key = %key,
            "message exceeds queue limit; overflowing to object store"
        );

        let metadata = HashMap::from([
            ("guid".to_string(), guid.to_string()),
            ("compilerId".to_string(), compiler_id.to_string()),
            ("environment".to_string(), self.environment.clone()),
            ("originalSize".to_string(), original_size.to_string()),
        ]);
        self.objects
            .put_object(
                &self.config.overflow_bucket,
                &key,
                Bytes::from(serialized),
                "application/json",
                metadata,
            )
            .await
            .map_err(|e| RouterError::QueuePublish(format!("overflow upload failed: {e}")))?;
        metrics::QUEUE_OVERFLOWS_TOTAL.inc();

        let envelope = json!({
            "type": "s3-overflow",
            "guid": guid,
            "compilerId": compiler_id,
            "s3Bucket": self.config.overflow_bucket,
            "s3Key": key,
            "originalSize": original_size,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        serde_json::to_string(&envelope)
            .map_err(|e| RouterError::Internal(format!("envelope serialization failed: {e}")))
    }
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
}

/// Interpret the raw request body. JSON bodies become the message overlay;
/// anything else (including JSON that fails to parse) is treated as bare
/// source text. An empty body is an empty overlay.
fn parse_body(body: &Bytes, content_type: Option<String>) -> Map<String, Value> {
    if body.is_empty() {
        return Map::new();
    }

    let looks_json = content_type
        .map(|ct| ct.contains("json"))
        .unwrap_or(false);
    if looks_json {
        if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
            return map;
        }
    }

    let mut map = Map::new();
    map.insert(
        "source".to_string(),
        Value::String(String::from_utf8_lossy(body).into_owned()),
    );
    map
}

/// Assemble the queue message: routing fields first, body overlay second,
/// empty defaults for whatever is still missing.
fn build_message(
    guid: &str,
    compiler_id: &str,
    is_cmake: bool,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    parsed_body: Map<String, Value>,
) -> Map<String, Value> {
    let mut message = Map::new();
    message.insert("guid".to_string(), Value::String(guid.to_string()));
    message.insert(
        "compilerId".to_string(),
        Value::String(compiler_id.to_string()),
    );
    message.insert("isCMake".to_string(), Value::Bool(is_cmake));
    message.insert("headers".to_string(), flatten_headers(headers));
    message.insert(
        "queryStringParameters".to_string(),
        Value::Object(
            query
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        ),
    );

    for (field, value) in parsed_body {
        message.insert(field, value);
    }

    for (field, default) in defaulted_fields() {
        message.entry(field.to_string()).or_insert(default);
    }

    message
}

/// Header map as a JSON object, multi-valued headers joined with `", "`.
fn flatten_headers(headers: &HeaderMap) -> Value {
    let mut out = Map::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        out.insert(name.as_str().to_string(), Value::String(joined));
    }
    Value::Object(out)
}
