//! Result correlation.
//!
//! Every queue-routed request parks on a correlation id; the correlator owns
//! the waiter map and wakes the right request when the event bus delivers a
//! result with a matching `guid`. Lightweight results that only carry an
//! `s3Key` are hydrated from the object store before completion.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::client::EventBusHandle;
use crate::error::RouterError;
use crate::metrics;
use crate::stores::ObjectStore;

/// Result fields whose presence marks a message as a full payload rather than
/// a lightweight object-store pointer.
const PAYLOAD_FIELDS: &[&str] = &["asm", "stdout", "stderr", "code", "output", "result"];

/// Maps in-flight correlation ids to the requests waiting on them.
pub struct ResultCorrelator {
    bus: EventBusHandle,
    objects: Arc<dyn ObjectStore>,
    results_bucket: String,
    results_prefix: String,
    waiters: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl ResultCorrelator {
    pub fn new(
        bus: EventBusHandle,
        objects: Arc<dyn ObjectStore>,
        results_bucket: impl Into<String>,
        results_prefix: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            objects,
            results_bucket: results_bucket.into(),
            results_prefix: results_prefix.into(),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe the correlation id on the event bus. No waiter is armed yet.
    pub fn subscribe(&self, guid: &str) -> Result<(), RouterError> {
        self.bus
            .subscribe(guid)
            .map_err(|e| RouterError::Subscribe(e.to_string()))
    }

    /// Drop any waiter for `guid` and release the bus subscription.
    pub fn unsubscribe(&self, guid: &str) {
        self.waiters
            .lock()
            .expect("waiter map poisoned")
            .remove(guid);
        let _ = self.bus.unsubscribe(guid);
    }

    /// Arm a waiter and park until the correlated result arrives or the
    /// deadline passes. At most one waiter may exist per correlation id.
    pub async fn wait_for_result(
        &self,
        guid: &str,
        timeout: Duration,
    ) -> Result<Value, RouterError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().expect("waiter map poisoned");
            if waiters.contains_key(guid) {
                return Err(RouterError::Internal(format!(
                    "a waiter already exists for GUID: {guid}"
                )));
            }
            waiters.insert(guid.to_string(), tx);
        }
        metrics::INFLIGHT_WAITERS.inc();

        let outcome = tokio::time::timeout(timeout, rx).await;
        metrics::INFLIGHT_WAITERS.dec();

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(RouterError::Internal(
                "result channel closed before completion".to_string(),
            )),
            Err(_) => {
                self.waiters
                    .lock()
                    .expect("waiter map poisoned")
                    .remove(guid);
                let _ = self.bus.unsubscribe(guid);
                Err(RouterError::Timeout {
                    guid: guid.to_string(),
                    timeout: timeout.as_secs(),
                })
            }
        }
    }

    /// Consume the decoded-frame stream from the event-bus client.
    pub async fn run(self: Arc<Self>, mut messages: mpsc::UnboundedReceiver<Value>) {
        while let Some(message) = messages.recv().await {
            self.clone().dispatch(message);
        }
        debug!("event bus message stream closed; correlator stopping");
    }

    /// Match one bus message against the waiter map.
    fn dispatch(self: Arc<Self>, message: Value) {
        let Some(guid) = message.get("guid").and_then(Value::as_str) else {
            trace!("ignoring bus message without guid");
            return;
        };
        let guid = guid.to_string();

        // Detach the waiter first so duplicate deliveries fall through here.
        let Some(tx) = self
            .waiters
            .lock()
            .expect("waiter map poisoned")
            .remove(&guid)
        else {
            debug!(guid = %guid, "no waiter for result; ignoring");
            return;
        };

        // Hydration may hit the object store; finish on a separate task so a
        // slow fetch never stalls delivery of other results.
        tokio::spawn(async move {
            if self.bus.is_connected() {
                let _ = self.bus.ack(&guid);
            }
            let _ = self.bus.delivered(&guid);

            let result = self.resolve_result(&guid, message).await;

            let _ = self.bus.unsubscribe(&guid);
            if tx.send(result).is_err() {
                debug!(guid = %guid, "waiter went away before completion");
            }
        });
    }

    /// Hydrate a lightweight result from the object store; full payloads pass
    /// through untouched.
    async fn resolve_result(&self, guid: &str, message: Value) -> Value {
        let Some(s3_key) = message.get("s3Key").and_then(Value::as_str) else {
            return message;
        };
        if PAYLOAD_FIELDS.iter().any(|field| message.get(field).is_some()) {
            return message;
        }

        let key = format!("{}{}", self.results_prefix, s3_key);
        let fetched = match self.objects.get_object(&self.results_bucket, &key).await {
            Ok(Some(body)) => serde_json::from_slice::<Value>(&body).ok(),
            Ok(None) => {
                warn!(guid = %guid, key = %key, "overflowed result object missing");
                None
            }
            Err(e) => {
                warn!(guid = %guid, key = %key, error = %e, "overflowed result fetch failed");
                None
            }
        };

        match fetched {
            Some(Value::Object(mut merged)) => {
                // The lightweight message overlays the fetched object, keeping
                // the original guid.
                if let Value::Object(overlay) = message {
                    for (field, value) in overlay {
                        merged.insert(field, value);
                    }
                }
                Value::Object(merged)
            }
            _ => synthetic_error_result(guid),
        }
    }
}

/// Shaped stand-in returned when an overflowed result cannot be retrieved.
fn synthetic_error_result(guid: &str) -> Value {
    json!({
        "code": -1,
        "okToCache": false,
        "stdout": [],
        "stderr": [{
            "text": "An internal error has occurred while retrieving the compilation result"
        }],
        "execTime": 0,
        "timedOut": false,
        "guid": guid,
    })
}
