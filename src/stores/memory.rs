//! In-memory implementations of the external service traits.
//!
//! Used by tests and by the default binary wiring until real clients are
//! injected. Every implementation records its calls into an optional shared
//! [`OpLog`] so tests can assert cross-service ordering.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{MessageQueue, ObjectStore, ParameterStore, RoutingRecord, RoutingStore, StoreError};

/// Shared, ordered log of store operations.
#[derive(Clone, Default)]
pub struct OpLog(Arc<Mutex<Vec<String>>>);

impl OpLog {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().expect("op log poisoned").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("op log poisoned").clone()
    }
}

/// In-memory routing table.
#[derive(Default)]
pub struct MemoryRoutingStore {
    records: Mutex<HashMap<String, RoutingRecord>>,
    failing: AtomicBool,
    log: Option<OpLog>,
}

impl MemoryRoutingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: OpLog) -> Self {
        Self {
            log: Some(log),
            ..Self::default()
        }
    }

    pub fn insert(&self, key: impl Into<String>, record: RoutingRecord) {
        self.records
            .lock()
            .expect("routing records poisoned")
            .insert(key.into(), record);
    }

    /// Make every subsequent call fail, to exercise fallback paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RoutingStore for MemoryRoutingStore {
    async fn get_routing(&self, table: &str, key: &str) -> Result<Option<RoutingRecord>, StoreError> {
        if let Some(log) = &self.log {
            log.record(format!("routing:get:{table}:{key}"));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("routing table", "injected failure"));
        }
        Ok(self
            .records
            .lock()
            .expect("routing records poisoned")
            .get(key)
            .cloned())
    }
}

/// In-memory parameter store.
#[derive(Default)]
pub struct MemoryParameterStore {
    params: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
        self.params
            .lock()
            .expect("params poisoned")
            .insert(name.into(), value.into());
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ParameterStore for MemoryParameterStore {
    async fn get_parameter(&self, name: &str) -> Result<Option<String>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("parameter store", "injected failure"));
        }
        Ok(self
            .params
            .lock()
            .expect("params poisoned")
            .get(name)
            .cloned())
    }
}

/// One recorded object PUT.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
}

/// In-memory object store.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<Vec<StoredObject>>,
    failing: AtomicBool,
    log: Option<OpLog>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: OpLog) -> Self {
        Self {
            log: Some(log),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Seed an object as if it had been written earlier.
    pub fn seed(&self, bucket: &str, key: &str, body: Bytes) {
        self.objects
            .lock()
            .expect("objects poisoned")
            .push(StoredObject {
                bucket: bucket.to_string(),
                key: key.to_string(),
                body,
                content_type: "application/json".to_string(),
                metadata: HashMap::new(),
            });
    }

    /// All PUTs observed, in order.
    pub fn puts(&self) -> Vec<StoredObject> {
        self.objects.lock().expect("objects poisoned").clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        if let Some(log) = &self.log {
            log.record(format!("s3:put:{bucket}/{key}"));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("object store", "injected failure"));
        }
        self.objects
            .lock()
            .expect("objects poisoned")
            .push(StoredObject {
                bucket: bucket.to_string(),
                key: key.to_string(),
                body,
                content_type: content_type.to_string(),
                metadata,
            });
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Bytes>, StoreError> {
        if let Some(log) = &self.log {
            log.record(format!("s3:get:{bucket}/{key}"));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("object store", "injected failure"));
        }
        Ok(self
            .objects
            .lock()
            .expect("objects poisoned")
            .iter()
            .rev()
            .find(|o| o.bucket == bucket && o.key == key)
            .map(|o| o.body.clone()))
    }
}

/// One recorded queue publish.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub queue_url: String,
    pub body: String,
    pub group_id: String,
    pub dedup_id: String,
}

/// In-memory FIFO queue. Deduplicates by `dedup_id` like the real thing.
#[derive(Default)]
pub struct MemoryQueue {
    sent: Mutex<Vec<SentMessage>>,
    failing: AtomicBool,
    log: Option<OpLog>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: OpLog) -> Self {
        Self {
            log: Some(log),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Messages accepted after deduplication, in publish order.
    pub fn messages(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("queue poisoned").clone()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send_message(
        &self,
        queue_url: &str,
        body: String,
        group_id: &str,
        dedup_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(log) = &self.log {
            log.record(format!("sqs:send:{dedup_id}"));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("message queue", "injected failure"));
        }
        let mut sent = self.sent.lock().expect("queue poisoned");
        if sent.iter().any(|m| m.dedup_id == dedup_id) {
            return Ok(());
        }
        sent.push(SentMessage {
            queue_url: queue_url.to_string(),
            body,
            group_id: group_id.to_string(),
            dedup_id: dedup_id.to_string(),
        });
        Ok(())
    }
}
