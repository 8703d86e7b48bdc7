//! External service boundary.
//!
//! The router talks to four external capabilities: the routing table, the
//! parameter store, the object store, and the message queue. Each is expressed
//! as a trait so the concrete clients can be injected at startup and replaced
//! with in-memory doubles in tests.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Error raised by any external store operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The service could not be reached or rejected the call.
    #[error("{service}: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn unavailable(service: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            service,
            message: message.into(),
        }
    }
}

/// One record from the routing table.
///
/// All attributes are optional on the wire; the resolver decides what an
/// absent attribute means.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRecord {
    /// `"url"` or `"queue"`. Unspecified is treated as queue routing.
    #[serde(rename = "routingType", skip_serializing_if = "Option::is_none")]
    pub routing_type: Option<String>,

    /// Absolute base URL for direct forwarding.
    #[serde(rename = "targetUrl", skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,

    /// Explicit queue name, possibly without a color suffix.
    #[serde(rename = "queueName", skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,

    /// Environment the record belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// Point-read access to the compiler routing table.
#[async_trait]
pub trait RoutingStore: Send + Sync {
    /// Fetch the record stored under `key`, or `None` if absent.
    async fn get_routing(&self, table: &str, key: &str) -> Result<Option<RoutingRecord>, StoreError>;
}

/// Read access to the external parameter store.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Fetch the parameter value at `name`, or `None` if absent.
    async fn get_parameter(&self, name: &str) -> Result<Option<String>, StoreError>;
}

/// Blob storage for overflowed requests and results.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Fetch an object, or `None` if the key does not exist.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Bytes>, StoreError>;
}

/// FIFO message queue publisher.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn send_message(
        &self,
        queue_url: &str,
        body: String,
        group_id: &str,
        dedup_id: &str,
    ) -> Result<(), StoreError>;
}
