//! Configuration for queue submission and overflow storage.

/// Configuration for the queue submitter and result hydration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Largest serialized message accepted by the queue, in bytes.
    pub max_message_size: usize,

    /// Bucket receiving overflowed request messages.
    pub overflow_bucket: String,

    /// Key prefix for overflowed request messages.
    pub overflow_prefix: String,

    /// Bucket holding overflowed compilation results.
    pub results_bucket: String,

    /// Key prefix for overflowed compilation results.
    pub results_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_message_size: 262_144,
            overflow_bucket: "temp-storage.godbolt.org".to_string(),
            overflow_prefix: "sqs-overflow/".to_string(),
            results_bucket: "storage.godbolt.org".to_string(),
            results_prefix: "cache/".to_string(),
        }
    }
}

impl QueueConfig {
    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CE_SQS_MAX_MESSAGE_SIZE`: Queue message size limit (default: 262144)
    /// - `CE_S3_OVERFLOW_BUCKET`: Overflow bucket (default: temp-storage.godbolt.org)
    /// - `CE_S3_OVERFLOW_PREFIX`: Overflow key prefix (default: sqs-overflow/)
    /// - `CE_RESULTS_BUCKET`: Results bucket (default: storage.godbolt.org)
    /// - `CE_RESULTS_PREFIX`: Results key prefix (default: cache/)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_message_size: std::env::var("CE_SQS_MAX_MESSAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_message_size),
            overflow_bucket: std::env::var("CE_S3_OVERFLOW_BUCKET")
                .unwrap_or(defaults.overflow_bucket),
            overflow_prefix: std::env::var("CE_S3_OVERFLOW_PREFIX")
                .unwrap_or(defaults.overflow_prefix),
            results_bucket: std::env::var("CE_RESULTS_BUCKET").unwrap_or(defaults.results_bucket),
            results_prefix: std::env::var("CE_RESULTS_PREFIX").unwrap_or(defaults.results_prefix),
        }
    }
}
