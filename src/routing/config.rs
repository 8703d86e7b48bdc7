//! Configuration for routing resolution.

use std::time::Duration;

/// Configuration for the routing resolver.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Name of the external routing table.
    pub table_name: String,

    /// Region used to derive service endpoints.
    pub aws_region: String,

    /// Base URL that queue names are appended to.
    pub sqs_base_url: String,

    /// How long an active-color lookup stays cached.
    pub color_ttl: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let aws_region = "us-east-1".to_string();
        Self {
            table_name: "CompilerRouting".to_string(),
            sqs_base_url: format!("https://sqs.{aws_region}.amazonaws.com/compiler-explorer"),
            aws_region,
            color_ttl: Duration::from_secs(30),
        }
    }
}

impl RoutingConfig {
    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CE_ROUTING_TABLE`: Routing table name (default: CompilerRouting)
    /// - `CE_AWS_REGION`: Region for derived endpoints (default: us-east-1)
    /// - `CE_SQS_BASE_URL`: Queue URL base (default: derived from the region)
    pub fn from_env() -> Self {
        let aws_region =
            std::env::var("CE_AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        Self {
            table_name: std::env::var("CE_ROUTING_TABLE")
                .unwrap_or_else(|_| "CompilerRouting".to_string()),
            sqs_base_url: std::env::var("CE_SQS_BASE_URL").unwrap_or_else(|_| {
                format!("https://sqs.{aws_region}.amazonaws.com/compiler-explorer")
            }),
            aws_region,
            color_ttl: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_base_url_uses_region() {
        let config = RoutingConfig::default();
        assert_eq!(
            config.sqs_base_url,
            "https://sqs.us-east-1.amazonaws.com/compiler-explorer"
        );
        assert_eq!(config.table_name, "CompilerRouting");
        assert_eq!(config.color_ttl, Duration::from_secs(30));
    }
}
