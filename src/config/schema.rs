//! Configuration schema definitions.
//!
//! Every section carries defaults so an empty file is a valid node config.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for a node.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// HTTP message codec limits.
    pub http: HttpConfig,

    /// Peer-ID authentication settings.
    pub auth: AuthConfig,

    /// WebSocket engine settings.
    pub websocket: WebSocketConfig,

    /// TCP stream listener settings.
    pub listener: ListenerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// HTTP codec configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Maximum size of a request or response preamble in bytes.
    pub max_header_size: usize,

    /// Time allowed for a complete preamble to arrive, in seconds.
    pub header_timeout_secs: u64,
}

impl HttpConfig {
    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_header_size: 81_920,
            header_timeout_secs: 30,
        }
    }
}

/// Peer-ID authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Lifetime of opaque challenges and bearer tokens, in seconds.
    pub token_ttl_secs: u64,

    /// Hostnames the server accepts. Empty means any hostname.
    pub allowed_hostnames: Vec<String>,
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 3600,
            allowed_hostnames: Vec::new(),
        }
    }
}

/// WebSocket configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Largest message (after fragment reassembly) accepted, in bytes.
    pub max_message_size: usize,

    /// Time allowed for an upgrade handshake, in seconds.
    pub upgrade_timeout_secs: u64,
}

impl WebSocketConfig {
    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_secs(self.upgrade_timeout_secs)
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024,
            upgrade_timeout_secs: 10,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:4001").
    pub bind_address: String,

    /// Maximum concurrent inbound streams (backpressure).
    pub max_streams: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:4001".to_string(),
            max_streams: 1_024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Exporter bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.http.max_header_size, 81_920);
        assert_eq!(config.auth.token_ttl(), Duration::from_secs(3600));
        assert_eq!(config.websocket.max_message_size, 10_485_760);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            [websocket]
            max_message_size = 2048

            [auth]
            allowed_hostnames = ["example.com"]
            "#,
        )
        .unwrap();

        assert_eq!(config.websocket.max_message_size, 2048);
        assert_eq!(config.websocket.upgrade_timeout_secs, 10);
        assert_eq!(config.auth.allowed_hostnames, vec!["example.com".to_string()]);
        assert_eq!(config.auth.token_ttl_secs, 3600);
    }
}
