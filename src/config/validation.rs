//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function: NodeConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::NodeConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is not a valid socket address: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("unknown log level: {0}")]
    UnknownLogLevel(String),

    #[error("http.max_header_size must be at least {min} bytes")]
    HeaderLimitTooSmall { min: usize },

    #[error("auth.allowed_hostnames contains an empty entry")]
    EmptyHostname,
}

/// Smallest preamble limit that still fits a request line and a Host header.
const MIN_HEADER_SIZE: usize = 256;

pub fn validate_config(config: &NodeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.http.max_header_size < MIN_HEADER_SIZE {
        errors.push(ValidationError::HeaderLimitTooSmall { min: MIN_HEADER_SIZE });
    }
    if config.http.header_timeout_secs == 0 {
        errors.push(ValidationError::Zero { field: "http.header_timeout_secs" });
    }
    if config.auth.token_ttl_secs == 0 {
        errors.push(ValidationError::Zero { field: "auth.token_ttl_secs" });
    }
    if config.auth.allowed_hostnames.iter().any(|h| h.trim().is_empty()) {
        errors.push(ValidationError::EmptyHostname);
    }
    if config.websocket.max_message_size == 0 {
        errors.push(ValidationError::Zero { field: "websocket.max_message_size" });
    }
    if config.websocket.upgrade_timeout_secs == 0 {
        errors.push(ValidationError::Zero { field: "websocket.upgrade_timeout_secs" });
    }
    if config.listener.max_streams == 0 {
        errors.push(ValidationError::Zero { field: "listener.max_streams" });
    }
    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }
    match config.observability.log_level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        other => errors.push(ValidationError::UnknownLogLevel(other.to_string())),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
