//! Metrics collection and exposition.
//!
//! # Metrics
//! - `p2p_http_requests_total` (counter): requests by protocol, status
//! - `p2p_http_request_duration_seconds` (histogram): handler latency by protocol
//! - `p2p_http_parse_errors_total` (counter): streams aborted on malformed HTTP
//! - `p2p_http_websocket_messages_total` (counter): messages by direction
//! - `p2p_http_auth_outcomes_total` (counter): peer-auth results by outcome
//! - `p2p_http_token_cache_size` (gauge): bearer tokens held by the client
//!
//! Without an installed recorder every call is a no-op, so library users
//! pay nothing unless the node enables the exporter.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

use crate::config::ObservabilityConfig;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics system already initialized")]
    AlreadyInitialized,

    #[error("invalid metrics address: {0}")]
    InvalidAddress(String),

    #[error("metrics initialization failed: {0}")]
    InitializationFailed(String),
}

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<(), MetricsError> {
    let addr: SocketAddr = config
        .metrics_address
        .parse()
        .map_err(|e| MetricsError::InvalidAddress(format!("{e}")))?;

    let handle = PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()
        .map_err(|e| MetricsError::InitializationFailed(format!("{e}")))?;

    METRICS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    HttpMetrics::register();
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// Current metrics in Prometheus text format; empty before [`init_metrics`].
pub fn render_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// Named recording points.
pub struct HttpMetrics;

impl HttpMetrics {
    pub fn register() {
        describe_counter!("p2p_http_requests_total", "Requests served, by protocol and status");
        describe_histogram!(
            "p2p_http_request_duration_seconds",
            "Time from parsed preamble to response head"
        );
        describe_counter!("p2p_http_parse_errors_total", "Streams aborted on malformed HTTP");
        describe_counter!(
            "p2p_http_websocket_messages_total",
            "WebSocket messages, by direction"
        );
        describe_counter!("p2p_http_auth_outcomes_total", "Peer authentication results");
        describe_gauge!("p2p_http_token_cache_size", "Cached client bearer tokens");
    }

    pub fn request_completed(protocol: &str, status: u16, duration_seconds: f64) {
        counter!(
            "p2p_http_requests_total",
            "protocol" => protocol.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!(
            "p2p_http_request_duration_seconds",
            "protocol" => protocol.to_string()
        )
        .record(duration_seconds);
    }

    pub fn parse_error() {
        counter!("p2p_http_parse_errors_total").increment(1);
    }

    /// `direction` is `in` or `out`.
    pub fn websocket_message(direction: &'static str) {
        counter!("p2p_http_websocket_messages_total", "direction" => direction).increment(1);
    }

    pub fn auth_outcome(outcome: &'static str) {
        counter!("p2p_http_auth_outcomes_total", "outcome" => outcome).increment(1);
    }

    pub fn token_cache_size(size: usize) {
        gauge!("p2p_http_token_cache_size").set(size as f64);
    }
}
