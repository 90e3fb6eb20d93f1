use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::auth::AuthError;
use crate::http::{InvalidHeader, ParseError, WriteError};
use crate::net::TransportError;
use crate::websocket::WebSocketError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed response: {0}")]
    Parse(#[from] ParseError),

    #[error("failed to send request: {0}")]
    Write(#[from] WriteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid header: {0}")]
    InvalidHeader(#[from] InvalidHeader),

    #[error("peer authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("peer authentication requested but no identity is configured")]
    AuthNotConfigured,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WebSocketError),

    #[error("unexpected status {0}")]
    UnexpectedStatus(StatusCode),

    #[error("peer {peer} does not serve protocol {protocol}")]
    ProtocolNotSupported { peer: String, protocol: String },

    #[error("invalid protocol map: {0}")]
    InvalidProtocolMap(#[from] serde_json::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,
}
