//! Crate-level error wrapping each subsystem's error type.

use thiserror::Error;

use crate::auth::AuthError;
use crate::client::ClientError;
use crate::config::{ConfigError, ValidationError};
use crate::http::{ParseError, WriteError};
use crate::net::listener::ListenerError;
use crate::net::TransportError;
use crate::observability::logging::LoggingError;
use crate::observability::metrics::MetricsError;
use crate::routing::{DispatchError, RouteError};
use crate::services::PingError;
use crate::websocket::WebSocketError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    WebSocket(#[from] WebSocketError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Ping(#[from] PingError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("config watcher failed: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
