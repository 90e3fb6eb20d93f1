//! Structured logging.
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to the
//! whole process.

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("tracing subscriber already installed")]
    AlreadyInitialized,
}

/// Build the filter: `RUST_LOG` if present, else `level`.
pub fn env_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| LoggingError::InvalidFilter {
        filter: level.to_string(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber.
pub fn init_tracing(level: &str) -> Result<(), LoggingError> {
    tracing_subscriber::registry()
        .with(env_filter(level)?)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_valid_filters() {
        for level in ["trace", "debug", "info", "warn", "error", "p2p_http=debug,info"] {
            assert!(env_filter(level).is_ok(), "{level}");
        }
    }
}
