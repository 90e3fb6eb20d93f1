//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections
//! - Enforce max_streams limit via semaphore

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::config::ListenerConfig;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind: {0}")]
    Bind(std::io::Error),

    #[error("Failed to accept: {0}")]
    Accept(std::io::Error),

    #[error("Listener closed")]
    Closed,
}

/// A bounded TCP listener that limits concurrent streams.
///
/// When the limit is reached, new connections wait until a slot frees up.
pub struct Listener {
    inner: TcpListener,
    stream_limit: Arc<Semaphore>,
    max_streams: usize,
}

impl Listener {
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_streams = config.max_streams,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            stream_limit: Arc::new(Semaphore::new(config.max_streams)),
            max_streams: config.max_streams,
        })
    }

    /// Accept a new connection, respecting the stream limit.
    ///
    /// The returned permit must be held for the stream's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, StreamPermit), ListenerError> {
        let permit = Arc::clone(&self.stream_limit)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.stream_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, StreamPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.stream_limit.available_permits()
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }
}

/// A slot in the listener's stream budget. Dropping it frees the slot, even
/// if the stream task panicked.
#[derive(Debug)]
pub struct StreamPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
