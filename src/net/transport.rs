//! The consumed transport interface.
//!
//! Dialing opens a stream to a peer for one protocol; listening dispatches
//! each inbound stream to the handler registered for its protocol.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::net::stream::Stream;

/// Errors raised while opening or negotiating a stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("peer {peer} does not support protocol {protocol}")]
    ProtocolNotSupported { peer: String, protocol: String },

    #[error("protocol negotiation failed: {0}")]
    Negotiation(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives inbound streams for a protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn on_stream(&self, stream: Stream);
}

#[async_trait]
impl<T: StreamHandler + ?Sized> StreamHandler for Arc<T> {
    async fn on_stream(&self, stream: Stream) {
        (**self).on_stream(stream).await
    }
}

/// A multiplexed transport: open streams, and accept them per protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_stream(&self, peer: &str, protocol: &str) -> Result<Stream, TransportError>;

    fn register_protocol_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>);

    fn unregister_protocol_handler(&self, protocol: &str);
}

/// Concurrent table of protocol id → inbound stream handler.
#[derive(Clone, Default)]
pub struct ProtocolHandlers {
    inner: Arc<DashMap<String, Arc<dyn StreamHandler>>>,
}

impl ProtocolHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        if self.inner.insert(protocol.to_string(), handler).is_some() {
            tracing::warn!(protocol, "Replaced existing stream handler");
        }
    }

    pub fn remove(&self, protocol: &str) {
        self.inner.remove(protocol);
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn StreamHandler>> {
        self.inner.get(protocol).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.inner.contains_key(protocol)
    }

    /// Hand a stream to its protocol handler on a new task.
    pub fn dispatch(&self, stream: Stream) -> bool {
        match self.get(stream.protocol()) {
            Some(handler) => {
                tokio::spawn(async move { handler.on_stream(stream).await });
                true
            }
            None => false,
        }
    }
}
