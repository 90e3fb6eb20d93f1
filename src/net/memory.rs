//! In-process transport.
//!
//! Nodes join a shared [`MemoryNetwork`] under a name. Opening a stream
//! creates a pipe, hands the listener end to the remote node's protocol
//! handler and returns the dialer end. Both ends share one reset flag, so
//! aborting either side resets the pipe for both.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::net::stream::{AbortSignal, AbortableReader, AbortableWriter, Side, Stream};
use crate::net::transport::{ProtocolHandlers, StreamHandler, Transport, TransportError};

const PIPE_CAPACITY: usize = 64 * 1024;

/// A set of named in-process nodes that can dial each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<DashMap<String, ProtocolHandlers>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the network under `name`, returning that node's transport.
    pub fn node(&self, name: &str) -> MemoryTransport {
        let handlers = self
            .nodes
            .entry(name.to_string())
            .or_default()
            .value()
            .clone();
        MemoryTransport {
            name: name.to_string(),
            network: self.clone(),
            handlers,
        }
    }

    fn handlers_for(&self, name: &str) -> Option<ProtocolHandlers> {
        self.nodes.get(name).map(|entry| entry.value().clone())
    }
}

/// One node's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    name: String,
    network: MemoryNetwork,
    handlers: ProtocolHandlers,
}

impl MemoryTransport {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Create a connected pair of streams sharing one reset flag.
pub fn stream_pair(protocol: &str, dialer: &str, listener: &str) -> (Stream, Stream) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    let signal = AbortSignal::new();

    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let dialer_end = Stream::new(
        protocol,
        listener,
        Box::new(AbortableReader::new(a_read, Arc::clone(&signal), Side::Dialer)),
        Box::new(AbortableWriter::new(a_write, Arc::clone(&signal))),
        Arc::clone(&signal),
    );
    let listener_end = Stream::new(
        protocol,
        dialer,
        Box::new(AbortableReader::new(b_read, Arc::clone(&signal), Side::Listener)),
        Box::new(AbortableWriter::new(b_write, Arc::clone(&signal))),
        signal,
    );
    (dialer_end, listener_end)
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_stream(&self, peer: &str, protocol: &str) -> Result<Stream, TransportError> {
        let handlers = self
            .network
            .handlers_for(peer)
            .ok_or_else(|| TransportError::Unreachable(peer.to_string()))?;

        if !handlers.contains(protocol) {
            return Err(TransportError::ProtocolNotSupported {
                peer: peer.to_string(),
                protocol: protocol.to_string(),
            });
        }

        let (dialer_end, listener_end) = stream_pair(protocol, &self.name, peer);
        tracing::trace!(
            stream_id = %dialer_end.id(),
            from = %self.name,
            to = %peer,
            protocol,
            "Opened memory stream"
        );

        if !handlers.dispatch(listener_end) {
            return Err(TransportError::ProtocolNotSupported {
                peer: peer.to_string(),
                protocol: protocol.to_string(),
            });
        }
        Ok(dialer_end)
    }

    fn register_protocol_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        self.handlers.insert(protocol, handler);
    }

    fn unregister_protocol_handler(&self, protocol: &str) {
        self.handlers.remove(protocol);
    }
}
