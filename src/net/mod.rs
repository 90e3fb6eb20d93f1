//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     Transport::open_stream(peer, protocol)
//!     → memory.rs (in-process pipe) | tcp.rs (one TCP connection + select line)
//!     → Stream handed to the HTTP client
//!
//! Inbound:
//!     listener.rs (accept loop, stream limits)
//!     → tcp.rs (protocol select)
//!     → transport.rs (ProtocolHandlers lookup)
//!     → StreamHandler::on_stream (e.g. the HTTP service)
//! ```
//!
//! # Design Decisions
//! - Streams are protocol-bound; the HTTP layer never sees raw sockets
//! - Abort is distinct from half-close: readers drain, then see a reset
//! - Each inbound stream tracked for graceful shutdown

pub mod connection;
pub mod listener;
pub mod memory;
pub mod stream;
pub mod tcp;
pub mod transport;

pub use connection::{StreamId, StreamTracker};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use stream::{BoxedReader, BoxedWriter, Stream, StreamAbort, StreamParts};
pub use tcp::TcpTransport;
pub use transport::{ProtocolHandlers, StreamHandler, Transport, TransportError};
