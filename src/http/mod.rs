//! HTTP/1.1 message codec over peer streams.
//!
//! # Data Flow
//! ```text
//! Stream bytes (any chunking)
//!     → preamble.rs (PreambleDecoder: start line + HeaderSet, size-limited)
//!     → body.rs (BodyDecoder: Content-Length | chunked | EOF | upgrade)
//!     → message.rs (owned Request / Response with a Body handle)
//!     → handler
//!     → writer.rs (head, then body; Connection: close by default)
//!     → Stream bytes
//! ```
//!
//! # Design Decisions
//! - Parsing is resumable; only undecided bytes are buffered
//! - Bytes read past the preamble are handed to the body, never dropped
//! - A failing body source aborts the stream instead of closing it

pub mod body;
pub mod error;
pub mod headers;
pub mod message;
pub mod preamble;
pub mod writer;

pub use body::{Body, BodyDecoder, BodyStream};
pub use error::{ParseError, WriteError};
pub use headers::{HeaderSet, InvalidHeader};
pub use message::{Request, Response};
pub use preamble::{read_preamble, BodyKind, MessageKind, MessagePreamble, PreambleDecoder, StartLine};
pub use writer::{write_request, write_response, write_response_for};
