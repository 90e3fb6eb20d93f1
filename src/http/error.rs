//! HTTP codec errors.

use thiserror::Error;

/// Malformed or truncated HTTP input. A stream that produced one of these is
/// never reused.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid start line")]
    InvalidStartLine,

    #[error("unsupported HTTP version")]
    InvalidVersion,

    #[error("invalid header line")]
    InvalidHeader,

    #[error("obsolete header line folding")]
    ObsoleteFold,

    #[error("preamble exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },

    #[error("invalid Content-Length")]
    InvalidContentLength,

    #[error("unsupported Transfer-Encoding")]
    UnsupportedTransferEncoding,

    #[error("invalid chunked framing")]
    InvalidChunk,

    #[error("stream ended mid-message")]
    UnexpectedEof,

    #[error("stream closed before a message started")]
    Closed,

    #[error("I/O error while parsing: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            ParseError::Io(e) => e,
            ParseError::UnexpectedEof | ParseError::Closed => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, self)
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

/// Failure while serializing a message onto a stream.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The sink rejected bytes.
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    /// The body source failed; the stream has been aborted.
    #[error("body source failed: {0}")]
    Body(std::io::Error),

    /// A streamed body did not match its declared Content-Length; the stream
    /// has been aborted.
    #[error("body length mismatch: declared {declared}, produced {produced}")]
    LengthMismatch { declared: u64, produced: u64 },
}
