//! Message bodies and body framing.

use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;

use crate::http::error::ParseError;
use crate::http::preamble::BodyKind;

const MAX_CHUNK_LINE: usize = 4096;

pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// A typed body handle: nothing, a buffered payload, or a pull-based stream.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

impl Body {
    pub fn empty() -> Self {
        Body::Empty
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: futures_util::Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Body::Stream(stream.boxed())
    }

    /// Length known without consuming the body.
    pub fn exact_len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> BodyStream {
        match self {
            Body::Empty => stream::empty().boxed(),
            Body::Full(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            Body::Stream(s) => s,
        }
    }

    /// Buffer the whole body.
    pub async fn collect(self) -> io::Result<Bytes> {
        self.collect_limited(usize::MAX).await
    }

    /// Buffer the whole body, failing once more than `limit` bytes arrive.
    pub async fn collect_limited(self, limit: usize) -> io::Result<Bytes> {
        let mut stream = match self {
            Body::Empty => return Ok(Bytes::new()),
            Body::Full(bytes) if bytes.len() <= limit => return Ok(bytes),
            other => other.into_stream(),
        };
        let mut out = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if out.len() + chunk.len() > limit {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "body exceeds limit"));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    pub async fn text(self) -> io::Result<String> {
        let bytes = self.collect().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Body::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Full(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Full(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Full(Bytes::from(text))
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Body::Full(Bytes::from_static(text.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Body::Full(Bytes::from_static(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length { remaining: u64 },
    Chunked(ChunkState),
    Eof,
    Done,
}

/// Splits body bytes out of a buffer according to the message framing.
#[derive(Debug, Clone)]
pub struct BodyDecoder {
    state: State,
}

impl BodyDecoder {
    pub fn new(kind: BodyKind) -> Self {
        let state = match kind {
            BodyKind::Empty | BodyKind::Length(0) => State::Done,
            BodyKind::Length(n) => State::Length { remaining: n },
            BodyKind::Chunked => State::Chunked(ChunkState::Size),
            BodyKind::UntilEof | BodyKind::Upgrade => State::Eof,
        };
        Self { state }
    }

    /// The body ended on its own framing; no more bytes belong to it.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    fn decode_chunked(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ParseError> {
        loop {
            let State::Chunked(chunk_state) = self.state else {
                return Ok(None);
            };
            match chunk_state {
                ChunkState::Size => {
                    let Some(line) = take_line(src)? else {
                        return Ok(None);
                    };
                    let size_text = line.split(|b| *b == b';').next().unwrap_or_default();
                    let size_text = std::str::from_utf8(size_text)
                        .map_err(|_| ParseError::InvalidChunk)?
                        .trim();
                    if size_text.is_empty() {
                        return Err(ParseError::InvalidChunk);
                    }
                    let size =
                        u64::from_str_radix(size_text, 16).map_err(|_| ParseError::InvalidChunk)?;
                    self.state = State::Chunked(if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data { remaining: size }
                    });
                }
                ChunkState::Data { remaining } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(src.len() as u64);
                    let data = src.split_to(n as usize).freeze();
                    let remaining = remaining - n;
                    self.state = State::Chunked(if remaining == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data { remaining }
                    });
                    return Ok(Some(data));
                }
                ChunkState::DataEnd => {
                    match src.first() {
                        None => return Ok(None),
                        Some(b'\n') => src.advance(1),
                        Some(b'\r') => match src.get(1) {
                            None => return Ok(None),
                            Some(b'\n') => src.advance(2),
                            Some(_) => return Err(ParseError::InvalidChunk),
                        },
                        Some(_) => return Err(ParseError::InvalidChunk),
                    }
                    self.state = State::Chunked(ChunkState::Size);
                }
                ChunkState::Trailer => {
                    let Some(line) = take_line(src)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = State::Done;
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Split one line (without its terminator) off the front of `src`.
fn take_line(src: &mut BytesMut) -> Result<Option<Bytes>, ParseError> {
    match src.iter().position(|b| *b == b'\n') {
        Some(idx) => {
            let mut line = src.split_to(idx + 1);
            line.truncate(idx);
            if line.last() == Some(&b'\r') {
                line.truncate(idx - 1);
            }
            Ok(Some(line.freeze()))
        }
        None if src.len() > MAX_CHUNK_LINE => Err(ParseError::InvalidChunk),
        None => Ok(None),
    }
}

impl Decoder for BodyDecoder {
    type Item = Bytes;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ParseError> {
        match self.state {
            State::Done => Ok(None),
            State::Eof => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(src.split().freeze()))
                }
            }
            State::Length { remaining } => {
                if src.is_empty() {
                    return Ok(None);
                }
                let n = remaining.min(src.len() as u64);
                let data = src.split_to(n as usize).freeze();
                let remaining = remaining - n;
                self.state = if remaining == 0 {
                    State::Done
                } else {
                    State::Length { remaining }
                };
                Ok(Some(data))
            }
            State::Chunked(_) => self.decode_chunked(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ParseError> {
        if let Some(data) = self.decode(src)? {
            return Ok(Some(data));
        }
        match self.state {
            State::Done => Ok(None),
            State::Eof => {
                self.state = State::Done;
                Ok(None)
            }
            State::Length { .. } | State::Chunked(_) => Err(ParseError::UnexpectedEof),
        }
    }
}

/// Turn the rest of a stream into a body, starting with bytes that were
/// read past the preamble.
pub fn incoming_body<R>(reader: R, buffered: BytesMut, kind: BodyKind) -> Body
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let decoder = BodyDecoder::new(kind);
    if decoder.is_done() {
        return Body::Empty;
    }

    struct Incoming<R> {
        reader: R,
        buf: BytesMut,
        decoder: BodyDecoder,
        eof: bool,
        failed: bool,
    }

    let state = Incoming {
        reader,
        buf: buffered,
        decoder,
        eof: false,
        failed: false,
    };

    Body::from_stream(stream::unfold(state, |mut st| async move {
        loop {
            if st.failed || st.decoder.is_done() {
                return None;
            }
            let decoded = if st.eof {
                st.decoder.decode_eof(&mut st.buf)
            } else {
                st.decoder.decode(&mut st.buf)
            };
            match decoded {
                Ok(Some(chunk)) if !chunk.is_empty() => return Some((Ok(chunk), st)),
                Ok(Some(_)) => continue,
                Ok(None) if st.eof => return None,
                Ok(None) => {}
                Err(e) => {
                    st.failed = true;
                    return Some((Err(e.into_io()), st));
                }
            }
            if st.decoder.is_done() {
                return None;
            }
            match st.reader.read_buf(&mut st.buf).await {
                Ok(0) => st.eof = true,
                Ok(_) => {}
                Err(e) => {
                    st.failed = true;
                    return Some((Err(e), st));
                }
            }
        }
    }))
}
