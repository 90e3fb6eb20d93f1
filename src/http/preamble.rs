//! Incremental HTTP/1.1 preamble parsing.
//!
//! [`PreambleDecoder`] is a `tokio_util` decoder: feed it bytes in chunks of
//! any size, including one byte at a time, and it yields the start line plus
//! headers once the blank line arrives. It remembers how far it has scanned,
//! so each call only looks at new bytes. Everything after the blank line is
//! left in the buffer for the body decoder.

use bytes::{Bytes, BytesMut};
use http::{header, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;

use crate::http::error::ParseError;
use crate::http::headers::HeaderSet;

/// Statuses that never carry a body.
pub fn is_null_body_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 100..=199 | 204 | 205 | 304)
}

/// Whether the message is a request or a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, target: String },
    Response { status: StatusCode, reason: String },
}

/// How the body following a preamble is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    UntilEof,
    /// The stream now belongs to another protocol.
    Upgrade,
}

/// A parsed start line and header block.
#[derive(Debug, Clone)]
pub struct MessagePreamble {
    pub start: StartLine,
    pub version: Version,
    pub headers: HeaderSet,
    /// Set for requests asking to switch protocols and for 101 responses.
    pub upgrade: bool,
    /// The exact bytes that made up the preamble.
    pub raw: Bytes,
}

impl MessagePreamble {
    pub fn method(&self) -> Option<&Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn target(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.upgrade
            && self
                .headers
                .get_str(header::UPGRADE)
                .map(|u| u.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
    }

    /// Body delimitation. Responses need the method of the request they
    /// answer, since a HEAD response carries no body.
    pub fn body_kind(&self, request_method: Option<&Method>) -> Result<BodyKind, ParseError> {
        match &self.start {
            StartLine::Request { .. } => {
                // Only WebSocket upgrades are ever accepted; anything else
                // (h2c and friends) is an ordinary request.
                if self.is_websocket_upgrade() {
                    return Ok(BodyKind::Upgrade);
                }
                match self.headers.chunked() {
                    Some(true) => return Ok(BodyKind::Chunked),
                    Some(false) => return Err(ParseError::UnsupportedTransferEncoding),
                    None => {}
                }
                Ok(match self.headers.content_length()? {
                    Some(0) | None => BodyKind::Empty,
                    Some(n) => BodyKind::Length(n),
                })
            }
            StartLine::Response { status, .. } => {
                if is_null_body_status(*status) || request_method == Some(&Method::HEAD) {
                    return Ok(BodyKind::Empty);
                }
                if self.headers.chunked() == Some(true) {
                    return Ok(BodyKind::Chunked);
                }
                Ok(match self.headers.content_length()? {
                    Some(0) => BodyKind::Empty,
                    Some(n) => BodyKind::Length(n),
                    None => BodyKind::UntilEof,
                })
            }
        }
    }
}

/// Resumable decoder for one preamble.
#[derive(Debug, Clone)]
pub struct PreambleDecoder {
    kind: MessageKind,
    max_size: usize,
    scanned: usize,
}

impl PreambleDecoder {
    pub fn new(kind: MessageKind, max_size: usize) -> Self {
        Self {
            kind,
            max_size,
            scanned: 0,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }
}

impl Decoder for PreambleDecoder {
    type Item = MessagePreamble;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MessagePreamble>, ParseError> {
        if self.scanned == 0 {
            // Tolerate stray line breaks between messages.
            let leading = src.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
            if leading > 0 {
                let _ = src.split_to(leading);
            }
        }

        match find_blank_line(src, self.scanned) {
            Some(end) => {
                if end > self.max_size {
                    return Err(ParseError::HeadersTooLarge { limit: self.max_size });
                }
                self.scanned = 0;
                let raw = src.split_to(end).freeze();
                parse_preamble(self.kind, raw).map(Some)
            }
            None => {
                if src.len() > self.max_size {
                    return Err(ParseError::HeadersTooLarge { limit: self.max_size });
                }
                self.scanned = src.len();
                Ok(None)
            }
        }
    }
}

/// Read from `reader` until a full preamble is buffered. Bytes past the
/// preamble stay in `buf`.
pub async fn read_preamble<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    decoder: &mut PreambleDecoder,
) -> Result<MessagePreamble, ParseError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some(preamble) = decoder.decode(buf)? {
            return Ok(preamble);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(if buf.is_empty() {
                ParseError::Closed
            } else {
                ParseError::UnexpectedEof
            });
        }
    }
}

/// Index just past the first empty line (CRLF or bare LF), searching from
/// `from` with enough overlap to catch a terminator split across reads.
fn find_blank_line(buf: &[u8], from: usize) -> Option<usize> {
    let start = from.saturating_sub(2);
    let mut i = start;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match (buf.get(i + 1), buf.get(i + 2)) {
                (Some(b'\n'), _) => return Some(i + 2),
                (Some(b'\r'), Some(b'\n')) => return Some(i + 3),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn parse_version(token: &[u8]) -> Result<Version, ParseError> {
    match token {
        b"HTTP/1.1" => Ok(Version::HTTP_11),
        b"HTTP/1.0" => Ok(Version::HTTP_10),
        _ => Err(ParseError::InvalidVersion),
    }
}

fn parse_start_line(kind: MessageKind, line: &[u8]) -> Result<(StartLine, Version), ParseError> {
    match kind {
        MessageKind::Request => {
            let mut parts = line.split(|b| *b == b' ');
            let (Some(method), Some(target), Some(version), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return Err(ParseError::InvalidStartLine);
            };
            let method = Method::from_bytes(method).map_err(|_| ParseError::InvalidStartLine)?;
            if target.is_empty() || target.iter().any(|b| b.is_ascii_control()) {
                return Err(ParseError::InvalidStartLine);
            }
            let target = std::str::from_utf8(target)
                .map_err(|_| ParseError::InvalidStartLine)?
                .to_string();
            Ok((StartLine::Request { method, target }, parse_version(version)?))
        }
        MessageKind::Response => {
            let mut parts = line.splitn(3, |b| *b == b' ');
            let version = parse_version(parts.next().unwrap_or_default())?;
            let code = parts.next().ok_or(ParseError::InvalidStartLine)?;
            if code.len() != 3 {
                return Err(ParseError::InvalidStartLine);
            }
            let status = StatusCode::from_bytes(code).map_err(|_| ParseError::InvalidStartLine)?;
            let reason = String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
            Ok((StartLine::Response { status, reason }, version))
        }
    }
}

fn parse_preamble(kind: MessageKind, raw: Bytes) -> Result<MessagePreamble, ParseError> {
    let mut lines = raw.split(|b| *b == b'\n').map(trim_cr);
    let first = lines.next().ok_or(ParseError::InvalidStartLine)?;
    let (start, version) = parse_start_line(kind, first)?;

    let mut headers = HeaderSet::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if matches!(line[0], b' ' | b'\t') {
            return Err(ParseError::ObsoleteFold);
        }
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or(ParseError::InvalidHeader)?;
        let name = &line[..colon];
        if name.iter().any(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::InvalidHeader);
        }
        headers.append_raw(name, trim_ows(&line[colon + 1..]))?;
    }

    let upgrade = match &start {
        StartLine::Request { .. } => {
            headers.contains_key(header::UPGRADE) && headers.has_token(header::CONNECTION, "upgrade")
        }
        StartLine::Response { status, .. } => *status == StatusCode::SWITCHING_PROTOCOLS,
    };

    Ok(MessagePreamble {
        start,
        version,
        headers,
        upgrade,
        raw,
    })
}
