//! HTTP/1.1 serialization onto a stream.
//!
//! The head is written only once the full start line and header set exist.
//! Known-length bodies get `Content-Length`; streamed bodies without one are
//! sent chunked. If the body source fails mid-write the stream is aborted
//! rather than closed, so the peer cannot mistake a truncated body for a
//! complete one.

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::body::Body;
use crate::http::error::WriteError;
use crate::http::headers::HeaderSet;
use crate::http::message::{Request, Response};
use crate::http::preamble::is_null_body_status;
use crate::net::StreamAbort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    None,
    Length(u64),
    Chunked,
}

fn apply_framing(headers: &mut HeaderSet, body: &Body, allow_body: bool, empty_needs_length: bool) -> Framing {
    if !allow_body {
        headers.remove(header::TRANSFER_ENCODING);
        return Framing::None;
    }
    match body.exact_len() {
        Some(0) if !empty_needs_length => {
            headers.remove(header::TRANSFER_ENCODING);
            headers.remove(header::CONTENT_LENGTH);
            Framing::None
        }
        Some(len) => {
            headers.remove(header::TRANSFER_ENCODING);
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            Framing::Length(len)
        }
        None => match headers.content_length() {
            Ok(Some(len)) if headers.chunked().is_none() => Framing::Length(len),
            _ => {
                headers.remove(header::CONTENT_LENGTH);
                headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                Framing::Chunked
            }
        },
    }
}

fn encode_head(start_line: &str, headers: &HeaderSet) -> BytesMut {
    let mut head = BytesMut::with_capacity(start_line.len() + 32 * headers.len() + 4);
    head.put_slice(start_line.as_bytes());
    head.put_slice(b"\r\n");
    for (name, value) in headers.iter() {
        head.put_slice(name.as_str().as_bytes());
        head.put_slice(b": ");
        head.put_slice(value.as_bytes());
        head.put_slice(b"\r\n");
    }
    head.put_slice(b"\r\n");
    head
}

fn default_connection(headers: &mut HeaderSet) {
    if !headers.contains_key(header::CONNECTION) {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
}

/// Finalize a request's headers and return its encoded head and framing.
fn prepare_request(request: &mut Request) -> (BytesMut, Framing) {
    default_connection(&mut request.headers);
    let empty_needs_length = matches!(request.method, Method::POST | Method::PUT | Method::PATCH);
    let framing = apply_framing(&mut request.headers, &request.body, true, empty_needs_length);
    let start = format!("{} {} HTTP/1.1", request.method, request.target);
    (encode_head(&start, &request.headers), framing)
}

/// `head_only` keeps the framing headers a GET would carry but sends no body.
fn prepare_response(response: &mut Response, head_only: bool) -> (BytesMut, Framing) {
    default_connection(&mut response.headers);
    let allow_body = !is_null_body_status(response.status);
    let mut framing = apply_framing(&mut response.headers, &response.body, allow_body, true);
    if head_only {
        framing = Framing::None;
    }
    let start = format!(
        "HTTP/1.1 {} {}",
        response.status.as_u16(),
        response.reason_phrase()
    );
    (encode_head(&start, &response.headers), framing)
}

async fn write_body<W>(sink: &mut W, body: Body, framing: Framing, abort: &StreamAbort) -> Result<(), WriteError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match (framing, body) {
        (Framing::None, _) | (_, Body::Empty) => {}
        (_, Body::Full(bytes)) => sink.write_all(&bytes).await?,
        (Framing::Length(declared), Body::Stream(mut stream)) => {
            let mut produced = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| {
                    abort.abort();
                    WriteError::Body(e)
                })?;
                produced += chunk.len() as u64;
                if produced > declared {
                    abort.abort();
                    return Err(WriteError::LengthMismatch { declared, produced });
                }
                sink.write_all(&chunk).await?;
            }
            if produced != declared {
                abort.abort();
                return Err(WriteError::LengthMismatch { declared, produced });
            }
        }
        (Framing::Chunked, Body::Stream(mut stream)) => {
            while let Some(chunk) = stream.next().await {
                let chunk: Bytes = chunk.map_err(|e| {
                    abort.abort();
                    WriteError::Body(e)
                })?;
                if chunk.is_empty() {
                    continue;
                }
                sink.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
                sink.write_all(&chunk).await?;
                sink.write_all(b"\r\n").await?;
            }
            sink.write_all(b"0\r\n\r\n").await?;
        }
    }
    Ok(())
}

/// Serialize a request. Defaults `Connection: close` when unset.
pub async fn write_request<W>(sink: &mut W, mut request: Request, abort: &StreamAbort) -> Result<(), WriteError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (head, framing) = prepare_request(&mut request);
    sink.write_all(&head).await?;
    write_body(sink, request.body, framing, abort).await?;
    sink.flush().await?;
    Ok(())
}

/// Serialize a response. Defaults `Connection: close` when unset; bodies of
/// 1xx/204/205/304 responses are dropped.
pub async fn write_response<W>(sink: &mut W, response: Response, abort: &StreamAbort) -> Result<(), WriteError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    send_response(sink, response, false, abort).await
}

/// Serialize the response to a `method` request. A HEAD response keeps its
/// `Content-Length` but carries no body.
pub async fn write_response_for<W>(
    sink: &mut W,
    response: Response,
    method: &Method,
    abort: &StreamAbort,
) -> Result<(), WriteError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    send_response(sink, response, *method == Method::HEAD, abort).await
}

async fn send_response<W>(sink: &mut W, mut response: Response, head_only: bool, abort: &StreamAbort) -> Result<(), WriteError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (head, framing) = prepare_response(&mut response, head_only);
    sink.write_all(&head).await?;
    write_body(sink, response.body, framing, abort).await?;
    sink.flush().await?;
    Ok(())
}

/// A bare status response with `Connection: close` and no body, for
/// failures where nothing better can be said.
pub fn bare_status(status: StatusCode) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::memory::stream_pair;
    use crate::http::body::BodyDecoder;
    use crate::http::preamble::{MessageKind, MessagePreamble, PreambleDecoder};
    use futures_util::stream;
    use std::io;
    use tokio::io::AsyncReadExt;
    use tokio_util::codec::Decoder;

    /// Read everything the sender wrote and parse it back into a preamble
    /// and a body.
    async fn read_back(mut remote: crate::net::Stream, kind: MessageKind) -> (MessagePreamble, Vec<u8>) {
        let mut raw = Vec::new();
        remote.read_to_end(&mut raw).await.unwrap();
        let mut buf = BytesMut::from(&raw[..]);

        let preamble = PreambleDecoder::new(kind, 8192).decode(&mut buf).unwrap().unwrap();
        let request_method = match kind {
            MessageKind::Request => None,
            MessageKind::Response => Some(Method::GET),
        };
        let mut body = BodyDecoder::new(preamble.body_kind(request_method.as_ref()).unwrap());
        let mut out = Vec::new();
        while let Some(chunk) = body.decode_eof(&mut buf).unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert!(body.is_done());
        assert!(buf.is_empty());
        (preamble, out)
    }

    #[test]
    fn response_head_defaults() {
        let mut response = Response::text(StatusCode::OK, "ok");
        let (head, framing) = prepare_response(&mut response, false);
        let head = String::from_utf8(head.to_vec()).unwrap();

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("connection: close\r\n"));
        assert!(head.contains("content-length: 2\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(framing, Framing::Length(2));
    }

    #[test]
    fn explicit_connection_header_kept() {
        let mut response = Response::new(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, HeaderValue::from_static("upgrade"));
        let (head, framing) = prepare_response(&mut response, false);
        let head = String::from_utf8(head.to_vec()).unwrap();
        assert!(head.contains("connection: upgrade\r\n"));
        assert!(!head.contains("close"));
        assert!(!head.contains("content-length"));
        assert_eq!(framing, Framing::None);
    }

    #[test]
    fn get_without_body_has_no_length() {
        let mut request = Request::get("/x");
        let (head, framing) = prepare_request(&mut request);
        let head = String::from_utf8(head.to_vec()).unwrap();
        assert!(head.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(!head.contains("content-length"));
        assert_eq!(framing, Framing::None);
    }

    #[test]
    fn streamed_body_without_length_is_chunked() {
        let mut response = Response::ok().with_body(Body::from_stream(stream::empty()));
        let (head, framing) = prepare_response(&mut response, false);
        assert!(String::from_utf8(head.to_vec()).unwrap().contains("transfer-encoding: chunked"));
        assert_eq!(framing, Framing::Chunked);
    }

    #[tokio::test]
    async fn writes_chunked_stream() {
        let (mut local, mut remote) = stream_pair("/t", "a", "b");
        let abort = local.abort_handle();
        let body = Body::from_stream(stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"world")),
        ]));
        write_response(&mut local, Response::ok().with_body(body), &abort).await.unwrap();
        drop(local);

        let mut out = Vec::new();
        remote.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("\r\n\r\n6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn failing_body_aborts_stream() {
        let (mut local, mut remote) = stream_pair("/t", "a", "b");
        let abort = local.abort_handle();
        let body = Body::from_stream(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::Other, "source broke")),
        ]));

        let err = write_response(&mut local, Response::ok().with_body(body), &abort)
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Body(_)));
        assert!(abort.is_aborted());

        let mut out = Vec::new();
        let read = remote.read_to_end(&mut out).await;
        assert_eq!(read.unwrap_err().kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn length_body_reads_back() {
        let (mut local, remote) = stream_pair("/t", "a", "b");
        let abort = local.abort_handle();
        let request = Request::post("/upload", "some payload");
        write_request(&mut local, request, &abort).await.unwrap();
        drop(local);

        let (preamble, body) = read_back(remote, MessageKind::Request).await;
        assert_eq!(preamble.method(), Some(&Method::POST));
        assert_eq!(preamble.target(), Some("/upload"));
        assert_eq!(preamble.headers.get_str(header::CONTENT_LENGTH), Some("12"));
        assert_eq!(body, b"some payload");
    }

    #[tokio::test]
    async fn chunked_body_reads_back() {
        let (mut local, remote) = stream_pair("/t", "a", "b");
        let abort = local.abort_handle();
        let body = Body::from_stream(stream::iter(vec![
            Ok(Bytes::from_static(b"first,")),
            Ok(Bytes::from_static(b"second")),
        ]));
        let response = Response::new(StatusCode::CREATED).with_body(body);
        write_response(&mut local, response, &abort).await.unwrap();
        drop(local);

        let (preamble, body) = read_back(remote, MessageKind::Response).await;
        assert_eq!(preamble.status(), Some(StatusCode::CREATED));
        assert_eq!(preamble.headers.get_str(header::TRANSFER_ENCODING), Some("chunked"));
        assert_eq!(body, b"first,second");
    }

    #[tokio::test]
    async fn empty_body_reads_back() {
        let (mut local, remote) = stream_pair("/t", "a", "b");
        let abort = local.abort_handle();
        write_response(&mut local, Response::ok(), &abort).await.unwrap();
        drop(local);

        let (preamble, body) = read_back(remote, MessageKind::Response).await;
        assert_eq!(preamble.status(), Some(StatusCode::OK));
        assert_eq!(preamble.headers.get_str(header::CONTENT_LENGTH), Some("0"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn head_response_keeps_length_without_body() {
        let (mut local, mut remote) = stream_pair("/t", "a", "b");
        let abort = local.abort_handle();
        let response = Response::text(StatusCode::OK, "ok");
        write_response_for(&mut local, response, &Method::HEAD, &abort).await.unwrap();
        drop(local);

        let mut out = Vec::new();
        remote.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("content-length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn bare_status_line() {
        assert_eq!(
            bare_status(StatusCode::BAD_REQUEST),
            b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n".to_vec()
        );
    }
}
