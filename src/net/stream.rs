//! The byte stream abstraction every protocol in this crate runs over.
//!
//! A [`Stream`] is an ordered, reliable, bidirectional pipe bound to a single
//! protocol. Writers may half-close it (`shutdown`) to signal the end of
//! their data, or abort it to tell the other side the exchange is
//! incomplete. After an abort, reads drain whatever already arrived and then
//! fail with `ConnectionReset`; writes fail immediately.

use futures_util::task::AtomicWaker;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::net::connection::StreamId;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which end of a pipe a reader belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Dialer,
    Listener,
}

/// Shared reset flag for the two ends of a stream.
#[derive(Debug, Default)]
pub struct AbortSignal {
    aborted: AtomicBool,
    dialer_waker: AtomicWaker,
    listener_waker: AtomicWaker,
}

impl AbortSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            self.dialer_waker.wake();
            self.listener_waker.wake();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn register(&self, side: Side, cx: &Context<'_>) {
        match side {
            Side::Dialer => self.dialer_waker.register(cx.waker()),
            Side::Listener => self.listener_waker.register(cx.waker()),
        }
    }
}

fn reset_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
}

/// Reader that surfaces an abort once buffered data is exhausted.
pub(crate) struct AbortableReader<R> {
    inner: R,
    signal: Arc<AbortSignal>,
    side: Side,
}

impl<R> AbortableReader<R> {
    pub(crate) fn new(inner: R, signal: Arc<AbortSignal>, side: Side) -> Self {
        Self { inner, signal, side }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for AbortableReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before && this.signal.is_aborted() => {
                Poll::Ready(Err(reset_error()))
            }
            Poll::Pending => {
                this.signal.register(this.side, cx);
                if this.signal.is_aborted() {
                    Poll::Ready(Err(reset_error()))
                } else {
                    Poll::Pending
                }
            }
            other => other,
        }
    }
}

/// Writer that refuses to write after an abort.
pub(crate) struct AbortableWriter<W> {
    inner: W,
    signal: Arc<AbortSignal>,
}

impl<W> AbortableWriter<W> {
    pub(crate) fn new(inner: W, signal: Arc<AbortSignal>) -> Self {
        Self { inner, signal }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for AbortableWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.signal.is_aborted() {
            return Poll::Ready(Err(reset_error()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.signal.is_aborted() {
            return Poll::Ready(Err(reset_error()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.signal.is_aborted() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Cloneable handle that aborts a stream from anywhere.
#[derive(Debug, Clone)]
pub struct StreamAbort {
    signal: Arc<AbortSignal>,
    id: StreamId,
}

impl StreamAbort {
    pub fn abort(&self) {
        if !self.signal.is_aborted() {
            tracing::debug!(stream_id = %self.id, "Aborting stream");
        }
        self.signal.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }
}

/// The owned pieces of a stream, for tasks that read and write concurrently.
pub struct StreamParts {
    pub id: StreamId,
    pub protocol: String,
    pub remote: String,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub abort: StreamAbort,
}

/// An ordered, reliable, bidirectional byte stream bound to one protocol.
pub struct Stream {
    id: StreamId,
    protocol: String,
    remote: String,
    reader: BoxedReader,
    writer: BoxedWriter,
    abort: StreamAbort,
}

impl Stream {
    pub(crate) fn new(
        protocol: impl Into<String>,
        remote: impl Into<String>,
        reader: BoxedReader,
        writer: BoxedWriter,
        signal: Arc<AbortSignal>,
    ) -> Self {
        let id = StreamId::new();
        Self {
            id,
            protocol: protocol.into(),
            remote: remote.into(),
            reader,
            writer,
            abort: StreamAbort { signal, id },
        }
    }

    /// Wrap any duplex I/O object as a stream. Aborting it only affects the
    /// local side.
    pub fn from_io<T>(io: T, protocol: impl Into<String>, remote: impl Into<String>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let signal = AbortSignal::new();
        let (read_half, write_half) = tokio::io::split(io);
        Self::new(
            protocol,
            remote,
            Box::new(AbortableReader::new(read_half, Arc::clone(&signal), Side::Listener)),
            Box::new(AbortableWriter::new(write_half, Arc::clone(&signal))),
            signal,
        )
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Address or name of the peer on the other end.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn abort_handle(&self) -> StreamAbort {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn into_parts(self) -> StreamParts {
        StreamParts {
            id: self.id,
            protocol: self.protocol,
            remote: self.remote,
            reader: self.reader,
            writer: self.writer,
            abort: self.abort,
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
