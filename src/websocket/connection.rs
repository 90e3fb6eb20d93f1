//! A live WebSocket over a stream.
//!
//! One driver task owns the stream halves. It reads frames, answers pings,
//! reassembles fragmented messages and performs the close handshake. User
//! calls talk to it through a command channel, and everything it observes
//! is published to the connection's own subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

use crate::net::{BoxedReader, BoxedWriter, StreamAbort, StreamId, StreamParts};
use crate::observability::metrics::HttpMetrics;
use crate::websocket::error::{close_code, WebSocketError};
use crate::websocket::frame::{parse_close_payload, Frame, FrameCodec, OpCode, Role};

/// How long to wait for the peer's close frame after sending ours.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Events kept for a connection nobody has subscribed to yet.
const MAX_BACKLOG: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::new(OpCode::Text, text),
            Message::Binary(data) => Frame::new(OpCode::Binary, data),
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
    /// Both sides exchanged close frames.
    pub was_clean: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebSocketEvent {
    Open,
    Message(Message),
    Close(CloseEvent),
    Error(String),
}

/// Subscription to a connection's events.
pub struct Events {
    rx: mpsc::UnboundedReceiver<WebSocketEvent>,
}

impl Events {
    /// Next event; `None` once the connection is gone and drained.
    pub async fn recv(&mut self) -> Option<WebSocketEvent> {
        self.rx.recv().await
    }

    /// Next data message, skipping other events. `None` after close.
    pub async fn next_message(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await? {
                WebSocketEvent::Message(message) => return Some(message),
                WebSocketEvent::Close(_) => return None,
                WebSocketEvent::Open | WebSocketEvent::Error(_) => {}
            }
        }
    }

    /// Wait for the close event.
    pub async fn closed(&mut self) -> Option<CloseEvent> {
        loop {
            if let WebSocketEvent::Close(event) = self.rx.recv().await? {
                return Some(event);
            }
        }
    }
}

enum Command {
    Frame { frame: Frame, accounted: usize },
    Close { code: u16, reason: String },
}

/// Events published before anyone subscribed wait in `backlog` and go to
/// the first subscriber. The oldest are dropped past [`MAX_BACKLOG`].
#[derive(Default)]
struct Listeners {
    subscribers: Vec<mpsc::UnboundedSender<WebSocketEvent>>,
    backlog: VecDeque<WebSocketEvent>,
    dropped: usize,
}

struct Shared {
    id: StreamId,
    role: Role,
    url: String,
    protocol: Option<String>,
    state: watch::Sender<ReadyState>,
    buffered: AtomicUsize,
    listeners: Mutex<Listeners>,
    close_dispatched: AtomicBool,
}

impl Shared {
    fn dispatch(&self, event: WebSocketEvent) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.subscribers.retain(|tx| !tx.is_closed());
        if listeners.subscribers.is_empty() {
            if listeners.backlog.len() >= MAX_BACKLOG {
                listeners.backlog.pop_front();
                listeners.dropped += 1;
                if listeners.dropped == 1 {
                    tracing::warn!(
                        stream_id = %self.id,
                        limit = MAX_BACKLOG,
                        "WebSocket has no subscriber, dropping oldest events"
                    );
                }
            }
            listeners.backlog.push_back(event);
            return;
        }
        for tx in &listeners.subscribers {
            let _ = tx.send(event.clone());
        }
    }

    fn finish(&self, event: CloseEvent) {
        self.state.send_replace(ReadyState::Closed);
        if !self.close_dispatched.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                stream_id = %self.id,
                code = event.code,
                was_clean = event.was_clean,
                "WebSocket closed"
            );
            self.dispatch(WebSocketEvent::Close(event));
        }
    }
}

/// Handle to a WebSocket connection. Clones share the connection; once the
/// last clone is dropped the connection closes with 1001.
#[derive(Clone)]
pub struct WebSocket {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl WebSocket {
    /// Start a connection on a stream whose handshake has completed.
    /// `buffered` holds bytes already read past the handshake.
    pub(crate) fn spawn(
        parts: StreamParts,
        buffered: BytesMut,
        role: Role,
        url: impl Into<String>,
        protocol: Option<String>,
        max_message_size: usize,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ReadyState::Connecting);
        let shared = Arc::new(Shared {
            id: parts.id,
            role,
            url: url.into(),
            protocol,
            state,
            buffered: AtomicUsize::new(0),
            listeners: Mutex::new(Listeners::default()),
            close_dispatched: AtomicBool::new(false),
        });

        let driver = Driver {
            shared: Arc::clone(&shared),
            reader: parts.reader,
            writer: parts.writer,
            abort: parts.abort,
            codec: FrameCodec::new(role, max_message_size),
            buf: buffered,
            commands: commands_rx,
            detached: false,
            fragments: None,
            max_message_size,
            close_sent: false,
            close_deadline: None,
        };

        shared.state.send_replace(ReadyState::Open);
        shared.dispatch(WebSocketEvent::Open);
        tracing::debug!(stream_id = %shared.id, role = ?role, "WebSocket open");
        tokio::spawn(driver.run());

        Self {
            shared,
            commands: commands_tx,
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.shared.state.borrow()
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Target path the connection was opened on.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Negotiated subprotocol.
    pub fn protocol(&self) -> Option<&str> {
        self.shared.protocol.as_deref()
    }

    /// Bytes accepted by [`send`](Self::send) but not yet written.
    pub fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> Events {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.shared.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if listeners.subscribers.is_empty() {
            for event in listeners.backlog.drain(..) {
                let _ = tx.send(event);
            }
        }
        listeners.subscribers.push(tx);
        Events { rx }
    }

    /// Queue a message. Fails unless the connection is open.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), WebSocketError> {
        if self.ready_state() != ReadyState::Open {
            return Err(WebSocketError::NotOpen);
        }
        let message = message.into();
        let accounted = message.len();
        self.shared.buffered.fetch_add(accounted, Ordering::SeqCst);
        let command = Command::Frame {
            frame: message.into_frame(),
            accounted,
        };
        if self.commands.send(command).is_err() {
            self.shared.buffered.fetch_sub(accounted, Ordering::SeqCst);
            return Err(WebSocketError::NotOpen);
        }
        HttpMetrics::websocket_message("out");
        Ok(())
    }

    /// Start the close handshake. A no-op once closing has begun.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), WebSocketError> {
        if !close_code::is_sendable(code) {
            return Err(WebSocketError::InvalidCloseCode(code));
        }
        let started = self.shared.state.send_if_modified(|state| match state {
            ReadyState::Connecting | ReadyState::Open => {
                *state = ReadyState::Closing;
                true
            }
            ReadyState::Closing | ReadyState::Closed => false,
        });
        if started {
            let _ = self.commands.send(Command::Close {
                code,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Wait until the connection reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == ReadyState::Closed).await;
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("stream_id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("url", &self.shared.url)
            .field("state", &self.ready_state())
            .finish()
    }
}

struct Driver {
    shared: Arc<Shared>,
    reader: BoxedReader,
    writer: BoxedWriter,
    abort: StreamAbort,
    codec: FrameCodec,
    buf: BytesMut,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Every handle is gone; nothing more will be sent.
    detached: bool,
    fragments: Option<(OpCode, BytesMut)>,
    max_message_size: usize,
    close_sent: bool,
    close_deadline: Option<Instant>,
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn abnormal(reason: &str) -> CloseEvent {
    CloseEvent {
        code: close_code::ABNORMAL,
        reason: reason.to_string(),
        was_clean: false,
    }
}

impl Driver {
    async fn run(mut self) {
        let event = self.drive().await;
        self.abort.abort();
        self.shared.finish(event);
    }

    async fn drive(&mut self) -> CloseEvent {
        loop {
            loop {
                match self.codec.decode(&mut self.buf) {
                    Ok(Some(frame)) => {
                        if let Some(event) = self.on_frame(frame).await {
                            return event;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => return self.fail(err).await,
                }
            }

            tokio::select! {
                command = self.commands.recv(), if !self.detached => match command {
                    Some(Command::Frame { frame, accounted }) => {
                        let written = self.write_frame(frame).await;
                        self.shared.buffered.fetch_sub(accounted, Ordering::SeqCst);
                        if let Err(err) = written {
                            self.shared.dispatch(WebSocketEvent::Error(err.to_string()));
                            return abnormal("write failed");
                        }
                    }
                    Some(Command::Close { code, reason }) => {
                        if !self.close_sent {
                            if self.write_frame(Frame::close(code, &reason)).await.is_err() {
                                return abnormal("write failed");
                            }
                            self.close_sent = true;
                            self.close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
                        }
                    }
                    None => {
                        self.detached = true;
                        if !self.close_sent {
                            tracing::debug!(stream_id = %self.shared.id, "Last WebSocket handle dropped");
                            self.shared.state.send_replace(ReadyState::Closing);
                            if self.write_frame(Frame::close(close_code::GOING_AWAY, "")).await.is_err() {
                                return abnormal("write failed");
                            }
                            self.close_sent = true;
                            self.close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
                        }
                    }
                },
                read = self.reader.read_buf(&mut self.buf) => match read {
                    Ok(0) => return abnormal("stream ended"),
                    Ok(_) => {}
                    Err(err) => {
                        self.shared.dispatch(WebSocketEvent::Error(err.to_string()));
                        return abnormal("read failed");
                    }
                },
                _ = until(self.close_deadline) => return abnormal("close handshake timed out"),
            }
        }
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), WebSocketError> {
        let mut out = BytesMut::new();
        self.codec.encode(frame, &mut out)?;
        self.writer.write_all(&out).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Handle one frame. Returns the close event when the connection ends.
    async fn on_frame(&mut self, frame: Frame) -> Option<CloseEvent> {
        match frame.opcode {
            OpCode::Ping => {
                if self.write_frame(Frame::new(OpCode::Pong, frame.payload)).await.is_err() {
                    return Some(abnormal("write failed"));
                }
                None
            }
            OpCode::Pong => None,
            OpCode::Close => {
                let (code, reason) = match parse_close_payload(&frame.payload) {
                    Ok(parsed) => parsed,
                    Err(err) => return Some(self.fail(err).await),
                };
                if !self.close_sent {
                    self.close_sent = true;
                    // The peer may already be gone; its close frame is what counts.
                    let _ = self.write_frame(Frame::close(code, "")).await;
                }
                self.shared.state.send_replace(ReadyState::Closing);
                Some(CloseEvent {
                    code,
                    reason,
                    was_clean: true,
                })
            }
            OpCode::Text | OpCode::Binary => {
                if self.fragments.is_some() {
                    return Some(self.fail(WebSocketError::Protocol("expected continuation frame")).await);
                }
                if frame.fin {
                    return self.deliver(frame.opcode, frame.payload).await;
                }
                self.fragments = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                None
            }
            OpCode::Continuation => {
                let Some((opcode, mut data)) = self.fragments.take() else {
                    return Some(self.fail(WebSocketError::Protocol("unexpected continuation frame")).await);
                };
                if data.len() + frame.payload.len() > self.max_message_size {
                    let limit = self.max_message_size;
                    return Some(self.fail(WebSocketError::MessageTooBig { limit }).await);
                }
                data.extend_from_slice(&frame.payload);
                if frame.fin {
                    return self.deliver(opcode, data.freeze()).await;
                }
                self.fragments = Some((opcode, data));
                None
            }
        }
    }

    async fn deliver(&mut self, opcode: OpCode, payload: Bytes) -> Option<CloseEvent> {
        let message = if opcode == OpCode::Text {
            match String::from_utf8(payload.to_vec()) {
                Ok(text) => Message::Text(text),
                Err(_) => return Some(self.fail(WebSocketError::InvalidUtf8).await),
            }
        } else {
            Message::Binary(payload)
        };
        HttpMetrics::websocket_message("in");
        self.shared.dispatch(WebSocketEvent::Message(message));
        None
    }

    /// Close locally after a protocol failure.
    async fn fail(&mut self, err: WebSocketError) -> CloseEvent {
        let code = err.close_code();
        tracing::debug!(stream_id = %self.shared.id, code, error = %err, "Closing WebSocket on error");
        if !self.close_sent {
            self.close_sent = true;
            let _ = self.write_frame(Frame::close(code, &err.to_string())).await;
        }
        CloseEvent {
            code,
            reason: err.to_string(),
            was_clean: false,
        }
    }
}
