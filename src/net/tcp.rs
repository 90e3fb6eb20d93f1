//! TCP transport.
//!
//! Each stream is its own TCP connection. The dialer opens with a single
//! protocol-select line, `<protocol>\n`; the listener echoes the line back
//! to accept or answers `na\n` when nothing handles that protocol. After
//! that the connection carries raw protocol bytes.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::net::connection::StreamTracker;
use crate::net::listener::Listener;
use crate::net::stream::{AbortSignal, AbortableReader, AbortableWriter, Side, Stream};
use crate::net::transport::{ProtocolHandlers, StreamHandler, Transport, TransportError};

const MAX_SELECT_LINE: usize = 1024;
const NOT_AVAILABLE: &str = "na";
const SELECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials and serves streams over TCP.
#[derive(Clone, Default)]
pub struct TcpTransport {
    handlers: ProtocolHandlers,
    tracker: StreamTracker,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self) -> &StreamTracker {
        &self.tracker
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(&self, listener: Listener, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("TCP transport stopped accepting");
                    return;
                }
                accepted = listener.accept() => accepted,
            };

            let (socket, addr, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            };

            let handlers = self.handlers.clone();
            let tracker = self.tracker.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match negotiate_inbound(socket, &addr.to_string(), &handlers).await {
                    Ok(Some(stream)) => {
                        let _guard = tracker.track(stream.id());
                        if let Some(handler) = handlers.get(stream.protocol()) {
                            handler.on_stream(stream).await;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::debug!(peer_addr = %addr, error = %e, "Protocol select failed"),
                }
            });
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open_stream(&self, peer: &str, protocol: &str) -> Result<Stream, TransportError> {
        let mut socket = TcpStream::connect(peer)
            .await
            .map_err(|_| TransportError::Unreachable(peer.to_string()))?;
        socket.set_nodelay(true)?;

        socket.write_all(format!("{protocol}\n").as_bytes()).await?;
        let answer = tokio::time::timeout(SELECT_TIMEOUT, read_select_line(&mut socket))
            .await
            .map_err(|_| TransportError::Negotiation("timed out waiting for protocol ack".into()))??;

        if answer == NOT_AVAILABLE {
            return Err(TransportError::ProtocolNotSupported {
                peer: peer.to_string(),
                protocol: protocol.to_string(),
            });
        }
        if answer != protocol {
            return Err(TransportError::Negotiation(format!(
                "expected {protocol}, peer answered {answer}"
            )));
        }

        Ok(wrap_socket(socket, protocol, peer, Side::Dialer))
    }

    fn register_protocol_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        self.handlers.insert(protocol, handler);
    }

    fn unregister_protocol_handler(&self, protocol: &str) {
        self.handlers.remove(protocol);
    }
}

async fn negotiate_inbound(
    mut socket: TcpStream,
    remote: &str,
    handlers: &ProtocolHandlers,
) -> Result<Option<Stream>, TransportError> {
    socket.set_nodelay(true)?;
    let protocol = tokio::time::timeout(SELECT_TIMEOUT, read_select_line(&mut socket))
        .await
        .map_err(|_| TransportError::Negotiation("timed out waiting for protocol".into()))??;

    if !handlers.contains(&protocol) {
        tracing::debug!(peer_addr = %remote, protocol = %protocol, "No handler for protocol");
        socket.write_all(format!("{NOT_AVAILABLE}\n").as_bytes()).await?;
        let _ = socket.shutdown().await;
        return Ok(None);
    }

    socket.write_all(format!("{protocol}\n").as_bytes()).await?;
    Ok(Some(wrap_socket(socket, &protocol, remote, Side::Listener)))
}

/// Read one `\n`-terminated line without consuming anything past it.
async fn read_select_line<R: AsyncRead + Unpin>(io: &mut R) -> Result<String, TransportError> {
    let mut line = Vec::new();
    loop {
        let byte = io.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_SELECT_LINE {
            return Err(TransportError::Negotiation("protocol line too long".into()));
        }
        line.push(byte);
    }
    String::from_utf8(line).map_err(|_| TransportError::Negotiation("protocol line is not UTF-8".into()))
}

fn wrap_socket(socket: TcpStream, protocol: &str, remote: &str, side: Side) -> Stream {
    let signal = AbortSignal::new();
    let (read_half, write_half) = socket.into_split();
    Stream::new(
        protocol,
        remote,
        Box::new(AbortableReader::new(read_half, Arc::clone(&signal), side)),
        Box::new(AbortableWriter::new(write_half, Arc::clone(&signal))),
        signal,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;

    struct Greeter;

    #[async_trait]
    impl StreamHandler for Greeter {
        async fn on_stream(&self, mut stream: Stream) {
            let _ = stream.write_all(b"hi").await;
            let _ = stream.shutdown().await;
        }
    }

    async fn start() -> (TcpTransport, String, CancellationToken) {
        let listener = Listener::bind(&ListenerConfig {
            bind_address: "127.0.0.1:0".into(),
            max_streams: 8,
        })
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let transport = TcpTransport::new();
        transport.register_protocol_handler("/greet", Arc::new(Greeter));
        let shutdown = CancellationToken::new();
        {
            let transport = transport.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { transport.serve(listener, shutdown).await });
        }
        (transport, addr, shutdown)
    }

    #[tokio::test]
    async fn negotiates_registered_protocol() {
        let (transport, addr, shutdown) = start().await;
        let mut stream = transport.open_stream(&addr, "/greet").await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hi");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn unknown_protocol_is_refused() {
        let (transport, addr, shutdown) = start().await;
        let err = transport.open_stream(&addr, "/nope").await.unwrap_err();
        assert!(matches!(err, TransportError::ProtocolNotSupported { .. }));
        shutdown.cancel();
    }
}
