//! The HTTP protocol handler: one request per inbound stream.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::FutureExt;
use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::auth::PeerIdAuth;
use crate::config::NodeConfig;
use crate::http::body::incoming_body;
use crate::http::{
    read_preamble, write_response, write_response_for, Body, MessageKind, MessagePreamble, ParseError,
    PreambleDecoder, Request,
};
use crate::net::{BoxedWriter, Stream, StreamAbort, StreamHandler, StreamParts, Transport};
use crate::observability::metrics::HttpMetrics;
use crate::routing::dispatch::{DispatchError, Dispatcher, UpgradeTarget};
use crate::routing::registrar::{Registrar, WELL_KNOWN_PROTOCOLS};
use crate::routing::route::RequestContext;
use crate::routing::well_known;
use crate::websocket::handshake::upgrade_response;
use crate::websocket::{close_code, Role, WebSocket};

/// Protocol id HTTP is spoken over.
pub const HTTP_PROTOCOL: &str = "/http/1.1";

/// How long a WebSocket handler may keep running after shutdown closed its
/// socket.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Limits applied to each new stream. Reloadable.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceLimits {
    /// Largest request preamble accepted, in bytes.
    pub max_header_size: usize,
    /// Time allowed for a request preamble to arrive.
    pub header_timeout: Duration,
    /// Default WebSocket message limit for routes without their own.
    pub max_message_size: usize,
    /// Time allowed for a WebSocket upgrade to be negotiated.
    pub upgrade_timeout: Duration,
}

impl ServiceLimits {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            max_header_size: config.http.max_header_size,
            header_timeout: config.http.header_timeout(),
            max_message_size: config.websocket.max_message_size,
            upgrade_timeout: config.websocket.upgrade_timeout(),
        }
    }
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

/// Serves HTTP on inbound streams.
#[derive(Clone)]
pub struct HttpService {
    dispatcher: Dispatcher,
    limits: Arc<ArcSwap<ServiceLimits>>,
    shutdown: CancellationToken,
}

impl HttpService {
    pub fn new(registrar: Arc<Registrar>, auth: Option<PeerIdAuth>, config: &NodeConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(registrar, auth),
            limits: Arc::new(ArcSwap::from_pointee(ServiceLimits::from_config(config))),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie stream tasks to an outer shutdown token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn limits(&self) -> Arc<ServiceLimits> {
        self.limits.load_full()
    }

    /// New limits apply to streams accepted after this call.
    pub fn update_limits(&self, config: &NodeConfig) {
        let limits = ServiceLimits::from_config(config);
        tracing::info!(
            max_header_size = limits.max_header_size,
            max_message_size = limits.max_message_size,
            "HTTP limits updated"
        );
        self.limits.store(Arc::new(limits));
    }

    /// Register as the HTTP protocol handler on `transport`.
    pub fn attach(&self, transport: &dyn Transport) {
        transport.register_protocol_handler(HTTP_PROTOCOL, Arc::new(self.clone()));
    }

    /// Read one request from `stream` and answer it.
    pub async fn serve_stream(&self, stream: Stream) {
        let limits = self.limits.load_full();
        let cancel = self.shutdown.child_token();
        let StreamParts {
            id,
            protocol,
            remote,
            mut reader,
            writer,
            abort,
        } = stream.into_parts();

        let mut buf = BytesMut::with_capacity(4096);
        let mut decoder = PreambleDecoder::new(MessageKind::Request, limits.max_header_size);
        let preamble = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(stream_id = %id, "Shutdown during header parse");
                abort.abort();
                return;
            }
            read = timeout(limits.header_timeout, read_preamble(&mut reader, &mut buf, &mut decoder)) => match read {
                Ok(Ok(preamble)) => preamble,
                Ok(Err(ParseError::Closed)) => return,
                Ok(Err(error)) => {
                    reject_stream(&abort, &error.to_string());
                    return;
                }
                Err(_) => {
                    tracing::debug!(stream_id = %id, timeout = ?limits.header_timeout, "Header timeout");
                    abort.abort();
                    return;
                }
            },
        };

        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("request", %request_id, stream_id = %id, remote = %remote);
        let ctx = RequestContext::new(id, remote.clone(), cancel);

        if preamble.is_websocket_upgrade() {
            let parts = StreamParts {
                id,
                protocol,
                remote,
                reader,
                writer,
                abort,
            };
            self.serve_upgrade(preamble, parts, buf, ctx, &limits)
                .instrument(span)
                .await;
        } else {
            let kind = match preamble.body_kind(None) {
                Ok(kind) => kind,
                Err(error) => {
                    reject_stream(&abort, &error.to_string());
                    return;
                }
            };
            let body = incoming_body(reader, buf, kind);
            self.serve_plain(preamble, body, writer, abort, ctx)
                .instrument(span)
                .await;
        }
    }

    async fn serve_plain(
        &self,
        preamble: MessagePreamble,
        body: Body,
        mut writer: BoxedWriter,
        abort: StreamAbort,
        ctx: RequestContext,
    ) {
        let request = match Request::from_preamble(preamble, body) {
            Ok(request) => request,
            Err(error) => {
                reject_stream(&abort, &error.to_string());
                return;
            }
        };
        tracing::debug!(method = %request.method, path = %request.path(), "Request received");

        let method = request.method.clone();
        let response = self.dispatcher.dispatch(request, ctx).await;
        if let Err(error) = write_response_for(&mut writer, response, &method, &abort).await {
            tracing::debug!(error = %error, "Failed to write response");
            abort.abort();
            return;
        }
        let _ = writer.shutdown().await;
    }

    async fn serve_upgrade(
        &self,
        preamble: MessagePreamble,
        mut parts: StreamParts,
        buffered: BytesMut,
        ctx: RequestContext,
        limits: &ServiceLimits,
    ) {
        let started = Instant::now();
        let request = match Request::from_preamble(preamble, Body::Empty) {
            Ok(request) => request,
            Err(error) => {
                reject_stream(&parts.abort, &error.to_string());
                return;
            }
        };
        let url = request.target.clone();
        let path = request.path().to_string();
        let cancel = ctx.cancel.clone();

        let negotiated = timeout(limits.upgrade_timeout, self.dispatcher.negotiate_upgrade(request, ctx)).await;
        let target = match negotiated {
            Ok(Ok(target)) => target,
            Ok(Err(response)) => {
                tracing::debug!(path = %path, status = response.status.as_u16(), "Upgrade refused");
                HttpMetrics::request_completed("", response.status.as_u16(), started.elapsed().as_secs_f64());
                if write_response(&mut parts.writer, response, &parts.abort).await.is_ok() {
                    let _ = parts.writer.shutdown().await;
                }
                return;
            }
            Err(_) => {
                tracing::debug!(path = %path, "Upgrade timed out");
                parts.abort.abort();
                return;
            }
        };

        let (upgrade, protocol, max_message_size) = match &target {
            UpgradeTarget::WellKnown { upgrade } => (upgrade, WELL_KNOWN_PROTOCOLS.to_string(), limits.max_message_size),
            UpgradeTarget::Route { route, upgrade, .. } => (
                upgrade,
                route.protocol.clone(),
                route.route.max_message_size.unwrap_or(limits.max_message_size),
            ),
        };
        let mut response = match upgrade_response(upgrade) {
            Ok(response) => response,
            Err(error) => {
                let response = DispatchError::UpgradeFailed(error.to_string()).into_response();
                let _ = write_response(&mut parts.writer, response, &parts.abort).await;
                let _ = parts.writer.shutdown().await;
                return;
            }
        };
        let subprotocol = upgrade.protocols.first().cloned();
        if let UpgradeTarget::Route { auth_headers, .. } = &target {
            for (name, value) in auth_headers.iter() {
                response.headers.insert(name.clone(), value.clone());
            }
        }

        if let Err(error) = write_response(&mut parts.writer, response, &parts.abort).await {
            tracing::debug!(error = %error, "Failed to write upgrade response");
            parts.abort.abort();
            return;
        }
        HttpMetrics::request_completed(
            &protocol,
            StatusCode::SWITCHING_PROTOCOLS.as_u16(),
            started.elapsed().as_secs_f64(),
        );
        tracing::debug!(protocol = %protocol, "WebSocket upgraded");

        let socket = WebSocket::spawn(parts, buffered, Role::Server, url, subprotocol, max_message_size);
        match target {
            UpgradeTarget::WellKnown { .. } => {
                well_known::serve_socket(&self.dispatcher.registrar().protocol_map(), &socket);
            }
            UpgradeTarget::Route { route, ctx, .. } => {
                let Some(handler) = route.route.websocket.clone() else {
                    let _ = socket.close(close_code::INTERNAL_ERROR, "");
                    return;
                };
                let run = AssertUnwindSafe(handler.on_connect(socket.clone(), ctx)).catch_unwind();
                tokio::pin!(run);
                let finished = tokio::select! {
                    outcome = &mut run => Some(outcome),
                    _ = cancel.cancelled() => None,
                };
                match finished {
                    Some(Ok(())) => {}
                    Some(Err(_)) => {
                        tracing::error!(protocol = %route.protocol, "WebSocket handler panicked");
                        let _ = socket.close(close_code::INTERNAL_ERROR, "");
                    }
                    None => {
                        // Let the handler see the close before it is dropped.
                        let _ = socket.close(close_code::GOING_AWAY, "server shutting down");
                        if timeout(SHUTDOWN_GRACE, &mut run).await.is_err() {
                            tracing::debug!(protocol = %route.protocol, "WebSocket handler outlived shutdown grace");
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = socket.closed() => {}
            _ = cancel.cancelled() => {
                let _ = socket.close(close_code::GOING_AWAY, "server shutting down");
                socket.closed().await;
            }
        }
    }
}

#[async_trait]
impl StreamHandler for HttpService {
    async fn on_stream(&self, stream: Stream) {
        self.serve_stream(stream).await
    }
}

impl std::fmt::Debug for HttpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpService")
            .field("dispatcher", &self.dispatcher)
            .field("limits", &self.limits.load())
            .finish()
    }
}

fn reject_stream(abort: &StreamAbort, error: &str) {
    HttpMetrics::parse_error();
    tracing::debug!(error, "Malformed request, aborting stream");
    abort.abort();
}
