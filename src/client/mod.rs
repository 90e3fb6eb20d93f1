//! HTTP client over peer streams.
//!
//! # Data Flow
//! ```text
//! fetch(peer, request)
//!     → Host / User-Agent defaults
//!     → [peer auth] cached token, or OPTIONS handshake
//!     → Transport::open_stream(peer, /http/1.1)
//!     → write_request → read response preamble → streamed body
//!     → [peer auth] 401: forget token, handshake, retry once
//!
//! connect(peer, target)
//!     → same auth step → upgrade request → verify 101 → WebSocket
//! ```
//!
//! # Design Decisions
//! - One request per stream; nothing is pooled
//! - Every call is bounded by a timeout and an optional cancellation token
//! - Authenticated requests buffer their body so the retry can resend it

pub mod error;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header;
use http::{Method, StatusCode};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthError, AuthToken, PeerId, PeerIdAuthClient, AUTHENTICATION_INFO};
use crate::http::body::incoming_body;
use crate::http::{
    read_preamble, write_request, Body, HeaderSet, MessageKind, MessagePreamble, PreambleDecoder, Request, Response,
};
use crate::net::{Stream, StreamParts, Transport};
use crate::routing::{ProtocolMap, HTTP_PROTOCOL, WELL_KNOWN_PROTOCOLS};
use crate::websocket::handshake::{client_request, generate_key, verify_response};
use crate::websocket::{Role, WebSocket};

pub use error::ClientError;

pub const DEFAULT_USER_AGENT: &str = concat!("p2p-http/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_PROTOCOL_MAP_SIZE: usize = 64 * 1024;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the client's default timeout.
    pub timeout: Option<Duration>,
    /// Abandons the request and aborts its stream when cancelled.
    pub cancel: Option<CancellationToken>,
    /// Run the peer-id handshake and send a bearer token.
    pub authenticate_server: bool,
    /// Expected server identity; a different proven identity fails with
    /// `InvalidPeer`.
    pub peer_id: Option<PeerId>,
}

impl RequestOptions {
    pub fn authenticated() -> Self {
        Self {
            authenticate_server: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_peer_id(mut self, peer: PeerId) -> Self {
        self.peer_id = Some(peer);
        self
    }
}

/// Options for opening a WebSocket.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Timeout, cancellation and authentication for the upgrade request.
    pub request: RequestOptions,
    /// Subprotocols to offer, in preference order.
    pub protocols: Vec<String>,
    /// Extra headers for the upgrade request.
    pub headers: HeaderSet,
}

/// Buffered request parts, replayable for the auth retry.
struct Replayable {
    method: Method,
    target: String,
    headers: HeaderSet,
    body: Bytes,
}

impl Replayable {
    fn build(&self, authorization: Option<&str>) -> Result<Request, ClientError> {
        let mut request = Request::new(self.method.clone(), self.target.clone()).with_body(self.body.clone());
        request.headers = self.headers.clone();
        if let Some(authorization) = authorization {
            request.headers.set(header::AUTHORIZATION.as_str(), authorization)?;
        }
        Ok(request)
    }
}

#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    /// Signs handshakes and caches bearer tokens per server.
    auth: Option<Arc<PeerIdAuthClient>>,
    user_agent: String,
    /// Default per-request timeout.
    timeout: Duration,
    /// Largest response preamble accepted.
    max_header_size: usize,
    /// Largest WebSocket message accepted on opened sockets.
    max_message_size: usize,
}

impl HttpClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            auth: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            max_header_size: 81_920,
            max_message_size: 10 * 1024 * 1024,
        }
    }

    pub fn with_auth(mut self, auth: Arc<PeerIdAuthClient>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = limit;
        self
    }

    pub fn with_max_header_size(mut self, limit: usize) -> Self {
        self.max_header_size = limit;
        self
    }

    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    pub fn auth(&self) -> Option<&Arc<PeerIdAuthClient>> {
        self.auth.as_ref()
    }

    /// Send `request` to `peer` and return the response. The body streams
    /// from the peer as it is read.
    pub async fn fetch(&self, peer: &str, request: Request, options: &RequestOptions) -> Result<Response, ClientError> {
        self.bounded(options, self.fetch_inner(peer, request, options)).await
    }

    /// Open a WebSocket to `target` on `peer`.
    pub async fn connect(&self, peer: &str, target: &str, options: &ConnectOptions) -> Result<WebSocket, ClientError> {
        self.bounded(&options.request, self.connect_inner(peer, target, options))
            .await
    }

    /// Fetch the peer's discovery document.
    pub async fn get_protocol_map(&self, peer: &str, options: &RequestOptions) -> Result<ProtocolMap, ClientError> {
        let options = RequestOptions {
            authenticate_server: false,
            ..options.clone()
        };
        let response = self.fetch(peer, Request::get(WELL_KNOWN_PROTOCOLS), &options).await?;
        if response.status != StatusCode::OK {
            return Err(ClientError::UnexpectedStatus(response.status));
        }
        let body = response.body.collect_limited(MAX_PROTOCOL_MAP_SIZE).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Path the peer serves `protocol` on.
    pub async fn get_protocol_path(
        &self,
        peer: &str,
        protocol: &str,
        options: &RequestOptions,
    ) -> Result<String, ClientError> {
        let map = self.get_protocol_map(peer, options).await?;
        map.get(protocol)
            .map(|entry| entry.path.clone())
            .ok_or_else(|| ClientError::ProtocolNotSupported {
                peer: peer.to_string(),
                protocol: protocol.to_string(),
            })
    }

    /// Look up `protocol`'s path, then send `request` beneath it. The
    /// request target is taken relative to that path.
    pub async fn fetch_protocol(
        &self,
        peer: &str,
        protocol: &str,
        mut request: Request,
        options: &RequestOptions,
    ) -> Result<Response, ClientError> {
        let path = self.get_protocol_path(peer, protocol, options).await?;
        request.target = join_path(&path, &request.target);
        self.fetch(peer, request, options).await
    }

    pub async fn connect_protocol(
        &self,
        peer: &str,
        protocol: &str,
        options: &ConnectOptions,
    ) -> Result<WebSocket, ClientError> {
        let path = self.get_protocol_path(peer, protocol, &options.request).await?;
        self.connect(peer, &path, options).await
    }

    async fn bounded<T, F>(&self, options: &RequestOptions, work: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        let limit = options.timeout.unwrap_or(self.timeout);
        let cancel = options.cancel.clone().unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = timeout(limit, work) => result.map_err(|_| ClientError::Timeout(limit))?,
        }
    }

    async fn fetch_inner(&self, peer: &str, mut request: Request, options: &RequestOptions) -> Result<Response, ClientError> {
        let host = resolve_host(peer, &request);
        self.apply_defaults(&host, &mut request.headers)?;
        if !options.authenticate_server {
            return self.send(peer, request).await;
        }

        let auth = self.auth.clone().ok_or(ClientError::AuthNotConfigured)?;
        let body = std::mem::replace(&mut request.body, Body::Empty).collect().await?;
        let replay = Replayable {
            method: request.method,
            target: request.target,
            headers: request.headers,
            body,
        };
        let key = PeerIdAuthClient::cache_key(&host, options.peer_id.as_ref());

        let token = match auth.cached(&key) {
            Some(token) => token,
            None => self.handshake(&auth, peer, &host, &key, &replay, options).await?,
        };
        let response = self.send(peer, replay.build(Some(&token.authorization))?).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            accept_bearer(&auth, &key, &response.headers);
            return Ok(response);
        }

        tracing::debug!(peer, host = %host, "Token rejected, re-authenticating");
        auth.forget(&key);
        let token = self.handshake(&auth, peer, &host, &key, &replay, options).await?;
        let response = self.send(peer, replay.build(Some(&token.authorization))?).await?;
        accept_bearer(&auth, &key, &response.headers);
        Ok(response)
    }

    /// Run the challenge round trip against the request's own target.
    async fn handshake(
        &self,
        auth: &PeerIdAuthClient,
        peer: &str,
        host: &str,
        key: &str,
        replay: &Replayable,
        options: &RequestOptions,
    ) -> Result<AuthToken, ClientError> {
        let pending = auth.begin();
        let mut challenge = Request::new(Method::OPTIONS, replay.target.clone());
        challenge.headers = replay.headers.clone();
        challenge.headers.remove(header::CONTENT_LENGTH);
        challenge.headers.remove(header::TRANSFER_ENCODING);
        challenge
            .headers
            .set(header::AUTHORIZATION.as_str(), &pending.authorization)?;

        let response = self.send(peer, challenge).await?;
        let www_authenticate = response
            .headers
            .get_str(header::WWW_AUTHENTICATE)
            .ok_or(AuthError::MissingAuthHeader("www-authenticate"))?
            .to_string();
        let (server, authorization) = auth.respond(host, &pending, &www_authenticate).await?;

        if let Some(expected) = &options.peer_id {
            if *expected != server {
                tracing::warn!(peer, expected = %expected, proven = %server, "Server identity mismatch");
                return Err(AuthError::InvalidPeer.into());
            }
        }
        tracing::debug!(peer, host, server = %server, "Server authenticated");
        Ok(auth.store(key, server, authorization))
    }

    async fn connect_inner(&self, peer: &str, target: &str, options: &ConnectOptions) -> Result<WebSocket, ClientError> {
        let host = resolve_host(peer, &Request::get(target));
        let mut headers = options.headers.clone();
        self.apply_defaults(&host, &mut headers)?;

        if !options.request.authenticate_server {
            return self.upgrade(peer, target, &host, headers, &options.protocols, None).await;
        }

        let auth = self.auth.clone().ok_or(ClientError::AuthNotConfigured)?;
        let key = PeerIdAuthClient::cache_key(&host, options.request.peer_id.as_ref());
        let replay = Replayable {
            method: Method::GET,
            target: target.to_string(),
            headers: headers.clone(),
            body: Bytes::new(),
        };
        let token = match auth.cached(&key) {
            Some(token) => token,
            None => self.handshake(&auth, peer, &host, &key, &replay, &options.request).await?,
        };
        let credentials = Some((auth.as_ref(), key.as_str(), &token));
        let attempt = self
            .upgrade(peer, target, &host, headers.clone(), &options.protocols, credentials)
            .await;
        match attempt {
            Err(ClientError::UnexpectedStatus(StatusCode::UNAUTHORIZED)) => {
                auth.forget(&key);
                let token = self.handshake(&auth, peer, &host, &key, &replay, &options.request).await?;
                let credentials = Some((auth.as_ref(), key.as_str(), &token));
                self.upgrade(peer, target, &host, headers, &options.protocols, credentials)
                    .await
            }
            other => other,
        }
    }

    async fn upgrade(
        &self,
        peer: &str,
        target: &str,
        host: &str,
        mut headers: HeaderSet,
        protocols: &[String],
        auth: Option<(&PeerIdAuthClient, &str, &AuthToken)>,
    ) -> Result<WebSocket, ClientError> {
        if let Some((_, _, token)) = auth {
            headers.set(header::AUTHORIZATION.as_str(), &token.authorization)?;
        }
        let key = generate_key();
        let request = client_request(target, host, &key, protocols, headers)?;

        let stream = self.transport.open_stream(peer, HTTP_PROTOCOL).await?;
        let mut parts = stream.into_parts();
        if let Err(error) = write_request(&mut parts.writer, request, &parts.abort).await {
            parts.abort.abort();
            return Err(error.into());
        }
        let mut buf = BytesMut::with_capacity(1024);
        let preamble = self.read_head(&mut parts, &mut buf).await?;

        if preamble.status() == Some(StatusCode::UNAUTHORIZED) {
            parts.abort.abort();
            return Err(ClientError::UnexpectedStatus(StatusCode::UNAUTHORIZED));
        }
        let protocol = match verify_response(&preamble, &key) {
            Ok(protocol) => protocol,
            Err(error) => {
                parts.abort.abort();
                return Err(error.into());
            }
        };
        if let Some((auth, cache_key, _)) = auth {
            accept_bearer(auth, cache_key, &preamble.headers);
        }

        tracing::debug!(peer, target, stream_id = %parts.id, "WebSocket connected");
        Ok(WebSocket::spawn(parts, buf, Role::Client, target, protocol, self.max_message_size))
    }

    /// One request on a fresh stream.
    async fn send(&self, peer: &str, request: Request) -> Result<Response, ClientError> {
        let method = request.method.clone();
        let target = request.target.clone();
        let stream: Stream = self.transport.open_stream(peer, HTTP_PROTOCOL).await?;
        let mut parts = stream.into_parts();

        if let Err(error) = write_request(&mut parts.writer, request, &parts.abort).await {
            parts.abort.abort();
            return Err(error.into());
        }
        let mut buf = BytesMut::with_capacity(4096);
        let preamble = self.read_head(&mut parts, &mut buf).await?;
        let kind = match preamble.body_kind(Some(&method)) {
            Ok(kind) => kind,
            Err(error) => {
                parts.abort.abort();
                return Err(error.into());
            }
        };

        let status = preamble.status().map(|s| s.as_u16()).unwrap_or_default();
        tracing::debug!(peer, method = %method, target = %target, status, "Response received");
        let body = incoming_body(parts.reader, buf, kind);
        Ok(Response::from_preamble(preamble, body)?)
    }

    async fn read_head(&self, parts: &mut StreamParts, buf: &mut BytesMut) -> Result<MessagePreamble, ClientError> {
        let mut decoder = PreambleDecoder::new(MessageKind::Response, self.max_header_size);
        match read_preamble(&mut parts.reader, buf, &mut decoder).await {
            Ok(preamble) => Ok(preamble),
            Err(error) => {
                parts.abort.abort();
                Err(error.into())
            }
        }
    }

    /// Fill in `Host` and `User-Agent` unless already set.
    fn apply_defaults(&self, host: &str, headers: &mut HeaderSet) -> Result<(), ClientError> {
        if !headers.contains_key(header::HOST) {
            headers.set(header::HOST.as_str(), host)?;
        }
        if !headers.contains_key(header::USER_AGENT) {
            headers.set(header::USER_AGENT.as_str(), &self.user_agent)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

fn accept_bearer(auth: &PeerIdAuthClient, key: &str, headers: &HeaderSet) {
    if let Some(info) = headers.get_str(AUTHENTICATION_INFO) {
        if let Err(error) = auth.accept_bearer(key, info) {
            tracing::debug!(error = %error, "Ignoring malformed Authentication-Info");
        }
    }
}

/// The host a request is addressed to: its own Host or authority, else the
/// peer.
fn resolve_host(peer: &str, request: &Request) -> String {
    request.host().unwrap_or_else(|| peer.to_string())
}

/// Resolve `target` beneath a protocol mount path.
fn join_path(base: &str, target: &str) -> String {
    let base = base.trim_end_matches('/');
    match target {
        "" | "/" => {
            if base.is_empty() {
                "/".to_string()
            } else {
                base.to_string()
            }
        }
        t if t.starts_with('/') => format!("{base}{t}"),
        t if t.starts_with('?') => format!("{base}{t}"),
        t => format!("{base}/{t}"),
    }
}
