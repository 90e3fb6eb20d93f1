//! HTTP ping (`/http-ping/1`): echo 32 random bytes and time the round trip.

use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use thiserror::Error;

use crate::client::{ClientError, ConnectOptions, HttpClient, RequestOptions};
use crate::http::{Request, Response};
use crate::routing::{AuthRequirement, HandlerError, Registrar, RequestContext, Route, RouteError};
use crate::websocket::{close_code, Message, WebSocket};

pub const HTTP_PING_PROTOCOL: &str = "/http-ping/1";
pub const PING_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum PingError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("unexpected status {0}")]
    UnexpectedStatus(StatusCode),

    #[error("unexpected response size: {0}")]
    UnexpectedSize(usize),

    #[error("ping body mismatch")]
    Mismatch,

    #[error("socket closed before the echo arrived")]
    Closed,
}

/// Server side: registers the ping route.
#[derive(Debug, Clone)]
pub struct PingService {
    registrar: Arc<Registrar>,
}

impl PingService {
    pub fn new(registrar: Arc<Registrar>) -> Self {
        Self { registrar }
    }

    pub fn route() -> Route {
        Route::websocket(on_socket)
            .with_http(on_request)
            .methods([Method::GET, Method::POST])
            .auth(AuthRequirement::Optional)
    }

    pub fn start(&self) -> Result<(), RouteError> {
        self.registrar.handle(HTTP_PING_PROTOCOL, Self::route())
    }

    pub fn stop(&self) -> Result<(), RouteError> {
        self.registrar.unhandle(HTTP_PING_PROTOCOL)
    }
}

async fn on_request(request: Request, ctx: RequestContext) -> Result<Response, HandlerError> {
    tracing::debug!(peer = ?ctx.peer.as_ref().map(ToString::to_string), "Incoming HTTP ping");
    let body = match request.body.collect_limited(PING_SIZE).await {
        Ok(body) if body.len() == PING_SIZE => body,
        Ok(body) => {
            tracing::debug!(expected = PING_SIZE, got = body.len(), "Wrong ping size");
            return Ok(Response::new(StatusCode::BAD_REQUEST));
        }
        Err(error) => {
            tracing::debug!(error = %error, "Unreadable ping body");
            return Ok(Response::new(StatusCode::BAD_REQUEST));
        }
    };
    Ok(Response::ok()
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"))
        .with_body(body))
}

async fn on_socket(socket: WebSocket, _ctx: RequestContext) {
    let mut events = socket.subscribe();
    let Some(message) = events.next_message().await else {
        return;
    };
    if message.len() != PING_SIZE {
        tracing::debug!(expected = PING_SIZE, got = message.len(), "Wrong ping size");
        let _ = socket.close(close_code::POLICY_VIOLATION, "wrong ping size");
        return;
    }
    let echo = bytes::Bytes::copy_from_slice(message.as_bytes());
    if let Err(error) = socket.send(echo) {
        tracing::debug!(error = %error, "Failed to echo ping");
    }
    let _ = socket.close(close_code::NORMAL, "");
}

/// Ping `peer` over HTTP or WebSocket and return the round-trip time.
pub async fn ping(
    client: &HttpClient,
    peer: &str,
    use_websocket: bool,
    options: &RequestOptions,
) -> Result<Duration, PingError> {
    let path = client.get_protocol_path(peer, HTTP_PING_PROTOCOL, options).await?;
    let payload: [u8; PING_SIZE] = rand::random();

    let started = Instant::now();
    let echo = if use_websocket {
        websocket_ping(client, peer, &path, &payload, options).await?
    } else {
        http_ping(client, peer, &path, &payload, options).await?
    };
    let elapsed = started.elapsed();

    if echo.len() != PING_SIZE {
        return Err(PingError::UnexpectedSize(echo.len()));
    }
    if echo[..] != payload[..] {
        return Err(PingError::Mismatch);
    }
    tracing::debug!(peer, rtt = ?elapsed, websocket = use_websocket, "Ping complete");
    Ok(elapsed)
}

async fn http_ping(
    client: &HttpClient,
    peer: &str,
    path: &str,
    payload: &[u8],
    options: &RequestOptions,
) -> Result<Vec<u8>, PingError> {
    let request = Request::post(path, payload.to_vec());
    let response = client.fetch(peer, request, options).await?;
    if response.status != StatusCode::OK {
        return Err(PingError::UnexpectedStatus(response.status));
    }
    let body = response
        .body
        .collect_limited(PING_SIZE * 2)
        .await
        .map_err(ClientError::from)?;
    Ok(body.to_vec())
}

async fn websocket_ping(
    client: &HttpClient,
    peer: &str,
    path: &str,
    payload: &[u8],
    options: &RequestOptions,
) -> Result<Vec<u8>, PingError> {
    let connect = ConnectOptions {
        request: options.clone(),
        ..ConnectOptions::default()
    };
    let socket = client.connect(peer, path, &connect).await?;
    let mut events = socket.subscribe();
    socket
        .send(Message::Binary(bytes::Bytes::copy_from_slice(payload)))
        .map_err(ClientError::from)?;
    let echo = events.next_message().await.ok_or(PingError::Closed)?;
    let _ = socket.close(close_code::NORMAL, "");
    Ok(echo.as_bytes().to_vec())
}
