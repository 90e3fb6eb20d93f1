//! Route definitions and handler traits.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use tokio_util::sync::CancellationToken;

use crate::auth::PeerId;
use crate::http::{Request, Response};
use crate::net::StreamId;
use crate::websocket::WebSocket;

/// Boxed error a handler may fail with; the client sees a 500.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Whether a route runs the peer-id handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthRequirement {
    #[default]
    None,
    /// Unauthenticated requests get the auth response instead of the handler.
    Required,
    /// The handler runs either way, with the peer when one was proven.
    Optional,
}

/// Per-request facts handed to handlers alongside the message.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Stream the request arrived on.
    pub stream_id: StreamId,
    /// Transport address of the remote end.
    pub remote: String,
    /// Protocol id of the matched route.
    pub protocol: String,
    /// Authenticated client, when the route ran the handshake.
    pub peer: Option<PeerId>,
    /// Cancelled when the server shuts down.
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(stream_id: StreamId, remote: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            stream_id,
            remote: remote.into(),
            protocol: String::new(),
            peer: None,
            cancel,
        }
    }
}

#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, request: Request, ctx: RequestContext) -> Result<Response, HandlerError>;
}

#[async_trait]
impl<F, Fut> HttpHandler for F
where
    F: Fn(Request, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request, ctx: RequestContext) -> Result<Response, HandlerError> {
        (self)(request, ctx).await
    }
}

/// Takes over an upgraded connection.
#[async_trait]
pub trait WebSocketHandler: Send + Sync {
    async fn on_connect(&self, socket: WebSocket, ctx: RequestContext);
}

#[async_trait]
impl<F, Fut> WebSocketHandler for F
where
    F: Fn(WebSocket, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_connect(&self, socket: WebSocket, ctx: RequestContext) {
        (self)(socket, ctx).await
    }
}

/// A route as the application declares it.
#[derive(Clone)]
pub struct Route {
    /// Mount path; the protocol id when unset.
    pub(crate) path: Option<String>,
    /// Methods the HTTP handler answers. `OPTIONS` is always implied.
    pub(crate) methods: Vec<Method>,
    /// Add CORS headers to responses.
    pub(crate) cors: bool,
    pub(crate) auth: AuthRequirement,
    pub(crate) handler: Option<Arc<dyn HttpHandler>>,
    pub(crate) websocket: Option<Arc<dyn WebSocketHandler>>,
    /// Overrides the service-wide WebSocket message limit.
    pub(crate) max_message_size: Option<usize>,
}

impl Route {
    fn empty() -> Self {
        Self {
            path: None,
            methods: vec![Method::GET],
            cors: true,
            auth: AuthRequirement::None,
            handler: None,
            websocket: None,
            max_message_size: None,
        }
    }

    /// A plain HTTP route answering `GET` unless told otherwise.
    pub fn http(handler: impl HttpHandler + 'static) -> Self {
        Self::empty().with_http(handler)
    }

    /// A route that only accepts WebSocket upgrades.
    pub fn websocket(handler: impl WebSocketHandler + 'static) -> Self {
        Self::empty().with_websocket(handler)
    }

    pub fn with_http(mut self, handler: impl HttpHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_websocket(mut self, handler: impl WebSocketHandler + 'static) -> Self {
        self.websocket = Some(Arc::new(handler));
        self
    }

    /// Mount path; defaults to the protocol id.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn cors(mut self, enabled: bool) -> Self {
        self.cors = enabled;
        self
    }

    pub fn auth(mut self, requirement: AuthRequirement) -> Self {
        self.auth = requirement;
        self
    }

    /// Overrides the node's WebSocket message limit for this route.
    pub fn max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = Some(limit);
        self
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("methods", &self.methods)
            .field("cors", &self.cors)
            .field("auth", &self.auth)
            .field("http", &self.handler.is_some())
            .field("websocket", &self.websocket.is_some())
            .finish()
    }
}

/// A route after registration: protocol bound, path normalized.
#[derive(Debug)]
pub struct RegisteredRoute {
    /// Protocol id the route was registered under.
    pub protocol: String,
    /// Mount path, always starting with `/`.
    pub path: String,
    pub route: Route,
}

impl RegisteredRoute {
    pub fn allows(&self, method: &Method) -> bool {
        self.route.methods.contains(method)
    }

    /// `Allow` header value: `OPTIONS` first, then the route's methods.
    pub fn allow_header(&self) -> String {
        allow_header(&self.route.methods)
    }

    /// Exact match, or `path` continues below this route's path.
    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.path.as_str()) {
            Some("") => true,
            Some(rest) => self.path.ends_with('/') || rest.starts_with('/'),
            None => false,
        }
    }
}

pub(crate) fn allow_header(methods: &[Method]) -> String {
    let mut allow = vec![Method::OPTIONS.as_str()];
    for method in methods {
        if !allow.contains(&method.as_str()) {
            allow.push(method.as_str());
        }
    }
    allow.join(", ")
}
