//! Request dispatch: route lookup, peer auth, method negotiation, handler
//! invocation and response decoration.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use thiserror::Error;

use crate::auth::{AuthOutcome, PeerIdAuth};
use crate::http::{HeaderSet, Request, Response};
use crate::observability::metrics::HttpMetrics;
use crate::routing::cors;
use crate::routing::registrar::{Registrar, WELL_KNOWN_PROTOCOLS};
use crate::routing::route::{AuthRequirement, HandlerError, RegisteredRoute, RequestContext};
use crate::routing::well_known;
use crate::websocket::handshake::validate_upgrade;
use crate::websocket::UpgradeRequest;

/// Local failures that become a response on the same stream.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no route for {0}")]
    RouteNotFound(String),

    #[error("method {method} not allowed on {path}")]
    MethodNotAllowed { method: Method, path: String, allow: String },

    #[error("authentication required")]
    AuthRequired,

    #[error("request has no host to authenticate against")]
    MissingHost,

    #[error("peer authentication is not configured")]
    AuthUnavailable,

    #[error("upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error("handler failed: {0}")]
    Handler(HandlerError),

    #[error("handler panicked")]
    Panicked,
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            DispatchError::AuthRequired => StatusCode::UNAUTHORIZED,
            DispatchError::MissingHost | DispatchError::UpgradeFailed(_) => StatusCode::BAD_REQUEST,
            DispatchError::AuthUnavailable | DispatchError::Handler(_) | DispatchError::Panicked => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn into_response(self) -> Response {
        let mut response = Response::new(self.status());
        if let DispatchError::MethodNotAllowed { allow, .. } = &self {
            if let Ok(allow) = HeaderValue::from_str(allow) {
                response.headers.insert(header::ALLOW, allow);
            }
        }
        response
    }
}

/// What a successful upgrade negotiation resolved to.
pub enum UpgradeTarget {
    WellKnown {
        upgrade: UpgradeRequest,
    },
    Route {
        route: Arc<RegisteredRoute>,
        upgrade: UpgradeRequest,
        ctx: RequestContext,
        /// Auth headers to attach to the 101.
        auth_headers: HeaderSet,
    },
}

/// Routes parsed requests against the current route snapshot.
#[derive(Clone)]
pub struct Dispatcher {
    registrar: Arc<Registrar>,
    auth: Option<PeerIdAuth>,
}

impl Dispatcher {
    pub fn new(registrar: Arc<Registrar>, auth: Option<PeerIdAuth>) -> Self {
        Self { registrar, auth }
    }

    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.registrar
    }

    /// Produce the response for a plain (non-upgrade) request.
    pub async fn dispatch(&self, request: Request, mut ctx: RequestContext) -> Response {
        let started = Instant::now();
        let method = request.method.clone();
        let path = request.path().to_string();

        if well_known::is_well_known(&path) {
            let response = well_known::respond(&self.registrar, &method, &request.headers);
            record(WELL_KNOWN_PROTOCOLS, &response, started);
            return response;
        }

        let Some(route) = self.registrar.lookup(&path) else {
            tracing::debug!(method = %method, path = %path, "No route");
            let response = DispatchError::RouteNotFound(path).into_response();
            record("", &response, started);
            return response;
        };
        ctx.protocol = route.protocol.clone();

        let request_headers = request.headers.clone();
        let mut response = match self.serve_route(&route, request, ctx).await {
            Ok(response) => response,
            Err(error) => {
                match &error {
                    DispatchError::Handler(_) | DispatchError::Panicked | DispatchError::AuthUnavailable => {
                        tracing::error!(protocol = %route.protocol, path = %path, error = %error, "Request failed")
                    }
                    _ => tracing::debug!(protocol = %route.protocol, path = %path, error = %error, "Request rejected"),
                }
                error.into_response()
            }
        };
        cors::apply(&route, &method, &request_headers, &mut response);

        tracing::debug!(
            protocol = %route.protocol,
            method = %method,
            path = %path,
            status = response.status.as_u16(),
            "Request served"
        );
        record(&route.protocol, &response, started);
        response
    }

    async fn serve_route(
        &self,
        route: &RegisteredRoute,
        request: Request,
        mut ctx: RequestContext,
    ) -> Result<Response, DispatchError> {
        let outcome = match route.route.auth {
            AuthRequirement::None => None,
            AuthRequirement::Required | AuthRequirement::Optional => {
                let host = request.host();
                let authorization = request.headers.get_str(header::AUTHORIZATION);
                Some(self.authenticate(host, authorization).await?)
            }
        };

        if route.route.auth == AuthRequirement::Required {
            if let Some(outcome) = outcome.as_ref().filter(|o| !o.is_authenticated()) {
                let mut response = Response::new(outcome.status);
                outcome.apply_headers(&mut response);
                return Ok(response);
            }
        }
        ctx.peer = outcome.as_ref().and_then(|o| o.peer.clone());

        let mut response = self.invoke(route, request, ctx).await?;
        if let Some(outcome) = &outcome {
            outcome.apply_headers(&mut response);
        }
        Ok(response)
    }

    async fn invoke(&self, route: &RegisteredRoute, request: Request, ctx: RequestContext) -> Result<Response, DispatchError> {
        if !route.allows(&request.method) {
            if request.method == Method::OPTIONS {
                return Ok(Response::new(StatusCode::NO_CONTENT));
            }
            return Err(DispatchError::MethodNotAllowed {
                method: request.method.clone(),
                path: request.path().to_string(),
                allow: route.allow_header(),
            });
        }

        let Some(handler) = route.route.handler.clone() else {
            return Err(DispatchError::UpgradeFailed("route only accepts WebSocket upgrades".into()));
        };

        match AssertUnwindSafe(handler.handle(request, ctx)).catch_unwind().await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(DispatchError::Handler(error)),
            Err(_) => Err(DispatchError::Panicked),
        }
    }

    async fn authenticate(&self, host: Option<String>, authorization: Option<&str>) -> Result<AuthOutcome, DispatchError> {
        let Some(auth) = &self.auth else {
            return Err(DispatchError::AuthUnavailable);
        };
        let host = host.ok_or(DispatchError::MissingHost)?;
        Ok(auth.authenticate_request(&host, authorization).await)
    }

    /// Resolve an upgrade request. `Err` carries the response to send
    /// instead of a 101.
    pub async fn negotiate_upgrade(&self, request: Request, mut ctx: RequestContext) -> Result<UpgradeTarget, Response> {
        let path = request.path();
        let upgrade = validate_upgrade(&request.headers).map_err(|error| {
            tracing::debug!(path, error = %error, "Rejected upgrade");
            DispatchError::UpgradeFailed(error.to_string()).into_response()
        })?;

        if well_known::is_well_known(path) {
            return Ok(UpgradeTarget::WellKnown { upgrade });
        }

        let route = self
            .registrar
            .lookup(path)
            .ok_or_else(|| DispatchError::RouteNotFound(path.to_string()).into_response())?;
        ctx.protocol = route.protocol.clone();

        if route.route.websocket.is_none() {
            return Err(DispatchError::UpgradeFailed("route does not accept WebSocket".into()).into_response());
        }
        if !route.allows(&request.method) {
            let mut response = DispatchError::MethodNotAllowed {
                method: request.method.clone(),
                path: path.to_string(),
                allow: route.allow_header(),
            }
            .into_response();
            cors::apply(&route, &request.method, &request.headers, &mut response);
            return Err(response);
        }

        let mut auth_headers = HeaderSet::new();
        if route.route.auth != AuthRequirement::None {
            let host = request.host();
            let authorization = request
                .headers
                .get_str(header::AUTHORIZATION)
                .or(upgrade.authorization.as_deref());
            let outcome = self
                .authenticate(host, authorization)
                .await
                .map_err(DispatchError::into_response)?;
            if route.route.auth == AuthRequirement::Required && !outcome.is_authenticated() {
                return Err(outcome.into_response());
            }
            ctx.peer = outcome.peer;
            auth_headers = outcome.headers;
        }

        Ok(UpgradeTarget::Route {
            route,
            upgrade,
            ctx,
            auth_headers,
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registrar", &self.registrar)
            .field("auth", &self.auth.as_ref().map(PeerIdAuth::peer_id))
            .finish()
    }
}

fn record(protocol: &str, response: &Response, started: Instant) {
    HttpMetrics::request_completed(protocol, response.status.as_u16(), started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Ed25519Identity, Identity, PeerIdAuthClient};
    use crate::http::Body;
    use crate::net::StreamId;
    use crate::routing::route::Route;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> RequestContext {
        RequestContext::new(StreamId::new(), "test", CancellationToken::new())
    }

    async fn ok(_: Request, _: RequestContext) -> Result<Response, HandlerError> {
        Ok(Response::text(StatusCode::OK, "ok"))
    }

    fn dispatcher(auth: Option<PeerIdAuth>) -> Dispatcher {
        Dispatcher::new(Arc::new(Registrar::new()), auth)
    }

    #[tokio::test]
    async fn get_ok_and_post_not_allowed() {
        let d = dispatcher(None);
        d.registrar().handle("/x", Route::http(ok)).unwrap();

        let response = d.dispatch(Request::get("/x"), ctx()).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text_body().await.unwrap(), "ok");

        let response = d.dispatch(Request::post("/x", "data"), ctx()).await;
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers.get_str(header::ALLOW), Some("OPTIONS, GET"));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let d = dispatcher(None);
        let response = d.dispatch(Request::get("/nope"), ctx()).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn options_without_handler_support_is_204() {
        let d = dispatcher(None);
        d.registrar().handle("/x", Route::http(ok)).unwrap();
        let request = Request::new(Method::OPTIONS, "/x")
            .try_header("origin", "https://a.example")
            .unwrap();
        let response = d.dispatch(request, ctx()).await;
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert_eq!(response.headers.get_str(header::ALLOW), Some("OPTIONS, GET"));
        assert_eq!(
            response.headers.get_str(header::ACCESS_CONTROL_ALLOW_ORIGIN),
            Some("https://a.example")
        );
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_500() {
        let d = dispatcher(None);
        d.registrar()
            .handle(
                "/fail",
                Route::http(|_: Request, _: RequestContext| async {
                    Err::<Response, HandlerError>("boom".into())
                }),
            )
            .unwrap();
        d.registrar()
            .handle(
                "/panic",
                Route::http(|_: Request, _: RequestContext| async {
                    if true {
                        panic!("handler bug");
                    }
                    Ok::<Response, HandlerError>(Response::ok())
                }),
            )
            .unwrap();

        assert_eq!(d.dispatch(Request::get("/fail"), ctx()).await.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(d.dispatch(Request::get("/panic"), ctx()).await.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn websocket_only_route_rejects_plain_request() {
        let d = dispatcher(None);
        d.registrar()
            .handle("/ws", Route::websocket(|_ws: crate::websocket::WebSocket, _: RequestContext| async {}))
            .unwrap();
        assert_eq!(d.dispatch(Request::get("/ws"), ctx()).await.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn required_auth_challenges_then_passes_peer() {
        let server_identity = Arc::new(Ed25519Identity::generate());
        let d = dispatcher(Some(PeerIdAuth::new(server_identity)));
        d.registrar()
            .handle(
                "/whoami",
                Route::http(|_: Request, ctx: RequestContext| async move {
                    let peer = ctx.peer.map(|p| p.to_string()).unwrap_or_default();
                    Ok::<Response, HandlerError>(Response::text(StatusCode::OK, peer))
                })
                .auth(AuthRequirement::Required),
            )
            .unwrap();

        let unauthenticated = d
            .dispatch(Request::get("/whoami").try_header("host", "node.example").unwrap(), ctx())
            .await;
        assert_eq!(unauthenticated.status, StatusCode::UNAUTHORIZED);
        assert!(unauthenticated.headers.contains_key(header::WWW_AUTHENTICATE));

        let client_identity = Arc::new(Ed25519Identity::generate());
        let client_peer = client_identity.peer_id();
        let client = PeerIdAuthClient::new(client_identity);
        let pending = client.begin();
        let challenge = d
            .dispatch(
                Request::new(Method::OPTIONS, "/whoami")
                    .try_header("host", "node.example")
                    .unwrap()
                    .try_header("authorization", &pending.authorization)
                    .unwrap(),
                ctx(),
            )
            .await;
        assert_eq!(challenge.status, StatusCode::UNAUTHORIZED);
        let www = challenge.headers.get_str(header::WWW_AUTHENTICATE).unwrap().to_string();
        let (_, authorization) = client.respond("node.example", &pending, &www).await.unwrap();

        let response = d
            .dispatch(
                Request::get("/whoami")
                    .try_header("host", "node.example")
                    .unwrap()
                    .try_header("authorization", &authorization)
                    .unwrap(),
                ctx(),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.headers.contains_key(crate::auth::AUTHENTICATION_INFO));
        assert_eq!(response.text_body().await.unwrap(), client_peer.to_string());
    }

    #[tokio::test]
    async fn optional_auth_runs_handler_without_peer() {
        let d = dispatcher(Some(PeerIdAuth::new(Arc::new(Ed25519Identity::generate()))));
        d.registrar()
            .handle(
                "/maybe",
                Route::http(|_: Request, ctx: RequestContext| async move {
                    let body = if ctx.peer.is_some() { "peer" } else { "anonymous" };
                    Ok::<Response, HandlerError>(Response::text(StatusCode::OK, body))
                })
                .auth(AuthRequirement::Optional),
            )
            .unwrap();
        let response = d
            .dispatch(Request::get("/maybe").try_header("host", "h").unwrap(), ctx())
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.headers.contains_key(header::WWW_AUTHENTICATE));
        assert_eq!(response.text_body().await.unwrap(), "anonymous");
    }

    #[tokio::test]
    async fn auth_route_without_host_is_400() {
        let d = dispatcher(Some(PeerIdAuth::new(Arc::new(Ed25519Identity::generate()))));
        d.registrar()
            .handle("/secure", Route::http(ok).auth(AuthRequirement::Required))
            .unwrap();
        assert_eq!(d.dispatch(Request::get("/secure"), ctx()).await.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upgrade_needs_valid_handshake_headers() {
        let d = dispatcher(None);
        d.registrar()
            .handle("/ws", Route::websocket(|_ws: crate::websocket::WebSocket, _: RequestContext| async {}))
            .unwrap();
        let request = Request::get("/ws")
            .try_header("upgrade", "websocket")
            .unwrap()
            .try_header("connection", "Upgrade")
            .unwrap();
        match d.negotiate_upgrade(request, ctx()).await {
            Err(response) => assert_eq!(response.status, StatusCode::BAD_REQUEST),
            Ok(_) => panic!("upgrade without key accepted"),
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn dispatch_futures_are_send() {
        let d = dispatcher(None);
        let streamed = || Request::post("/x", Body::from_stream(futures_util::stream::empty::<std::io::Result<bytes::Bytes>>()));
        assert_send(&d.dispatch(streamed(), ctx()));
        assert_send(&d.negotiate_upgrade(streamed(), ctx()));
    }
}
