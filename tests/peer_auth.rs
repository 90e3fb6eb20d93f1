//! Peer-id authentication between client and server nodes.

use std::sync::Arc;
use std::time::Duration;

use http::{header, StatusCode};

use p2p_http::auth::{AuthError, Identity, ManualClock, PeerIdAuth, PeerIdAuthClient, AUTHENTICATION_INFO};
use p2p_http::client::ClientError;
use p2p_http::config::AuthConfig;
use p2p_http::http::{Request, Response};
use p2p_http::net::MemoryNetwork;
use p2p_http::routing::HandlerError;
use p2p_http::websocket::WebSocket;
use p2p_http::{AuthRequirement, ConnectOptions, RequestContext, RequestOptions, Route};

mod common;
use common::SERVER;

const START_MILLIS: u64 = 1_700_000_000_000;

async fn whoami(_: Request, ctx: RequestContext) -> Result<Response, HandlerError> {
    let peer = ctx.peer.map(|p| p.to_string()).unwrap_or_else(|| "anonymous".into());
    Ok(Response::text(StatusCode::OK, peer))
}

fn protected() -> Route {
    Route::http(whoami).auth(AuthRequirement::Required)
}

#[tokio::test]
async fn handshake_then_bearer() {
    let network = MemoryNetwork::new();
    let server = common::memory_server(&network);
    server.registrar.handle("/private/1", protected()).unwrap();

    let identity = common::client_identity();
    let client = common::authenticated_client(&network, "client", PeerIdAuthClient::new(identity.clone()));
    let options = RequestOptions::authenticated();

    let first = client.fetch(SERVER, Request::get("/private/1"), &options).await.unwrap();
    assert_eq!(first.status, StatusCode::OK);
    assert!(first.headers.get_str(AUTHENTICATION_INFO).is_some());
    assert_eq!(first.text_body().await.unwrap(), identity.peer_id().to_string());

    let auth = client.auth().unwrap();
    let token = auth.cached(&PeerIdAuthClient::cache_key(SERVER, None)).unwrap();
    assert_eq!(token.peer, server.identity.peer_id());
    assert!(token.authorization.contains("bearer="));

    let second = client.fetch(SERVER, Request::get("/private/1"), &options).await.unwrap();
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.text_body().await.unwrap(), identity.peer_id().to_string());
}

#[tokio::test]
async fn unauthenticated_request_is_challenged() {
    let network = MemoryNetwork::new();
    let server = common::memory_server(&network);
    server.registrar.handle("/private/1", protected()).unwrap();
    let client = common::memory_client(&network, "client");

    let response = client
        .fetch(SERVER, Request::get("/private/1"), &RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    let challenge = response.headers.get_str(header::WWW_AUTHENTICATE).unwrap();
    assert!(challenge.starts_with("libp2p-PeerID "));
    assert!(challenge.contains("challenge-client="));
}

#[tokio::test]
async fn optional_route_serves_anonymous_and_authenticated() {
    let network = MemoryNetwork::new();
    let server = common::memory_server(&network);
    server
        .registrar
        .handle("/maybe/1", Route::http(whoami).auth(AuthRequirement::Optional))
        .unwrap();

    let anonymous = common::memory_client(&network, "anon");
    let response = anonymous
        .fetch(SERVER, Request::get("/maybe/1"), &RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text_body().await.unwrap(), "anonymous");

    let identity = common::client_identity();
    let client = common::authenticated_client(&network, "client", PeerIdAuthClient::new(identity.clone()));
    let response = client
        .fetch(SERVER, Request::get("/maybe/1"), &RequestOptions::authenticated())
        .await
        .unwrap();
    assert_eq!(response.text_body().await.unwrap(), identity.peer_id().to_string());
}

#[tokio::test]
async fn pinned_peer_must_match() {
    let network = MemoryNetwork::new();
    let server = common::memory_server(&network);
    server.registrar.handle("/private/1", protected()).unwrap();
    let client = common::authenticated_client(&network, "client", PeerIdAuthClient::new(common::client_identity()));

    let stranger = common::client_identity().peer_id();
    let options = RequestOptions::authenticated().with_peer_id(stranger);
    let result = client.fetch(SERVER, Request::get("/private/1"), &options).await;
    assert!(matches!(result, Err(ClientError::Auth(AuthError::InvalidPeer))));

    let options = RequestOptions::authenticated().with_peer_id(server.identity.peer_id());
    let response = client.fetch(SERVER, Request::get("/private/1"), &options).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn authentication_needs_an_identity() {
    let network = MemoryNetwork::new();
    let server = common::memory_server(&network);
    server.registrar.handle("/private/1", protected()).unwrap();
    let client = common::memory_client(&network, "client");

    let result = client
        .fetch(SERVER, Request::get("/private/1"), &RequestOptions::authenticated())
        .await;
    assert!(matches!(result, Err(ClientError::AuthNotConfigured)));
}

#[tokio::test]
async fn expired_bearer_is_renewed() {
    let network = MemoryNetwork::new();
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let identity = common::server_identity();
    let auth = PeerIdAuth::new(identity.clone())
        .with_token_ttl(Duration::from_secs(60))
        .with_clock(clock.clone());
    let server = common::memory_server_with_auth(&network, auth, identity);
    server.registrar.handle("/private/1", protected()).unwrap();

    let client_auth = PeerIdAuthClient::new(common::client_identity())
        .with_token_ttl(Duration::from_secs(3600))
        .with_clock(clock.clone());
    let client = common::authenticated_client(&network, "client", client_auth);
    let options = RequestOptions::authenticated();

    let first = client.fetch(SERVER, Request::get("/private/1"), &options).await.unwrap();
    assert_eq!(first.status, StatusCode::OK);

    // Still cached on the client, but the server no longer honours it.
    clock.advance(Duration::from_secs(120));
    let key = PeerIdAuthClient::cache_key(SERVER, None);
    let stale = client.auth().unwrap().cached(&key).unwrap();

    let second = client.fetch(SERVER, Request::get("/private/1"), &options).await.unwrap();
    assert_eq!(second.status, StatusCode::OK);
    let renewed = client.auth().unwrap().cached(&key).unwrap();
    assert_ne!(renewed.authorization, stale.authorization);
}

#[tokio::test]
async fn client_cache_expires_with_ttl() {
    let network = MemoryNetwork::new();
    let server = common::memory_server(&network);
    server.registrar.handle("/private/1", protected()).unwrap();

    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let client_auth = PeerIdAuthClient::new(common::client_identity())
        .with_token_ttl(Duration::from_secs(10))
        .with_clock(clock.clone());
    let client = common::authenticated_client(&network, "client", client_auth);
    let options = RequestOptions::authenticated();
    let key = PeerIdAuthClient::cache_key(SERVER, None);

    client.fetch(SERVER, Request::get("/private/1"), &options).await.unwrap();
    let first = client.auth().unwrap().cached(&key).unwrap();
    assert_eq!(first.expires_at, START_MILLIS + 10_000);

    clock.advance(Duration::from_secs(20));
    assert!(client.auth().unwrap().cached(&key).is_none());

    let response = client.fetch(SERVER, Request::get("/private/1"), &options).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    let renewed = client.auth().unwrap().cached(&key).unwrap();
    assert_eq!(renewed.expires_at, START_MILLIS + 30_000);
}

#[tokio::test]
async fn disallowed_hostname_is_rejected() {
    let network = MemoryNetwork::new();
    let identity = common::server_identity();
    let config = AuthConfig {
        allowed_hostnames: vec!["node.example".into()],
        ..AuthConfig::default()
    };
    let server = common::memory_server_with_auth(&network, PeerIdAuth::from_config(identity.clone(), &config), identity);
    server.registrar.handle("/private/1", protected()).unwrap();
    let client = common::memory_client(&network, "client");

    let response = client
        .fetch(SERVER, Request::get("/private/1"), &RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let request = Request::get("/private/1").try_header("host", "node.example").unwrap();
    let response = client.fetch(SERVER, request, &RequestOptions::default()).await.unwrap();
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authenticated_websocket() {
    let network = MemoryNetwork::new();
    let server = common::memory_server(&network);
    server
        .registrar
        .handle(
            "/private-ws/1",
            Route::websocket(|socket: WebSocket, ctx: RequestContext| async move {
                let peer = ctx.peer.map(|p| p.to_string()).unwrap_or_default();
                let _ = socket.send(peer);
                let _ = socket.close(1000, "");
            })
            .auth(AuthRequirement::Required),
        )
        .unwrap();

    let identity = common::client_identity();
    let client = common::authenticated_client(&network, "client", PeerIdAuthClient::new(identity.clone()));

    let refused = client
        .connect(SERVER, "/private-ws/1", &ConnectOptions::default())
        .await;
    assert!(matches!(refused, Err(ClientError::UnexpectedStatus(StatusCode::UNAUTHORIZED))));

    let options = ConnectOptions {
        request: RequestOptions::authenticated(),
        ..ConnectOptions::default()
    };
    let socket = client.connect(SERVER, "/private-ws/1", &options).await.unwrap();
    let mut events = socket.subscribe();
    let message = events.next_message().await.unwrap();
    assert_eq!(message.as_bytes(), identity.peer_id().to_string().as_bytes());
}
