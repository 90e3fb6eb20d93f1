//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use p2p_http::auth::{Ed25519Identity, PeerIdAuth, PeerIdAuthClient};
use p2p_http::config::{ListenerConfig, NodeConfig};
use p2p_http::net::listener::Listener;
use p2p_http::net::{MemoryNetwork, TcpTransport};
use p2p_http::{HttpClient, HttpService, Registrar, Shutdown};

pub const SERVER: &str = "server";

/// A serving node: its routes and its identity.
pub struct TestServer {
    pub registrar: Arc<Registrar>,
    pub service: HttpService,
    pub identity: Arc<Ed25519Identity>,
}

pub fn server_identity() -> Arc<Ed25519Identity> {
    Arc::new(Ed25519Identity::from_seed([1u8; 32]))
}

pub fn client_identity() -> Arc<Ed25519Identity> {
    Arc::new(Ed25519Identity::from_seed([2u8; 32]))
}

/// Join `network` as [`SERVER`], serving HTTP with peer auth enabled.
pub fn memory_server(network: &MemoryNetwork) -> TestServer {
    let identity = server_identity();
    memory_server_with_auth(network, PeerIdAuth::new(identity.clone()), identity)
}

pub fn memory_server_with_auth(network: &MemoryNetwork, auth: PeerIdAuth, identity: Arc<Ed25519Identity>) -> TestServer {
    let registrar = Arc::new(Registrar::new());
    let service = HttpService::new(Arc::clone(&registrar), Some(auth), &NodeConfig::default());
    let transport = network.node(SERVER);
    service.attach(&transport);
    TestServer {
        registrar,
        service,
        identity,
    }
}

/// A client node on `network` with no identity.
pub fn memory_client(network: &MemoryNetwork, name: &str) -> HttpClient {
    HttpClient::new(Arc::new(network.node(name)))
}

/// A client node on `network` that can run the peer-id handshake.
pub fn authenticated_client(network: &MemoryNetwork, name: &str, auth: PeerIdAuthClient) -> HttpClient {
    memory_client(network, name).with_auth(Arc::new(auth))
}

/// A TCP node serving HTTP on an ephemeral port.
pub struct TcpServer {
    pub addr: SocketAddr,
    pub registrar: Arc<Registrar>,
    pub shutdown: Shutdown,
    pub transport: TcpTransport,
}

pub async fn tcp_server() -> TcpServer {
    let registrar = Arc::new(Registrar::new());
    let shutdown = Shutdown::new();
    let auth = PeerIdAuth::new(server_identity());
    let service =
        HttpService::new(Arc::clone(&registrar), Some(auth), &NodeConfig::default()).with_shutdown(shutdown.token());
    let transport = TcpTransport::new();
    service.attach(&transport);

    let listener = Listener::bind(&ListenerConfig {
        bind_address: "127.0.0.1:0".into(),
        max_streams: 64,
    })
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    {
        let transport = transport.clone();
        let token = shutdown.token();
        tokio::spawn(async move { transport.serve(listener, token).await });
    }

    TcpServer {
        addr,
        registrar,
        shutdown,
        transport,
    }
}
