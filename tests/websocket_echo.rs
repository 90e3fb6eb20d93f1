//! WebSocket routes: echo over the memory network, and interop with a
//! stock WebSocket client over TCP.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WireMessage;

use p2p_http::net::MemoryNetwork;
use p2p_http::websocket::{close_code, Message, WebSocket, WebSocketEvent};
use p2p_http::{ConnectOptions, RequestContext, Route, HTTP_PROTOCOL};

mod common;
use common::SERVER;

async fn echo(socket: WebSocket, _ctx: RequestContext) {
    let mut events = socket.subscribe();
    while let Some(message) = events.next_message().await {
        if socket.send(message).is_err() {
            break;
        }
    }
}

fn echo_route() -> Route {
    Route::websocket(echo)
}

#[tokio::test]
async fn echo_text_and_binary() {
    let network = MemoryNetwork::new();
    let server = common::memory_server(&network);
    server.registrar.handle("/echo-ws/1", echo_route()).unwrap();
    let client = common::memory_client(&network, "client");

    let socket = client
        .connect(SERVER, "/echo-ws/1", &ConnectOptions::default())
        .await
        .unwrap();
    let mut events = socket.subscribe();

    socket.send("hello").unwrap();
    socket.send(vec![1u8, 2, 3]).unwrap();
    assert_eq!(events.next_message().await, Some(Message::Text("hello".into())));
    assert_eq!(events.next_message().await, Some(Message::Binary(vec![1u8, 2, 3].into())));

    socket.close(close_code::NORMAL, "bye").unwrap();
    let close = events.closed().await.unwrap();
    assert_eq!(close.code, close_code::NORMAL);
    assert!(close.was_clean);
}

#[tokio::test]
async fn large_message_survives() {
    let network = MemoryNetwork::new();
    let server = common::memory_server(&network);
    server.registrar.handle("/echo-ws/1", echo_route()).unwrap();
    let client = common::memory_client(&network, "client");

    let socket = client
        .connect(SERVER, "/echo-ws/1", &ConnectOptions::default())
        .await
        .unwrap();
    let mut events = socket.subscribe();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    socket.send(payload.clone()).unwrap();
    let echoed = events.next_message().await.unwrap();
    assert_eq!(echoed.as_bytes(), &payload[..]);
}

#[tokio::test]
async fn oversized_message_closes_with_1009() {
    let network = MemoryNetwork::new();
    let server = common::memory_server(&network);
    server
        .registrar
        .handle("/echo-ws/1", echo_route().max_message_size(16))
        .unwrap();
    let client = common::memory_client(&network, "client");

    let socket = client
        .connect(SERVER, "/echo-ws/1", &ConnectOptions::default())
        .await
        .unwrap();
    let mut events = socket.subscribe();
    socket.send(vec![0u8; 64]).unwrap();
    let close = events.closed().await.unwrap();
    assert_eq!(close.code, close_code::MESSAGE_TOO_BIG);
}

#[tokio::test]
async fn subprotocol_is_negotiated() {
    let network = MemoryNetwork::new();
    let server = common::memory_server(&network);
    server.registrar.handle("/echo-ws/1", echo_route()).unwrap();
    let client = common::memory_client(&network, "client");

    let options = ConnectOptions {
        protocols: vec!["chat".into()],
        ..ConnectOptions::default()
    };
    let socket = client.connect(SERVER, "/echo-ws/1", &options).await.unwrap();
    assert_eq!(socket.protocol(), Some("chat"));
}

#[tokio::test]
async fn upgrade_to_http_only_route_fails() {
    let network = MemoryNetwork::new();
    let server = common::memory_server(&network);
    server
        .registrar
        .handle(
            "/plain/1",
            Route::http(|_: p2p_http::http::Request, _: RequestContext| async {
                Ok::<_, p2p_http::routing::HandlerError>(p2p_http::http::Response::ok())
            }),
        )
        .unwrap();
    let client = common::memory_client(&network, "client");

    let result = client.connect(SERVER, "/plain/1", &ConnectOptions::default()).await;
    assert!(result.is_err());
}

/// Open a raw TCP stream and run the protocol-select line by hand.
async fn select_http(addr: std::net::SocketAddr) -> TcpStream {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(format!("{HTTP_PROTOCOL}\n").as_bytes()).await.unwrap();
    let mut ack = vec![0u8; HTTP_PROTOCOL.len() + 1];
    socket.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack, format!("{HTTP_PROTOCOL}\n").into_bytes());
    socket
}

#[tokio::test]
async fn stock_client_interop_over_tcp() {
    let server = common::tcp_server().await;
    server.registrar.handle("/echo-ws/1", echo_route()).unwrap();

    let stream = select_http(server.addr).await;
    let request = format!("ws://{}/echo-ws/1", server.addr).into_client_request().unwrap();
    let (mut ws, response) = tokio_tungstenite::client_async(request, stream).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::SWITCHING_PROTOCOLS);

    ws.send(WireMessage::text("over tcp")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.to_text().unwrap(), "over tcp");

    ws.send(WireMessage::binary(vec![9u8; 70_000])).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.into_data().len(), 70_000);

    ws.close(None).await.unwrap();
    server.shutdown.trigger();
}

#[tokio::test]
async fn shutdown_closes_open_sockets_with_going_away() {
    let server = common::tcp_server().await;
    server.registrar.handle("/echo-ws/1", echo_route()).unwrap();
    let client = p2p_http::HttpClient::new(std::sync::Arc::new(server.transport.clone()));

    let socket = client
        .connect(&server.addr.to_string(), "/echo-ws/1", &ConnectOptions::default())
        .await
        .unwrap();
    let mut events = socket.subscribe();
    assert!(matches!(events.recv().await, Some(WebSocketEvent::Open)));

    server.shutdown.trigger();
    let close = tokio::time::timeout(Duration::from_secs(5), events.closed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(close.code, close_code::GOING_AWAY);
}
