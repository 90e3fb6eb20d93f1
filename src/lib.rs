//! HTTP/1.1 and WebSocket over peer-to-peer byte streams, with peer-id
//! authentication.
//!
//! # Data Flow
//! ```text
//! Transport (memory | tcp)
//!     → net (Stream: ordered bytes, half-close, abort)
//!     → routing::HttpService (one request per stream)
//!         → http (preamble + body codec)
//!         → routing::Dispatcher (registrar snapshot, auth, CORS)
//!         → handler | websocket upgrade
//!
//! client::HttpClient
//!     → Transport::open_stream(peer, /http/1.1)
//!     → http writer / parser, websocket handshake
//!     → auth::PeerIdAuthClient (token cache)
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;
pub mod services;
pub mod websocket;

pub use client::{ClientError, ConnectOptions, HttpClient, RequestOptions};
pub use config::NodeConfig;
pub use error::{Error, Result};
pub use lifecycle::Shutdown;
pub use routing::{AuthRequirement, HttpService, Registrar, RequestContext, Route, HTTP_PROTOCOL};
