//! WebSocket engine over peer streams.
//!
//! # Data Flow
//! ```text
//! Server: upgrade request
//!     → handshake.rs (validate version/key, strip authorization= subprotocol)
//!     → 101 + Sec-WebSocket-Accept
//!     → connection.rs (WebSocket::spawn, role = Server)
//!
//! Client: handshake.rs (random key, upgrade request)
//!     → read 101, verify accept token
//!     → connection.rs (WebSocket::spawn, role = Client)
//!
//! Both: stream bytes ↔ frame.rs (FrameCodec) ↔ driver task ↔ subscribers
//! ```
//!
//! # Design Decisions
//! - Each connection owns its listener set; events are explicit values
//! - Frames are bounded by the max message size before they are buffered
//! - Close is dispatched exactly once, then the stream is aborted
//! - `CLOSED` is terminal; a connection is never reused

pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;

pub use connection::{CloseEvent, Events, Message, ReadyState, WebSocket, WebSocketEvent};
pub use error::{close_code, WebSocketError};
pub use frame::{Frame, FrameCodec, OpCode, Role};
pub use handshake::{accept_key, authorization_protocol, UpgradeRequest};
