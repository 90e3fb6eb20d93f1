//! Built-in protocols served over HTTP.

pub mod ping;

pub use ping::{ping, PingError, PingService, HTTP_PING_PROTOCOL, PING_SIZE};
