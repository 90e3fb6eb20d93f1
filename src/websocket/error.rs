//! WebSocket errors and close codes.

use thiserror::Error;

/// Close codes from RFC 6455 §7.4.1.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Codes that may appear in a close frame on the wire.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("WebSocket is not open")]
    NotOpen,

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("message exceeds {limit} bytes")]
    MessageTooBig { limit: usize },

    #[error("text message is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),

    #[error("upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error("WebSocket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WebSocketError {
    /// The close code to send when this error ends a connection.
    pub fn close_code(&self) -> u16 {
        match self {
            WebSocketError::Protocol(_) | WebSocketError::InvalidCloseCode(_) => close_code::PROTOCOL_ERROR,
            WebSocketError::MessageTooBig { .. } => close_code::MESSAGE_TOO_BIG,
            WebSocketError::InvalidUtf8 => close_code::INVALID_PAYLOAD,
            WebSocketError::NotOpen | WebSocketError::UpgradeFailed(_) => close_code::POLICY_VIOLATION,
            WebSocketError::Io(_) => close_code::ABNORMAL,
        }
    }
}
