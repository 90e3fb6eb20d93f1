//! RFC 6455 frame codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::websocket::error::{close_code, WebSocketError};

/// Frame opcode (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_u8(value: u8) -> Result<Self, WebSocketError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::Protocol("reserved opcode")),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Which end of the connection this codec serves. Clients mask outgoing
/// frames and expect unmasked input; servers the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn close(code: u16, reason: &str) -> Self {
        Self::new(OpCode::Close, close_payload(code, reason))
    }
}

/// Encode a close payload. `NO_STATUS` produces an empty payload, and the
/// reason is cut to fit the 125-byte control frame limit.
pub fn close_payload(code: u16, reason: &str) -> Bytes {
    if code == close_code::NO_STATUS {
        return Bytes::new();
    }
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let mut payload = BytesMut::with_capacity(2 + end);
    payload.put_u16(code);
    payload.put_slice(&reason.as_bytes()[..end]);
    payload.freeze()
}

/// Decode a close payload into code and reason.
pub fn parse_close_payload(payload: &[u8]) -> Result<(u16, String), WebSocketError> {
    match payload.len() {
        0 => Ok((close_code::NO_STATUS, String::new())),
        1 => Err(WebSocketError::Protocol("truncated close payload")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !close_code::is_sendable(code) {
                return Err(WebSocketError::InvalidCloseCode(code));
            }
            let reason = std::str::from_utf8(&payload[2..]).map_err(|_| WebSocketError::InvalidUtf8)?;
            Ok((code, reason.to_string()))
        }
    }
}

/// Frame codec bounded by a maximum payload size.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    role: Role,
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(role: Role, max_payload: usize) -> Self {
        Self { role, max_payload }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WebSocketError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let (b0, b1) = (src[0], src[1]);
        if b0 & 0x70 != 0 {
            return Err(WebSocketError::Protocol("reserved bits set"));
        }
        let fin = b0 & 0x80 != 0;
        let opcode = OpCode::from_u8(b0 & 0x0F)?;
        let masked = b1 & 0x80 != 0;

        match (self.role, masked) {
            (Role::Server, false) => return Err(WebSocketError::Protocol("unmasked client frame")),
            (Role::Client, true) => return Err(WebSocketError::Protocol("masked server frame")),
            _ => {}
        }

        let (payload_len, mut header_len) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(len);
                if len >> 63 != 0 {
                    return Err(WebSocketError::Protocol("payload length high bit set"));
                }
                (len, 10)
            }
            n => (u64::from(n), 2),
        };

        if opcode.is_control() && (!fin || payload_len > 125) {
            return Err(WebSocketError::Protocol("invalid control frame"));
        }
        if payload_len > self.max_payload as u64 {
            return Err(WebSocketError::MessageTooBig { limit: self.max_payload });
        }
        let payload_len = payload_len as usize;

        let mask = if masked {
            if src.len() < header_len + 4 {
                return Ok(None);
            }
            let key = [src[header_len], src[header_len + 1], src[header_len + 2], src[header_len + 3]];
            header_len += 4;
            Some(key)
        } else {
            None
        };

        if src.len() < header_len + payload_len {
            src.reserve(header_len + payload_len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let mut payload = src.split_to(payload_len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WebSocketError> {
        let len = frame.payload.len();
        let mask_bit = if self.role == Role::Client { 0x80 } else { 0x00 };

        dst.reserve(14 + len);
        dst.put_u8(if frame.fin { 0x80 } else { 0x00 } | frame.opcode.as_u8());
        if len < 126 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        if self.role == Role::Client {
            let key: [u8; 4] = rand::random();
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        } else {
            dst.put_slice(&frame.payload);
        }
        Ok(())
    }
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}
