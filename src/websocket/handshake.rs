//! Opening handshake (RFC 6455 §4) for both ends.
//!
//! Browsers cannot set an `Authorization` header on a WebSocket request, so
//! a client may instead offer a subprotocol entry `authorization=<base64>`.
//! The server decodes it as the authorization value and strips it from the
//! subprotocol list before choosing one.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::{self, HeaderValue};
use http::StatusCode;
use sha1::{Digest, Sha1};

use crate::http::{HeaderSet, MessagePreamble, Request, Response};
use crate::websocket::error::WebSocketError;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const AUTHORIZATION_PROTOCOL_PREFIX: &str = "authorization=";

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64.
pub fn generate_key() -> String {
    let bytes: [u8; 16] = rand::random();
    STANDARD.encode(bytes)
}

/// Subprotocol entry that carries an authorization value.
pub fn authorization_protocol(value: &str) -> String {
    format!("{AUTHORIZATION_PROTOCOL_PREFIX}{}", STANDARD.encode(value))
}

/// A validated upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub key: String,
    /// Offered subprotocols, authorization entries removed.
    pub protocols: Vec<String>,
    /// Authorization value smuggled through the subprotocol list.
    pub authorization: Option<String>,
}

/// Check a request for a well-formed version 13 upgrade.
pub fn validate_upgrade(headers: &HeaderSet) -> Result<UpgradeRequest, WebSocketError> {
    if headers.get_str(header::SEC_WEBSOCKET_VERSION).map(str::trim) != Some("13") {
        return Err(WebSocketError::UpgradeFailed("unsupported Sec-WebSocket-Version".into()));
    }
    let key = headers
        .get_str(header::SEC_WEBSOCKET_KEY)
        .map(str::trim)
        .ok_or_else(|| WebSocketError::UpgradeFailed("missing Sec-WebSocket-Key".into()))?;
    match STANDARD.decode(key) {
        Ok(raw) if raw.len() == 16 => {}
        _ => return Err(WebSocketError::UpgradeFailed("malformed Sec-WebSocket-Key".into())),
    }

    let mut protocols = Vec::new();
    let mut authorization = None;
    for value in headers.get_all(header::SEC_WEBSOCKET_PROTOCOL) {
        let Ok(value) = value.to_str() else { continue };
        for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.strip_prefix(AUTHORIZATION_PROTOCOL_PREFIX) {
                Some(encoded) => {
                    let decoded = STANDARD
                        .decode(encoded)
                        .ok()
                        .and_then(|raw| String::from_utf8(raw).ok());
                    if decoded.is_some() {
                        authorization = decoded;
                    }
                }
                None => protocols.push(entry.to_string()),
            }
        }
    }

    Ok(UpgradeRequest {
        key: key.to_string(),
        protocols,
        authorization,
    })
}

/// The 101 response completing a server handshake.
pub fn upgrade_response(upgrade: &UpgradeRequest) -> Result<Response, WebSocketError> {
    let accept = HeaderValue::from_str(&accept_key(&upgrade.key))
        .map_err(|_| WebSocketError::UpgradeFailed("unencodable accept key".into()))?;
    let mut response = Response::new(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, HeaderValue::from_static("websocket"))
        .header(header::CONNECTION, HeaderValue::from_static("Upgrade"))
        .header(header::SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = upgrade.protocols.first() {
        if let Ok(value) = HeaderValue::from_str(protocol) {
            response.headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }
    Ok(response)
}

/// Build a client upgrade request. `headers` are copied onto it first, so
/// the handshake headers always win.
pub fn client_request(
    target: &str,
    host: &str,
    key: &str,
    protocols: &[String],
    headers: HeaderSet,
) -> Result<Request, WebSocketError> {
    let invalid = |what: &str| WebSocketError::UpgradeFailed(format!("invalid {what}"));
    let mut request = Request::get(target);
    request.headers = headers;
    request.headers.insert(
        header::HOST,
        HeaderValue::from_str(host).map_err(|_| invalid("host"))?,
    );
    request
        .headers
        .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    request
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    request
        .headers
        .insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    request.headers.insert(
        header::SEC_WEBSOCKET_KEY,
        HeaderValue::from_str(key).map_err(|_| invalid("key"))?,
    );
    if !protocols.is_empty() {
        request.headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&protocols.join(", ")).map_err(|_| invalid("subprotocol"))?,
        );
    }
    Ok(request)
}

/// Check a server's answer to our upgrade request. Returns the chosen
/// subprotocol, if any.
pub fn verify_response(preamble: &MessagePreamble, key: &str) -> Result<Option<String>, WebSocketError> {
    let status = preamble.status();
    if status != Some(StatusCode::SWITCHING_PROTOCOLS) {
        return Err(WebSocketError::UpgradeFailed(format!(
            "expected 101, got {}",
            status.map(|s| s.as_u16()).unwrap_or_default()
        )));
    }
    let headers = &preamble.headers;
    let upgrade_ok = headers
        .get_str(header::UPGRADE)
        .map(|u| u.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !upgrade_ok || !headers.has_token(header::CONNECTION, "upgrade") {
        return Err(WebSocketError::UpgradeFailed("missing upgrade headers".into()));
    }
    if headers.get_str(header::SEC_WEBSOCKET_ACCEPT).map(str::trim) != Some(accept_key(key).as_str()) {
        return Err(WebSocketError::UpgradeFailed("Sec-WebSocket-Accept mismatch".into()));
    }
    Ok(headers
        .get_str(header::SEC_WEBSOCKET_PROTOCOL)
        .map(|p| p.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_headers(extra: &[(&str, &str)]) -> HeaderSet {
        let mut headers = HeaderSet::new();
        headers.set("upgrade", "websocket").unwrap();
        headers.set("connection", "Upgrade").unwrap();
        headers.set("sec-websocket-version", "13").unwrap();
        headers.set("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==").unwrap();
        for (name, value) in extra {
            headers.set(name, value).unwrap();
        }
        headers
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_sixteen_bytes() {
        let key = generate_key();
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn rejects_wrong_version_or_missing_key() {
        let mut headers = upgrade_headers(&[]);
        headers.set("sec-websocket-version", "8").unwrap();
        assert!(validate_upgrade(&headers).is_err());

        let mut headers = upgrade_headers(&[]);
        headers.remove(header::SEC_WEBSOCKET_KEY);
        assert!(validate_upgrade(&headers).is_err());
    }

    #[test]
    fn authorization_subprotocol_is_extracted_and_stripped() {
        let entry = authorization_protocol("libp2p-PeerID bearer=\"abc\"");
        let headers = upgrade_headers(&[("sec-websocket-protocol", &format!("chat, {entry}"))]);
        let upgrade = validate_upgrade(&headers).unwrap();
        assert_eq!(upgrade.protocols, vec!["chat".to_string()]);
        assert_eq!(upgrade.authorization.as_deref(), Some("libp2p-PeerID bearer=\"abc\""));

        let response = upgrade_response(&upgrade).unwrap();
        assert_eq!(response.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers.get_str(header::SEC_WEBSOCKET_PROTOCOL), Some("chat"));
        assert_eq!(
            response.headers.get_str(header::SEC_WEBSOCKET_ACCEPT),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
    }

    #[test]
    fn client_request_keeps_handshake_headers_authoritative() {
        let mut extra = HeaderSet::new();
        extra.set("upgrade", "h2c").unwrap();
        extra.set("x-trace", "1").unwrap();
        let request = client_request("/chat", "peer", "k", &["a".into(), "b".into()], extra).unwrap();
        assert_eq!(request.headers.get_str(header::UPGRADE), Some("websocket"));
        assert_eq!(request.headers.get_str("x-trace"), Some("1"));
        assert_eq!(request.headers.get_str(header::SEC_WEBSOCKET_PROTOCOL), Some("a, b"));
    }
}
