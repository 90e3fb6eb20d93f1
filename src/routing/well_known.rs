//! The discovery endpoint.

use http::{Method, StatusCode};

use crate::http::{HeaderSet, Response};
use crate::routing::cors;
use crate::routing::registrar::{ProtocolMap, Registrar, WELL_KNOWN_PROTOCOLS};
use crate::websocket::{close_code, WebSocket};

pub fn is_well_known(path: &str) -> bool {
    path.trim_end_matches('/') == WELL_KNOWN_PROTOCOLS
}

/// Answer a plain request for the protocol map. Every method except an
/// OPTIONS preflight gets the map. CORS is always on.
pub fn respond(registrar: &Registrar, method: &Method, request_headers: &HeaderSet) -> Response {
    let mut response = if *method == Method::OPTIONS {
        Response::new(StatusCode::NO_CONTENT)
    } else {
        match Response::json(&registrar.protocol_map()) {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(error = %error, "Failed to encode protocol map");
                Response::new(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    };

    cors::apply_for(&[Method::GET], true, method, request_headers, &mut response);
    response
}

/// Send the protocol map as one text message, then close.
pub fn serve_socket(map: &ProtocolMap, socket: &WebSocket) {
    let sent = serde_json::to_string(map)
        .map_err(|e| e.to_string())
        .and_then(|json| socket.send(json).map_err(|e| e.to_string()));
    let code = match sent {
        Ok(()) => close_code::NORMAL,
        Err(error) => {
            tracing::warn!(error = %error, "Failed to send protocol map");
            close_code::INTERNAL_ERROR
        }
    };
    let _ = socket.close(code, "");
}
