//! Auth header parameters and the signed-tuple encoding.

use std::collections::HashMap;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;

use crate::auth::error::AuthError;

pub const PEER_ID_AUTH_SCHEME: &str = "libp2p-PeerID";

/// Upper bound on an auth header we are willing to parse.
pub const MAX_AUTH_HEADER_SIZE: usize = 2048;

/// URL-safe base64 that pads on encode and accepts either form on decode.
pub const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// `libp2p-PeerID k1="v1", k2="v2"`
pub fn encode_auth_params<K: AsRef<str>, V: AsRef<str>>(params: &[(K, V)]) -> String {
    let fields: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k.as_ref(), v.as_ref()))
        .collect();
    format!("{PEER_ID_AUTH_SCHEME} {}", fields.join(", "))
}

/// Parse a `libp2p-PeerID` header into its parameters.
pub fn parse_auth_header(header: &str) -> Result<HashMap<String, String>, AuthError> {
    if header.len() > MAX_AUTH_HEADER_SIZE {
        return Err(AuthError::HeaderTooLarge {
            limit: MAX_AUTH_HEADER_SIZE,
        });
    }
    let rest = header
        .trim()
        .strip_prefix(PEER_ID_AUTH_SCHEME)
        .ok_or(AuthError::MalformedHeader)?;
    if !rest.is_empty() && !rest.starts_with(' ') {
        return Err(AuthError::MalformedHeader);
    }

    let mut params = HashMap::new();
    for field in rest.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        let (key, value) = field.split_once('=').ok_or(AuthError::MalformedHeader)?;
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        params.insert(key.trim().to_string(), value.to_string());
    }
    Ok(params)
}

/// One value of a signed tuple.
#[derive(Debug, Clone, Copy)]
pub enum SignValue<'a> {
    Str(&'a str),
    Bytes(&'a [u8]),
}

impl SignValue<'_> {
    fn as_bytes(&self) -> &[u8] {
        match self {
            SignValue::Str(s) => s.as_bytes(),
            SignValue::Bytes(b) => b,
        }
    }
}

/// Bytes covered by a handshake signature: the scheme, then each
/// `key=value` sorted by key and prefixed with its uvarint length.
pub fn signing_data(params: &[(&str, SignValue<'_>)]) -> Vec<u8> {
    let mut sorted: Vec<&(&str, SignValue<'_>)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = PEER_ID_AUTH_SCHEME.as_bytes().to_vec();
    for (key, value) in sorted {
        let value = value.as_bytes();
        write_uvarint(&mut out, key.len() + 1 + value.len());
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value);
    }
    out
}

fn write_uvarint(out: &mut Vec<u8>, mut n: usize) {
    while n >= 0x80 {
        out.push((n as u8 & 0x7F) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
}
