//! Sealed records: signed, tamper-evident, not confidential.
//!
//! A record is serialized to JSON, signed by the issuer, and wrapped in a
//! versioned [`Envelope`] that is itself base64url-encoded for transport.
//! Opening checks the version and signature before any field is read.

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::auth::error::AuthError;
use crate::auth::identity::{Identity, PublicKey};
use crate::auth::params::BASE64_URL;

pub const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    /// base64url of the serialized record
    pub payload: String,
    /// base64url of the issuer's signature over the record bytes
    pub signature: String,
}

pub async fn seal<T: Serialize>(issuer: &dyn Identity, record: &T) -> Result<String, AuthError> {
    let payload = serde_json::to_vec(record).map_err(|_| AuthError::MalformedRecord)?;
    let signature = issuer.sign(&payload).await?;
    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        payload: BASE64_URL.encode(&payload),
        signature: BASE64_URL.encode(signature),
    };
    let bytes = serde_json::to_vec(&envelope).map_err(|_| AuthError::MalformedRecord)?;
    Ok(BASE64_URL.encode(bytes))
}

pub fn open<T: DeserializeOwned>(issuer: &PublicKey, sealed: &str) -> Result<T, AuthError> {
    let bytes = BASE64_URL.decode(sealed).map_err(|_| AuthError::MalformedRecord)?;
    let envelope: Envelope = serde_json::from_slice(&bytes).map_err(|_| AuthError::MalformedRecord)?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(AuthError::MalformedRecord);
    }
    let payload = BASE64_URL
        .decode(&envelope.payload)
        .map_err(|_| AuthError::MalformedRecord)?;
    let signature = BASE64_URL
        .decode(&envelope.signature)
        .map_err(|_| AuthError::InvalidSignature)?;
    if !issuer.verify(&payload, &signature) {
        return Err(AuthError::InvalidSignature);
    }
    serde_json::from_slice(&payload).map_err(|_| AuthError::MalformedRecord)
}
