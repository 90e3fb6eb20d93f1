use thiserror::Error;

/// Failures of the peer-id handshake. Servers never echo these to clients;
/// any of them simply produces a fresh challenge.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization header exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("malformed authorization header")]
    MalformedHeader,

    #[error("missing auth parameter `{0}`")]
    MissingParam(&'static str),

    #[error("unsupported or malformed public key")]
    InvalidPublicKey,

    #[error("invalid peer id")]
    InvalidPeerId,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("peer identity rejected")]
    InvalidPeer,

    #[error("token expired")]
    TokenExpired,

    #[error("record was issued for another hostname")]
    HostnameMismatch,

    #[error("malformed sealed record")]
    MalformedRecord,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("response has no {0} header")]
    MissingAuthHeader(&'static str),

    #[error("request already carries an Authorization header")]
    AuthorizationPresent,
}
