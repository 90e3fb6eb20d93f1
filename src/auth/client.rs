//! Client side of the peer-id handshake and its token cache.
//!
//! This type holds no transport. `HttpClient` drives the round trips and
//! calls in here to build headers, verify the server and cache tokens.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use dashmap::DashMap;

use crate::auth::clock::{Clock, SystemClock};
use crate::auth::error::AuthError;
use crate::auth::identity::{Identity, PeerId};
use crate::auth::params::{encode_auth_params, parse_auth_header, signing_data, SignValue, BASE64_URL};
use crate::auth::server::{decode_public_key, generate_challenge, DEFAULT_TOKEN_TTL};
use crate::observability::metrics::HttpMetrics;

pub type PeerVerifier = Arc<dyn Fn(&PeerId) -> bool + Send + Sync>;

/// A cached credential for one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    /// The server identity the handshake proved.
    pub peer: PeerId,
    /// Expiry, in clock milliseconds.
    pub expires_at: u64,
    /// Full `Authorization` header value to send.
    pub authorization: String,
}

/// State kept between the challenge request and the server's answer.
#[derive(Debug, Clone)]
pub struct PendingChallenge {
    challenge_server: String,
    /// `Authorization` value for the `OPTIONS` request.
    pub authorization: String,
}

pub struct PeerIdAuthClient {
    identity: Arc<dyn Identity>,
    token_ttl: Duration,
    clock: Arc<dyn Clock>,
    verify_peer: Option<PeerVerifier>,
    tokens: DashMap<String, AuthToken>,
}

impl PeerIdAuthClient {
    pub fn new(identity: Arc<dyn Identity>) -> Self {
        Self {
            identity,
            token_ttl: DEFAULT_TOKEN_TTL,
            clock: Arc::new(SystemClock),
            verify_peer: None,
            tokens: DashMap::new(),
        }
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reject servers whose proven identity fails `verify`.
    pub fn with_peer_verifier(mut self, verify: PeerVerifier) -> Self {
        self.verify_peer = Some(verify);
        self
    }

    /// Cache key: the hostname, prefixed by a pinned peer id when known.
    pub fn cache_key(hostname: &str, peer: Option<&PeerId>) -> String {
        match peer {
            Some(peer) => format!("{peer}/{hostname}"),
            None => hostname.to_string(),
        }
    }

    /// A live token for `key`. Expired entries are evicted on the way.
    pub fn cached(&self, key: &str) -> Option<AuthToken> {
        let now = self.clock.now_millis();
        let token = self.tokens.get(key).map(|t| t.clone())?;
        if token.expires_at < now {
            self.tokens.remove(key);
            HttpMetrics::token_cache_size(self.tokens.len());
            return None;
        }
        Some(token)
    }

    pub fn forget(&self, key: &str) {
        self.tokens.remove(key);
        HttpMetrics::token_cache_size(self.tokens.len());
    }

    /// Drop every expired token. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.tokens.len();
        self.tokens.retain(|_, token| token.expires_at >= now);
        let removed = before - self.tokens.len();
        HttpMetrics::token_cache_size(self.tokens.len());
        removed
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Start a handshake: a fresh server challenge plus our public key.
    pub fn begin(&self) -> PendingChallenge {
        let challenge_server = generate_challenge();
        let public_key = BASE64_URL.encode(self.identity.public_key().to_protobuf());
        let authorization = encode_auth_params(&[
            ("challenge-server", challenge_server.as_str()),
            ("public-key", public_key.as_str()),
        ]);
        PendingChallenge {
            challenge_server,
            authorization,
        }
    }

    /// Verify the server's `WWW-Authenticate` answer and sign its challenge.
    /// Returns the proven server identity and the `Authorization` value for
    /// the real request.
    pub async fn respond(
        &self,
        hostname: &str,
        pending: &PendingChallenge,
        www_authenticate: &str,
    ) -> Result<(PeerId, String), AuthError> {
        let fields = parse_auth_header(www_authenticate)?;
        let field = |name: &'static str| fields.get(name).ok_or(AuthError::MissingParam(name));

        let server_key_bytes = BASE64_URL
            .decode(field("public-key")?)
            .map_err(|_| AuthError::InvalidPublicKey)?;
        let server_key = decode_public_key(field("public-key")?)?;
        let server_sig = BASE64_URL
            .decode(field("sig")?)
            .map_err(|_| AuthError::InvalidSignature)?;

        let client_key = self.identity.public_key().to_protobuf();
        let data = signing_data(&[
            ("hostname", SignValue::Str(hostname)),
            ("client-public-key", SignValue::Bytes(&client_key)),
            ("challenge-server", SignValue::Str(&pending.challenge_server)),
        ]);
        if !server_key.verify(&data, &server_sig) {
            return Err(AuthError::InvalidSignature);
        }

        let server = server_key.to_peer_id();
        if let Some(verify) = &self.verify_peer {
            if !verify(&server) {
                tracing::warn!(hostname, peer = %server, "Server identity rejected");
                return Err(AuthError::InvalidPeer);
            }
        }

        let data = signing_data(&[
            ("hostname", SignValue::Str(hostname)),
            ("server-public-key", SignValue::Bytes(&server_key_bytes)),
            ("challenge-client", SignValue::Str(field("challenge-client")?)),
        ]);
        let sig = BASE64_URL.encode(self.identity.sign(&data).await?);
        let public_key = BASE64_URL.encode(&client_key);
        let authorization = encode_auth_params(&[
            ("opaque", field("opaque")?.as_str()),
            ("sig", sig.as_str()),
            ("public-key", public_key.as_str()),
        ]);
        Ok((server, authorization))
    }

    /// Cache a credential for `key`, valid for the token TTL.
    pub fn store(&self, key: &str, peer: PeerId, authorization: String) -> AuthToken {
        let token = AuthToken {
            peer,
            expires_at: self.clock.now_millis() + self.token_ttl.as_millis() as u64,
            authorization,
        };
        self.tokens.insert(key.to_string(), token.clone());
        HttpMetrics::token_cache_size(self.tokens.len());
        token
    }

    /// Swap in the bearer from an `Authentication-Info` header.
    pub fn accept_bearer(&self, key: &str, authentication_info: &str) -> Result<(), AuthError> {
        let fields = parse_auth_header(authentication_info)?;
        let bearer = fields.get("bearer").ok_or(AuthError::MissingParam("bearer"))?;
        if let Some(mut token) = self.tokens.get_mut(key) {
            token.authorization = encode_auth_params(&[("bearer", bearer.as_str())]);
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerIdAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdAuthClient")
            .field("peer_id", &self.identity.peer_id())
            .field("token_ttl", &self.token_ttl)
            .field("cached_tokens", &self.tokens.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::identity::Ed25519Identity;
    use crate::auth::server::{PeerIdAuth, AUTHENTICATION_INFO};
    use http::header;
    use http::StatusCode;

    const T0: u64 = 1_700_000_000_000;

    #[tokio::test]
    async fn full_handshake_without_transport() {
        let clock = Arc::new(ManualClock::new(T0));
        let server_identity = Arc::new(Ed25519Identity::generate());
        let server_peer = server_identity.peer_id();
        let server = PeerIdAuth::new(server_identity).with_clock(clock.clone());
        let client_identity = Arc::new(Ed25519Identity::generate());
        let client_peer = client_identity.peer_id();
        let client = PeerIdAuthClient::new(client_identity).with_clock(clock);

        let pending = client.begin();
        let challenge = server.authenticate_request("host", Some(&pending.authorization)).await;
        assert_eq!(challenge.status, StatusCode::UNAUTHORIZED);

        let www = challenge.headers.get_str(header::WWW_AUTHENTICATE).unwrap();
        let (proven, authorization) = client.respond("host", &pending, www).await.unwrap();
        assert_eq!(proven, server_peer);

        let done = server.authenticate_request("host", Some(&authorization)).await;
        assert_eq!(done.status, StatusCode::OK);
        assert_eq!(done.peer, Some(client_peer.clone()));

        let key = PeerIdAuthClient::cache_key("host", None);
        client.store(&key, proven, authorization);
        client
            .accept_bearer(&key, done.headers.get_str(AUTHENTICATION_INFO).unwrap())
            .unwrap();
        let cached = client.cached(&key).unwrap();
        assert!(cached.authorization.contains("bearer="));

        let again = server.authenticate_request("host", Some(&cached.authorization)).await;
        assert_eq!(again.peer, Some(client_peer));
    }

    #[tokio::test]
    async fn pinned_peer_mismatch_is_invalid_peer() {
        let server = PeerIdAuth::new(Arc::new(Ed25519Identity::generate()));
        let expected = Ed25519Identity::generate().peer_id();
        let client = PeerIdAuthClient::new(Arc::new(Ed25519Identity::generate()))
            .with_peer_verifier(Arc::new(move |peer: &PeerId| *peer == expected));

        let pending = client.begin();
        let challenge = server.authenticate_request("host", Some(&pending.authorization)).await;
        let www = challenge.headers.get_str(header::WWW_AUTHENTICATE).unwrap();
        assert!(matches!(
            client.respond("host", &pending, www).await,
            Err(AuthError::InvalidPeer)
        ));
    }

    #[tokio::test]
    async fn server_signature_bound_to_hostname() {
        let server = PeerIdAuth::new(Arc::new(Ed25519Identity::generate()));
        let client = PeerIdAuthClient::new(Arc::new(Ed25519Identity::generate()));
        let pending = client.begin();
        let challenge = server.authenticate_request("host-a", Some(&pending.authorization)).await;
        let www = challenge.headers.get_str(header::WWW_AUTHENTICATE).unwrap();
        assert!(matches!(
            client.respond("host-b", &pending, www).await,
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn expired_tokens_are_evicted_lazily_and_by_sweep() {
        let clock = Arc::new(ManualClock::new(T0));
        let client = PeerIdAuthClient::new(Arc::new(Ed25519Identity::generate()))
            .with_clock(clock.clone())
            .with_token_ttl(Duration::from_secs(10));
        let peer = Ed25519Identity::generate().peer_id();
        client.store("a", peer.clone(), "x".into());
        client.store("b", peer, "y".into());

        clock.advance(Duration::from_secs(11));
        assert!(client.cached("a").is_none());
        assert_eq!(client.len(), 1);
        assert_eq!(client.purge_expired(), 1);
        assert!(client.is_empty());
    }

    #[test]
    fn cache_key_includes_pinned_peer() {
        let peer = Ed25519Identity::from_seed([3u8; 32]).peer_id();
        assert_eq!(PeerIdAuthClient::cache_key("h", None), "h");
        assert_eq!(PeerIdAuthClient::cache_key("h", Some(&peer)), format!("{peer}/h"));
    }
}
