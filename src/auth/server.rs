//! Server side of the peer-id handshake.
//!
//! The server keeps no per-client state. Everything it needs to resume a
//! handshake travels inside records it sealed itself: the opaque challenge
//! and the bearer token.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use http::header::{self, HeaderName, HeaderValue};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::auth::clock::{Clock, SystemClock};
use crate::auth::envelope;
use crate::auth::error::AuthError;
use crate::auth::identity::{Identity, PeerId, PublicKey};
use crate::auth::params::{encode_auth_params, parse_auth_header, signing_data, SignValue, BASE64_URL};
use crate::config::AuthConfig;
use crate::http::{HeaderSet, Response};
use crate::observability::metrics::HttpMetrics;

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

pub const AUTHENTICATION_INFO: HeaderName = HeaderName::from_static("authentication-info");

pub type HostnameVerifier = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OpaqueChallenge {
    pub challenge_client: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_public_key: Option<String>,
    pub hostname: String,
    pub creation_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BearerToken {
    pub peer: String,
    pub h: String,
    pub t: u64,
}

/// Result of authenticating one request.
#[derive(Debug)]
pub struct AuthOutcome {
    /// 200 when authenticated, 401 with a challenge, 400 for a rejected
    /// hostname, 500 if signing failed.
    pub status: StatusCode,
    /// Headers to attach to whatever response is sent.
    pub headers: HeaderSet,
    pub peer: Option<PeerId>,
}

impl AuthOutcome {
    fn bare(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderSet::new(),
            peer: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.peer.is_some()
    }

    /// Copy the auth headers onto a response, replacing same-named ones.
    pub fn apply_headers(&self, response: &mut Response) {
        for (name, value) in self.headers.iter() {
            response.headers.insert(name.clone(), value.clone());
        }
    }

    /// The bare auth response: status plus auth headers, no body.
    pub fn into_response(self) -> Response {
        let mut response = Response::new(self.status);
        response.headers = self.headers;
        response
    }
}

/// Verifies clients and issues bearer tokens.
#[derive(Clone)]
pub struct PeerIdAuth {
    identity: Arc<dyn Identity>,
    token_ttl: Duration,
    clock: Arc<dyn Clock>,
    verify_hostname: Option<HostnameVerifier>,
}

impl PeerIdAuth {
    pub fn new(identity: Arc<dyn Identity>) -> Self {
        Self {
            identity,
            token_ttl: DEFAULT_TOKEN_TTL,
            clock: Arc::new(SystemClock),
            verify_hostname: None,
        }
    }

    /// TTL from config; a non-empty `allowed_hostnames` becomes the
    /// hostname check.
    pub fn from_config(identity: Arc<dyn Identity>, config: &AuthConfig) -> Self {
        let auth = Self::new(identity).with_token_ttl(config.token_ttl());
        if config.allowed_hostnames.is_empty() {
            return auth;
        }
        let allowed = config.allowed_hostnames.clone();
        auth.with_hostname_verifier(Arc::new(move |hostname: &str| {
            allowed.iter().any(|h| h.eq_ignore_ascii_case(hostname))
        }))
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hostname_verifier(mut self, verifier: HostnameVerifier) -> Self {
        self.verify_hostname = Some(verifier);
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Run one step of the handshake for a request addressed to `hostname`.
    pub async fn authenticate_request(&self, hostname: &str, authorization: Option<&str>) -> AuthOutcome {
        match self.try_authenticate(hostname, authorization).await {
            Ok(outcome) => {
                let label = match outcome.status {
                    StatusCode::OK => "authenticated",
                    StatusCode::BAD_REQUEST => "bad_hostname",
                    _ => "challenged",
                };
                HttpMetrics::auth_outcome(label);
                outcome
            }
            Err(err) => {
                tracing::error!(hostname, error = %err, "Peer auth signing failed");
                HttpMetrics::auth_outcome("error");
                AuthOutcome::bare(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// `Err` only for local signing failures; every client-side fault
    /// turns into a challenge.
    async fn try_authenticate(&self, hostname: &str, authorization: Option<&str>) -> Result<AuthOutcome, AuthError> {
        if let Some(verify) = &self.verify_hostname {
            if !verify(hostname) {
                tracing::debug!(hostname, "Hostname rejected");
                return Ok(AuthOutcome::bare(StatusCode::BAD_REQUEST));
            }
        }

        let Some(authorization) = authorization.filter(|a| !a.trim().is_empty()) else {
            return self.challenge(hostname, None, Vec::new()).await;
        };
        let fields = match parse_auth_header(authorization) {
            Ok(fields) => fields,
            Err(err) => {
                tracing::debug!(hostname, error = %err, "Unparseable authorization");
                return self.challenge(hostname, None, Vec::new()).await;
            }
        };

        if let Some(bearer) = fields.get("bearer").filter(|b| !b.is_empty()) {
            return match self.open_bearer(hostname, bearer) {
                Ok(peer) => Ok(AuthOutcome {
                    status: StatusCode::OK,
                    headers: HeaderSet::new(),
                    peer: Some(peer),
                }),
                Err(err) => {
                    tracing::debug!(hostname, error = %err, "Bearer token rejected");
                    self.challenge(hostname, None, Vec::new()).await
                }
            };
        }

        let opaque = match fields.get("opaque") {
            Some(sealed) => match self.open_opaque(hostname, sealed) {
                Ok(opaque) => Some(opaque),
                Err(err) => {
                    tracing::debug!(hostname, error = %err, "Opaque challenge rejected");
                    return self.challenge(hostname, None, Vec::new()).await;
                }
            },
            None => None,
        };

        let client_key_text = opaque
            .as_ref()
            .and_then(|o| o.client_public_key.as_deref())
            .or_else(|| fields.get("public-key").map(String::as_str));
        let client_key = match client_key_text.map(decode_public_key).transpose() {
            Ok(key) => key,
            Err(err) => {
                tracing::debug!(hostname, error = %err, "Client public key rejected");
                return self.challenge(hostname, None, Vec::new()).await;
            }
        };

        let server_key = self.identity.public_key().to_protobuf();
        let mut params: Vec<(&'static str, String)> = Vec::new();
        let mut peer = None;

        if let Some(sig) = fields.get("sig") {
            let verified = match (&client_key, &opaque) {
                (Some(key), Some(opaque)) => {
                    let data = signing_data(&[
                        ("challenge-client", SignValue::Str(&opaque.challenge_client)),
                        ("hostname", SignValue::Str(hostname)),
                        ("server-public-key", SignValue::Bytes(&server_key)),
                    ]);
                    BASE64_URL
                        .decode(sig)
                        .map(|sig| key.verify(&data, &sig))
                        .unwrap_or(false)
                }
                _ => false,
            };
            if !verified {
                tracing::debug!(hostname, "Client signature rejected");
                return self.challenge(hostname, client_key.as_ref(), Vec::new()).await;
            }
            if let Some(key) = &client_key {
                let client = key.to_peer_id();
                params.push(("bearer", self.mint_bearer(&client, hostname).await?));
                peer = Some(client);
            }
        }

        if let Some(challenge_server) = fields.get("challenge-server") {
            let Some(key) = &client_key else {
                return self.challenge(hostname, None, Vec::new()).await;
            };
            let client_key_proto = key.to_protobuf();
            let data = signing_data(&[
                ("hostname", SignValue::Str(hostname)),
                ("client-public-key", SignValue::Bytes(&client_key_proto)),
                ("challenge-server", SignValue::Str(challenge_server)),
            ]);
            let sig = self.identity.sign(&data).await?;
            params.push(("public-key", BASE64_URL.encode(&server_key)));
            params.push(("sig", BASE64_URL.encode(sig)));
        }

        match peer {
            Some(peer) => {
                tracing::debug!(hostname, peer = %peer, "Client authenticated");
                let mut headers = HeaderSet::new();
                headers.insert(AUTHENTICATION_INFO, header_value(&encode_auth_params(&params))?);
                Ok(AuthOutcome {
                    status: StatusCode::OK,
                    headers,
                    peer: Some(peer),
                })
            }
            None => self.challenge(hostname, client_key.as_ref(), params).await,
        }
    }

    /// A 401 carrying a fresh challenge plus any parameters already earned.
    async fn challenge(
        &self,
        hostname: &str,
        client_key: Option<&PublicKey>,
        mut params: Vec<(&'static str, String)>,
    ) -> Result<AuthOutcome, AuthError> {
        let challenge_client = generate_challenge();
        let opaque = OpaqueChallenge {
            challenge_client: challenge_client.clone(),
            client_public_key: client_key.map(|k| BASE64_URL.encode(k.to_protobuf())),
            hostname: hostname.to_string(),
            creation_time: self.clock.now_millis(),
        };
        params.push(("challenge-client", challenge_client));
        params.push(("opaque", envelope::seal(self.identity.as_ref(), &opaque).await?));

        let mut headers = HeaderSet::new();
        headers.insert(header::WWW_AUTHENTICATE, header_value(&encode_auth_params(&params))?);
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("www-authenticate"),
        );
        Ok(AuthOutcome {
            status: StatusCode::UNAUTHORIZED,
            headers,
            peer: None,
        })
    }

    async fn mint_bearer(&self, peer: &PeerId, hostname: &str) -> Result<String, AuthError> {
        let token = BearerToken {
            peer: peer.to_string(),
            h: hostname.to_string(),
            t: self.clock.now_millis(),
        };
        envelope::seal(self.identity.as_ref(), &token).await
    }

    fn open_bearer(&self, hostname: &str, sealed: &str) -> Result<PeerId, AuthError> {
        let token: BearerToken = envelope::open(&self.identity.public_key(), sealed)?;
        if token.h != hostname {
            return Err(AuthError::HostnameMismatch);
        }
        self.check_age(token.t)?;
        token.peer.parse()
    }

    fn open_opaque(&self, hostname: &str, sealed: &str) -> Result<OpaqueChallenge, AuthError> {
        let opaque: OpaqueChallenge = envelope::open(&self.identity.public_key(), sealed)?;
        if opaque.hostname != hostname {
            return Err(AuthError::HostnameMismatch);
        }
        self.check_age(opaque.creation_time)?;
        Ok(opaque)
    }

    fn check_age(&self, issued_at: u64) -> Result<(), AuthError> {
        let age = self.clock.now_millis().saturating_sub(issued_at);
        if age > self.token_ttl.as_millis() as u64 {
            return Err(AuthError::TokenExpired);
        }
        Ok(())
    }
}

/// 32 random bytes, base64url.
pub(crate) fn generate_challenge() -> String {
    let bytes: [u8; 32] = rand::random();
    BASE64_URL.encode(bytes)
}

pub(crate) fn decode_public_key(text: &str) -> Result<PublicKey, AuthError> {
    let bytes = BASE64_URL.decode(text).map_err(|_| AuthError::InvalidPublicKey)?;
    PublicKey::from_protobuf(&bytes)
}

fn header_value(value: &str) -> Result<HeaderValue, AuthError> {
    HeaderValue::from_str(value).map_err(|_| AuthError::MalformedHeader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::identity::Ed25519Identity;

    const T0: u64 = 1_700_000_000_000;

    fn server(clock: Arc<ManualClock>) -> PeerIdAuth {
        PeerIdAuth::new(Arc::new(Ed25519Identity::from_seed([9u8; 32])))
            .with_token_ttl(Duration::from_secs(60))
            .with_clock(clock)
    }

    fn bearer_header(sealed: &str) -> String {
        encode_auth_params(&[("bearer", sealed)])
    }

    #[tokio::test]
    async fn missing_header_gets_challenge() {
        let auth = server(Arc::new(ManualClock::new(T0)));
        let outcome = auth.authenticate_request("example.com", None).await;
        assert_eq!(outcome.status, StatusCode::UNAUTHORIZED);
        let challenge = outcome.headers.get_str(header::WWW_AUTHENTICATE).unwrap();
        let params = parse_auth_header(challenge).unwrap();
        assert_eq!(BASE64_URL.decode(&params["challenge-client"]).unwrap().len(), 32);
        assert!(params.contains_key("opaque"));
        assert_eq!(
            outcome.headers.get_str(header::ACCESS_CONTROL_EXPOSE_HEADERS),
            Some("www-authenticate")
        );
    }

    #[tokio::test]
    async fn bearer_respects_ttl_boundary() {
        let clock = Arc::new(ManualClock::new(T0));
        let auth = server(Arc::clone(&clock));
        let client = Ed25519Identity::generate().peer_id();
        let sealed = auth.mint_bearer(&client, "example.com").await.unwrap();

        clock.set(T0 + 60_000 - 1);
        let outcome = auth.authenticate_request("example.com", Some(&bearer_header(&sealed))).await;
        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(outcome.peer, Some(client));

        clock.set(T0 + 60_000 + 1);
        let outcome = auth.authenticate_request("example.com", Some(&bearer_header(&sealed))).await;
        assert_eq!(outcome.status, StatusCode::UNAUTHORIZED);
        assert!(outcome.peer.is_none());
    }

    #[tokio::test]
    async fn bearer_bound_to_hostname() {
        let auth = server(Arc::new(ManualClock::new(T0)));
        let client = Ed25519Identity::generate().peer_id();
        let sealed = auth.mint_bearer(&client, "host-a").await.unwrap();
        let outcome = auth.authenticate_request("host-b", Some(&bearer_header(&sealed))).await;
        assert_eq!(outcome.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn opaque_bound_to_hostname() {
        let auth = server(Arc::new(ManualClock::new(T0)));
        let first = auth.authenticate_request("host-a", None).await;
        let params = parse_auth_header(first.headers.get_str(header::WWW_AUTHENTICATE).unwrap()).unwrap();
        let replay = encode_auth_params(&[("opaque", params["opaque"].as_str()), ("sig", "AAAA")]);
        let outcome = auth.authenticate_request("host-b", Some(&replay)).await;
        assert_eq!(outcome.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bearer_from_other_issuer_rechallenged() {
        let clock = Arc::new(ManualClock::new(T0));
        let auth = server(Arc::clone(&clock));
        let other = PeerIdAuth::new(Arc::new(Ed25519Identity::generate())).with_clock(clock);
        let sealed = other
            .mint_bearer(&Ed25519Identity::generate().peer_id(), "example.com")
            .await
            .unwrap();
        let outcome = auth.authenticate_request("example.com", Some(&bearer_header(&sealed))).await;
        assert_eq!(outcome.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn hostname_verifier_gives_400() {
        let config = AuthConfig {
            allowed_hostnames: vec!["good.example".into()],
            ..AuthConfig::default()
        };
        let auth = PeerIdAuth::from_config(Arc::new(Ed25519Identity::generate()), &config);
        let outcome = auth.authenticate_request("evil.example", None).await;
        assert_eq!(outcome.status, StatusCode::BAD_REQUEST);
        assert!(outcome.headers.is_empty());

        let outcome = auth.authenticate_request("good.example", None).await;
        assert_eq!(outcome.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn garbage_authorization_rechallenged() {
        let auth = server(Arc::new(ManualClock::new(T0)));
        for header in ["Basic abc", "libp2p-PeerID bearer=\"%%%\"", "libp2p-PeerID sig=\"AAAA\""] {
            let outcome = auth.authenticate_request("example.com", Some(header)).await;
            assert_eq!(outcome.status, StatusCode::UNAUTHORIZED, "{header}");
        }
    }
}
