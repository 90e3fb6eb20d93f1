//! Peer-ID authentication over HTTP (`libp2p-PeerID` scheme).
//!
//! # Data Flow
//! ```text
//! Client                                        Server
//!   OPTIONS  challenge-server, public-key  →
//!                                          ←  401 WWW-Authenticate:
//!                                               challenge-client, opaque,
//!                                               public-key, sig
//!   verify server sig, verify_peer
//!   request  opaque, sig, public-key       →
//!                                               open opaque (sig, host, TTL)
//!                                               verify client sig
//!                                          ←  200 Authentication-Info: bearer
//!   cache bearer until TTL or 401
//!   request  bearer                        →  open bearer (sig, host, TTL)
//! ```
//!
//! # Design Decisions
//! - The server is stateless; opaque challenges and bearers are sealed records
//! - Sealed records are signed, not encrypted
//! - Failed checks never say which check failed; the client just gets a new challenge
//! - Time comes from an injectable [`Clock`]

pub mod client;
pub mod clock;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod params;
pub mod server;

pub use client::{AuthToken, PeerIdAuthClient, PeerVerifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::AuthError;
pub use identity::{Ed25519Identity, Identity, PeerId, PublicKey};
pub use params::PEER_ID_AUTH_SCHEME;
pub use server::{AuthOutcome, HostnameVerifier, PeerIdAuth, AUTHENTICATION_INFO};
