//! Keys and peer identities.
//!
//! Public keys travel in their protobuf form (`KeyType` + raw bytes) and a
//! peer id is the identity multihash of that encoding, shown in base58.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::auth::error::AuthError;

/// Protobuf field tags: `Type = 1` (varint) and `Data = 2` (bytes).
const PROTO_KEY_TYPE_TAG: u8 = 0x08;
const PROTO_DATA_TAG: u8 = 0x12;
const KEY_TYPE_ED25519: u8 = 1;
const ED25519_KEY_LEN: usize = 32;

/// Multihash code for "identity" (the digest is the input itself).
const MULTIHASH_IDENTITY: u8 = 0x00;

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(raw: &[u8]) -> Result<Self, AuthError> {
        let raw: [u8; ED25519_KEY_LEN] = raw.try_into().map_err(|_| AuthError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&raw)
            .map(Self)
            .map_err(|_| AuthError::InvalidPublicKey)
    }

    pub fn to_protobuf(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + ED25519_KEY_LEN);
        out.extend_from_slice(&[
            PROTO_KEY_TYPE_TAG,
            KEY_TYPE_ED25519,
            PROTO_DATA_TAG,
            ED25519_KEY_LEN as u8,
        ]);
        out.extend_from_slice(self.0.as_bytes());
        out
    }

    pub fn from_protobuf(bytes: &[u8]) -> Result<Self, AuthError> {
        match bytes {
            [PROTO_KEY_TYPE_TAG, KEY_TYPE_ED25519, PROTO_DATA_TAG, len, raw @ ..]
                if *len as usize == ED25519_KEY_LEN && raw.len() == ED25519_KEY_LEN =>
            {
                Self::from_bytes(raw)
            }
            _ => Err(AuthError::InvalidPublicKey),
        }
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(signature) => self.0.verify(message, &signature).is_ok(),
            Err(_) => false,
        }
    }

    pub fn to_peer_id(&self) -> PeerId {
        let proto = self.to_protobuf();
        let mut bytes = Vec::with_capacity(2 + proto.len());
        bytes.push(MULTIHASH_IDENTITY);
        bytes.push(proto.len() as u8);
        bytes.extend_from_slice(&proto);
        PeerId(bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0.as_bytes()))
    }
}

/// A peer identity derived from its public key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The embedded public key of an identity-multihash peer id.
    pub fn public_key(&self) -> Option<PublicKey> {
        match self.0.as_slice() {
            [MULTIHASH_IDENTITY, len, proto @ ..] if *len as usize == proto.len() => {
                PublicKey::from_protobuf(proto).ok()
            }
            _ => None,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec().map_err(|_| AuthError::InvalidPeerId)?;
        let peer = PeerId(bytes);
        if peer.public_key().is_none() {
            return Err(AuthError::InvalidPeerId);
        }
        Ok(peer)
    }
}

/// Signing capability. Key material stays behind this trait; auth code
/// only ever asks for a public key and signatures.
#[async_trait]
pub trait Identity: Send + Sync {
    fn public_key(&self) -> PublicKey;

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, AuthError>;

    fn peer_id(&self) -> PeerId {
        self.public_key().to_peer_id()
    }
}

/// In-process Ed25519 key pair.
pub struct Ed25519Identity {
    signing_key: SigningKey,
}

impl Ed25519Identity {
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Parse a 64-character hex seed.
    pub fn from_hex(seed: &str) -> Result<Self, AuthError> {
        let bytes = hex::decode(seed.trim()).map_err(|e| AuthError::Signing(format!("invalid hex seed: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuthError::Signing("seed must be 32 bytes".into()))?;
        Ok(Self::from_seed(seed))
    }
}

impl fmt::Debug for Ed25519Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Identity")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Identity for Ed25519Identity {
    fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key())
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, AuthError> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}
