//! Node identity: Ed25519 keypairs and the peer ids derived from them.
//!
//! A [`PeerId`] is the BLAKE3 hash of a domain-separation context plus the
//! Ed25519 verifying key. It doubles as the node's DHT key, so the id
//! space and the key space are the same 256-bit space. Anyone holding the
//! verifying key can recompute the id; nothing else can produce a key
//! that matches it.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroizing, ZeroizeOnDrop};

use crate::error::{ProtoError, Result};
use crate::limits::{KEYPAIR_SEED_SIZE, PEER_ID_SIZE};

/// Domain separation context for deriving peer ids from verifying keys.
const PEER_ID_CONTEXT: &[u8] = b"PASSAGE-PEER-ID-v1";

// ============================================================================
// PeerId
// ============================================================================

/// Stable 256-bit node identifier, the BLAKE3 hash of the node's
/// verifying key under [`PEER_ID_CONTEXT`].
///
/// Ordered and hashable so it can key routing tables and directory maps.
/// Serialized as lowercase hex in every wire and storage format.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Derives the id for an Ed25519 verifying key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(PEER_ID_CONTEXT);
        hasher.update(key.as_bytes());
        PeerId(*hasher.finalize().as_bytes())
    }

    /// Builds an id from raw bytes. Fails unless exactly
    /// [`PEER_ID_SIZE`] bytes are supplied.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PEER_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| ProtoError::InvalidPeerId(format!("expected {PEER_ID_SIZE} bytes, got {}", bytes.len())))?;
        Ok(PeerId(arr))
    }

    /// Parses a lowercase or uppercase hex id.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != PEER_ID_SIZE * 2 {
            return Err(ProtoError::InvalidPeerId(format!(
                "expected {} hex chars, got {}",
                PEER_ID_SIZE * 2,
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| ProtoError::InvalidPeerId(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Lowercase hex rendering, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// True when this id is the hash of `key`.
    pub fn matches_key(&self, key: &VerifyingKey) -> bool {
        *self == PeerId::from_verifying_key(key)
    }

    /// Byte-wise XOR against another id. The DHT layer interprets the
    /// result as its distance metric.
    pub fn xor(&self, other: &PeerId) -> [u8; PEER_ID_SIZE] {
        let mut out = [0u8; PEER_ID_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "PeerId({}..)", &hex[..8])
    }
}

impl FromStr for PeerId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// NodeKeypair
// ============================================================================

/// Ed25519 keypair with the derived [`PeerId`] cached at construction.
///
/// The signing key is zeroized on drop and never printed; `Debug` shows
/// the peer id and a redaction marker.
#[derive(ZeroizeOnDrop)]
pub struct NodeKeypair {
    signing: SigningKey,
    #[zeroize(skip)]
    verifying: VerifyingKey,
    #[zeroize(skip)]
    peer_id: PeerId,
}

impl NodeKeypair {
    /// Generates a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing)
    }

    /// Reconstructs a keypair from a 32-byte seed. Deterministic: the
    /// same seed always yields the same peer id.
    pub fn from_seed(seed: &[u8; KEYPAIR_SEED_SIZE]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    /// Reconstructs a keypair from an untrusted byte slice.
    pub fn from_seed_bytes(bytes: &[u8]) -> Result<Self> {
        let seed: [u8; KEYPAIR_SEED_SIZE] = bytes
            .try_into()
            .map_err(|_| ProtoError::InvalidKey(format!("expected {KEYPAIR_SEED_SIZE} seed bytes, got {}", bytes.len())))?;
        Ok(Self::from_seed(&seed))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        let peer_id = PeerId::from_verifying_key(&verifying);
        NodeKeypair {
            signing,
            verifying,
            peer_id,
        }
    }

    /// The node's peer id.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The public verifying key.
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    /// Public key bytes as carried in hello frames.
    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }

    /// Signs a message with the node's signing key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Seed bytes for persistence, wrapped so the copy is wiped when the
    /// caller drops it.
    pub fn seed(&self) -> Zeroizing<[u8; KEYPAIR_SEED_SIZE]> {
        Zeroizing::new(self.signing.to_bytes())
    }
}

impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("peer_id", &self.peer_id)
            .field("signing", &"[REDACTED]")
            .finish()
    }
}

/// Verifies a detached signature against raw key bytes, checking that the
/// key also hashes to `expected` when a peer id is claimed.
pub fn verify_signature(
    key_bytes: &[u8; 32],
    expected: Option<&PeerId>,
    message: &[u8],
    signature: &[u8; 64],
) -> Result<()> {
    let key = VerifyingKey::from_bytes(key_bytes)
        .map_err(|e| ProtoError::InvalidKey(e.to_string()))?;
    if let Some(id) = expected {
        if !id.matches_key(&key) {
            return Err(ProtoError::PeerIdMismatch);
        }
    }
    let sig = Signature::from_bytes(signature);
    key.verify(message, &sig)
        .map_err(|_| ProtoError::InvalidSignature)
}
