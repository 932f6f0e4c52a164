//! Wire formats for live channels: the authenticated hello, relay
//! control frames, signaling payloads, rendezvous tickets, and the
//! tiny UDP probe packets used by punch and connectivity checks.

use std::fmt;
use std::net::SocketAddr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ProtoError, Result};
use crate::identity::{verify_signature, NodeKeypair, PeerId};
use crate::limits::{
    MAX_CANDIDATES, MAX_DHT_VALUE_SIZE, MAX_HELLO_SIZE, MAX_HELLO_SKEW_SECS, MAX_RELAY_DATA_SIZE,
    MAX_RELAY_FRAME_SIZE, MAX_SIGNAL_SIZE,
};
use crate::PROTOCOL_VERSION;

/// Domain separation context for hello signatures.
const HELLO_SIGN_CONTEXT: &[u8] = b"PASSAGE-HELLO-v1";

/// Domain separation context for deriving punch rendezvous keys.
const PUNCH_KEY_CONTEXT: &[u8] = b"PASSAGE-PUNCH-KEY-v1";

/// Ed25519 signatures are longer than serde's array support; carried
/// through a custom module instead.
mod sig_serde {
    use super::*;

    pub fn serialize<S: Serializer>(
        sig: &[u8; 64],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(sig)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<[u8; 64], D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }
}

// ============================================================================
// Hello
// ============================================================================

/// First frame in both directions on every live channel.
///
/// Binds the claimed peer id to the presented verifying key and proves
/// possession of the signing key over a fresh nonce. Until both sides'
/// hellos verify, nothing else is read from the stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version.
    pub version: u16,
    /// Claimed peer id.
    pub peer_id: PeerId,
    /// Ed25519 verifying key that must hash to `peer_id`.
    pub verifying_key: [u8; 32],
    /// Issue time, unix seconds; skew-checked against the local clock.
    pub issued_at: u64,
    /// Fresh random nonce covered by the signature.
    pub nonce: [u8; 16],
    /// Signature over the context, id, timestamp, and nonce.
    #[serde(with = "sig_serde")]
    pub signature: [u8; 64],
}

impl Hello {
    /// Builds and signs a hello for the local node.
    pub fn new(keypair: &NodeKeypair, now: u64) -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let peer_id = keypair.peer_id();
        let message = Self::signing_bytes(&peer_id, now, &nonce);
        Hello {
            version: PROTOCOL_VERSION,
            peer_id,
            verifying_key: keypair.verifying_key_bytes(),
            issued_at: now,
            nonce,
            signature: keypair.sign(&message),
        }
    }

    fn signing_bytes(peer_id: &PeerId, issued_at: u64, nonce: &[u8; 16]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HELLO_SIGN_CONTEXT.len() + 32 + 8 + 16);
        out.extend_from_slice(HELLO_SIGN_CONTEXT);
        out.extend_from_slice(peer_id.as_bytes());
        out.extend_from_slice(&issued_at.to_be_bytes());
        out.extend_from_slice(nonce);
        out
    }

    /// Verifies version, key binding, signature, timestamp skew, and,
    /// when the caller dialed a specific peer, the claimed identity.
    pub fn verify(&self, expected: Option<&PeerId>, now: u64) -> Result<PeerId> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtoError::UnsupportedVersion(self.version));
        }
        if let Some(id) = expected {
            if *id != self.peer_id {
                return Err(ProtoError::PeerIdMismatch);
            }
        }
        let skew = now.abs_diff(self.issued_at);
        if skew > MAX_HELLO_SKEW_SECS {
            return Err(ProtoError::Expired {
                expired_at: self.issued_at,
                now,
            });
        }
        let message = Self::signing_bytes(&self.peer_id, self.issued_at, &self.nonce);
        verify_signature(&self.verifying_key, Some(&self.peer_id), &message, &self.signature)?;
        Ok(self.peer_id)
    }

    /// Serializes the hello, enforcing the frame cap.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_HELLO_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_HELLO_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Parses an inbound hello frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_HELLO_SIZE {
            return Err(ProtoError::InputTooLarge {
                max: MAX_HELLO_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bincode::deserialize(bytes)?)
    }
}

// ============================================================================
// Session ids
// ============================================================================

/// Random id shared by both parties of a relay session or negotiation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        SessionId(bytes)
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw id bytes, usable as a probe token.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ============================================================================
// Relay frames
// ============================================================================

/// Control and data frames exchanged with a relay, length-prefixed
/// bincode over the relay hop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Ask the relay to pair this connection with `target`.
    Register {
        /// Peer the registrant wants to reach.
        target: PeerId,
    },
    /// Registration accepted, counterpart not present yet.
    Waiting,
    /// Both parties present; forwarding starts.
    Ready {
        /// Session id shared by both hops.
        session_id: SessionId,
    },
    /// Opaque application bytes, forwarded verbatim.
    Data {
        /// Payload; the relay never inspects it.
        payload: Vec<u8>,
    },
    /// Session teardown.
    Close {
        /// Human-readable cause.
        reason: String,
    },
}

impl RelayFrame {
    /// Frame-specific bounds.
    pub fn validate(&self) -> Result<()> {
        if let RelayFrame::Data { payload } = self {
            if payload.len() > MAX_RELAY_DATA_SIZE {
                return Err(ProtoError::PayloadTooLarge {
                    max: MAX_RELAY_DATA_SIZE,
                    actual: payload.len(),
                });
            }
        }
        Ok(())
    }

    /// Serializes the frame, enforcing the frame cap.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_RELAY_FRAME_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_RELAY_FRAME_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Parses and validates an inbound frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_RELAY_FRAME_SIZE {
            return Err(ProtoError::InputTooLarge {
                max: MAX_RELAY_FRAME_SIZE,
                actual: bytes.len(),
            });
        }
        let frame: RelayFrame = bincode::deserialize(bytes)?;
        frame.validate()?;
        Ok(frame)
    }
}

// ============================================================================
// Signaling
// ============================================================================

/// How a candidate address was gathered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    /// Bound local interface address.
    Host,
    /// Externally observed reflexive address.
    Reflexive,
}

/// One candidate address in an offer or answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAddr {
    /// Dialable address.
    pub addr: SocketAddr,
    /// Gathering provenance.
    pub kind: CandidateKind,
}

/// Offer/answer payloads carried by a signaling channel. JSON encoded
/// so external signaling services can route on the envelope fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Open a negotiation with the sender's candidates.
    Offer {
        /// Negotiation id.
        session: SessionId,
        /// Sender.
        from: PeerId,
        /// Addressee.
        to: PeerId,
        /// Sender's candidates, best first.
        candidates: Vec<CandidateAddr>,
    },
    /// Accept a negotiation and return the responder's candidates.
    Answer {
        /// Negotiation id from the offer.
        session: SessionId,
        /// Sender.
        from: PeerId,
        /// Addressee.
        to: PeerId,
        /// Responder's candidates, best first.
        candidates: Vec<CandidateAddr>,
    },
    /// Refuse a negotiation.
    Reject {
        /// Negotiation id from the offer.
        session: SessionId,
        /// Sender.
        from: PeerId,
        /// Addressee.
        to: PeerId,
        /// Human-readable refusal.
        reason: String,
    },
}

impl SignalPayload {
    /// The negotiation this payload belongs to.
    pub fn session(&self) -> SessionId {
        match self {
            SignalPayload::Offer { session, .. }
            | SignalPayload::Answer { session, .. }
            | SignalPayload::Reject { session, .. } => *session,
        }
    }

    /// The addressee.
    pub fn recipient(&self) -> PeerId {
        match self {
            SignalPayload::Offer { to, .. }
            | SignalPayload::Answer { to, .. }
            | SignalPayload::Reject { to, .. } => *to,
        }
    }

    /// The sender.
    pub fn sender(&self) -> PeerId {
        match self {
            SignalPayload::Offer { from, .. }
            | SignalPayload::Answer { from, .. }
            | SignalPayload::Reject { from, .. } => *from,
        }
    }

    /// Candidate-count bound.
    pub fn validate(&self) -> Result<()> {
        let candidates = match self {
            SignalPayload::Offer { candidates, .. } | SignalPayload::Answer { candidates, .. } => {
                candidates.len()
            }
            SignalPayload::Reject { .. } => 0,
        };
        if candidates > MAX_CANDIDATES {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_CANDIDATES,
                actual: candidates,
            });
        }
        Ok(())
    }

    /// Serializes, enforcing the signaling cap.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_SIGNAL_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_SIGNAL_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Parses and validates an inbound signaling payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_SIGNAL_SIZE {
            return Err(ProtoError::InputTooLarge {
                max: MAX_SIGNAL_SIZE,
                actual: bytes.len(),
            });
        }
        let payload: SignalPayload = serde_json::from_slice(bytes)?;
        payload.validate()?;
        Ok(payload)
    }
}

// ============================================================================
// Rendezvous
// ============================================================================

/// Punch coordination record written by the initiator.
///
/// Delivered over signaling when live, otherwise stored in the DHT under
/// [`punch_key`] of the responder, who polls it while its punch listener
/// runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RendezvousTicket {
    /// Initiating peer.
    pub initiator: PeerId,
    /// Target peer.
    pub responder: PeerId,
    /// Initiator's reflexive UDP address.
    pub initiator_addr: SocketAddr,
    /// Agreed probe time, unix milliseconds.
    pub punch_at: u64,
    /// Probe token echoed in both directions.
    pub nonce: [u8; 16],
}

impl RendezvousTicket {
    /// Builds a ticket with a fresh probe token.
    pub fn new(
        initiator: PeerId,
        responder: PeerId,
        initiator_addr: SocketAddr,
        punch_at: u64,
    ) -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        RendezvousTicket {
            initiator,
            responder,
            initiator_addr,
            punch_at,
            nonce,
        }
    }

    /// Serializes for DHT storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_DHT_VALUE_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_DHT_VALUE_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Parses a stored ticket.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_DHT_VALUE_SIZE {
            return Err(ProtoError::InputTooLarge {
                max: MAX_DHT_VALUE_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// DHT key a peer polls for punch tickets addressed to it.
pub fn punch_key(responder: &PeerId) -> PeerId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(PUNCH_KEY_CONTEXT);
    hasher.update(responder.as_bytes());
    let digest = *hasher.finalize().as_bytes();
    PeerId::from_bytes(&digest).unwrap_or(*responder)
}

// ============================================================================
// Probe packets
// ============================================================================

/// Probe packet kinds. Punch probes open NAT mappings; check probes
/// validate negotiated candidate pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeKind {
    /// Punch probe.
    Punch,
    /// Punch acknowledgement.
    PunchAck,
    /// Connectivity check.
    Check,
    /// Connectivity check acknowledgement.
    CheckAck,
}

impl ProbeKind {
    const fn prefix(&self) -> &'static [u8] {
        match self {
            ProbeKind::Punch => b"PSG-PUNCH1",
            ProbeKind::PunchAck => b"PSG-PUNCHA",
            ProbeKind::Check => b"PSG-CHECK1",
            ProbeKind::CheckAck => b"PSG-CHECKA",
        }
    }
}

/// Builds a 26-byte probe packet carrying a 16-byte token.
pub fn probe_bytes(kind: ProbeKind, token: &[u8; 16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(26);
    out.extend_from_slice(kind.prefix());
    out.extend_from_slice(token);
    out
}

/// Parses a probe packet; anything else yields `None`.
pub fn parse_probe(buf: &[u8]) -> Option<(ProbeKind, [u8; 16])> {
    if buf.len() != 26 {
        return None;
    }
    let kind = match &buf[..10] {
        p if p == ProbeKind::Punch.prefix() => ProbeKind::Punch,
        p if p == ProbeKind::PunchAck.prefix() => ProbeKind::PunchAck,
        p if p == ProbeKind::Check.prefix() => ProbeKind::Check,
        p if p == ProbeKind::CheckAck.prefix() => ProbeKind::CheckAck,
        _ => return None,
    };
    let token: [u8; 16] = buf[10..].try_into().ok()?;
    Some((kind, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn keypair() -> NodeKeypair {
        NodeKeypair::generate()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), port))
    }

    // ==== Hello Tests ====

    #[test]
    fn hello_verifies_for_expected_peer() {
        let kp = keypair();
        let hello = Hello::new(&kp, 1_700_000_000);
        let id = hello
            .verify(Some(&kp.peer_id()), 1_700_000_010)
            .unwrap();
        assert_eq!(id, kp.peer_id());
    }

    #[test]
    fn hello_rejects_identity_mismatch() {
        let kp = keypair();
        let other = keypair().peer_id();
        let hello = Hello::new(&kp, 1_700_000_000);
        assert!(matches!(
            hello.verify(Some(&other), 1_700_000_000),
            Err(ProtoError::PeerIdMismatch)
        ));
    }

    #[test]
    fn hello_rejects_forged_identity() {
        let kp = keypair();
        let mut hello = Hello::new(&kp, 1_700_000_000);
        hello.peer_id = keypair().peer_id();
        assert!(hello.verify(None, 1_700_000_000).is_err());
    }

    #[test]
    fn hello_rejects_stale_timestamp() {
        let kp = keypair();
        let hello = Hello::new(&kp, 1_700_000_000);
        let later = 1_700_000_000 + MAX_HELLO_SKEW_SECS + 1;
        assert!(matches!(
            hello.verify(None, later),
            Err(ProtoError::Expired { .. })
        ));
    }

    #[test]
    fn hello_rejects_tampered_nonce() {
        let kp = keypair();
        let mut hello = Hello::new(&kp, 1_700_000_000);
        hello.nonce[0] ^= 1;
        assert!(hello.verify(None, 1_700_000_000).is_err());
    }

    #[test]
    fn hello_wire_roundtrip_fits_cap() {
        let kp = keypair();
        let hello = Hello::new(&kp, 42);
        let bytes = hello.to_bytes().unwrap();
        assert!(bytes.len() <= MAX_HELLO_SIZE);
        let back = Hello::from_bytes(&bytes).unwrap();
        assert_eq!(back, hello);
    }

    // ==== Relay Frame Tests ====

    #[test]
    fn relay_frame_roundtrip() {
        let frames = vec![
            RelayFrame::Register {
                target: keypair().peer_id(),
            },
            RelayFrame::Waiting,
            RelayFrame::Ready {
                session_id: SessionId::generate(),
            },
            RelayFrame::Data {
                payload: vec![9u8; 128],
            },
            RelayFrame::Close {
                reason: "idle".into(),
            },
        ];
        for frame in frames {
            let back = RelayFrame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
            assert_eq!(back, frame);
        }
    }

    #[test]
    fn relay_data_cap_enforced() {
        let frame = RelayFrame::Data {
            payload: vec![0u8; MAX_RELAY_DATA_SIZE + 1],
        };
        assert!(frame.to_bytes().is_err());
    }

    // ==== Signaling Tests ====

    #[test]
    fn signal_roundtrip() {
        let offer = SignalPayload::Offer {
            session: SessionId::generate(),
            from: keypair().peer_id(),
            to: keypair().peer_id(),
            candidates: vec![CandidateAddr {
                addr: addr(5000),
                kind: CandidateKind::Reflexive,
            }],
        };
        let back = SignalPayload::from_bytes(&offer.to_bytes().unwrap()).unwrap();
        assert_eq!(back, offer);
        assert_eq!(back.session(), offer.session());
    }

    #[test]
    fn signal_candidate_cap() {
        let candidates = (0..MAX_CANDIDATES + 1)
            .map(|i| CandidateAddr {
                addr: addr(6000 + i as u16),
                kind: CandidateKind::Host,
            })
            .collect();
        let offer = SignalPayload::Offer {
            session: SessionId::generate(),
            from: keypair().peer_id(),
            to: keypair().peer_id(),
            candidates,
        };
        assert!(offer.validate().is_err());
    }

    // ==== Rendezvous Tests ====

    #[test]
    fn ticket_roundtrip() {
        let ticket = RendezvousTicket::new(
            keypair().peer_id(),
            keypair().peer_id(),
            addr(8890),
            1_700_000_123_456,
        );
        let back = RendezvousTicket::from_bytes(&ticket.to_bytes().unwrap()).unwrap();
        assert_eq!(back, ticket);
    }

    #[test]
    fn punch_key_is_stable_and_distinct() {
        let a = keypair().peer_id();
        let b = keypair().peer_id();
        assert_eq!(punch_key(&a), punch_key(&a));
        assert_ne!(punch_key(&a), punch_key(&b));
        assert_ne!(punch_key(&a), a);
    }

    // ==== Probe Tests ====

    #[test]
    fn probe_roundtrip_all_kinds() {
        let token = [7u8; 16];
        for kind in [
            ProbeKind::Punch,
            ProbeKind::PunchAck,
            ProbeKind::Check,
            ProbeKind::CheckAck,
        ] {
            let bytes = probe_bytes(kind, &token);
            assert_eq!(parse_probe(&bytes), Some((kind, token)));
        }
    }

    #[test]
    fn probe_rejects_noise() {
        assert!(parse_probe(b"short").is_none());
        assert!(parse_probe(&[0u8; 26]).is_none());
        assert!(parse_probe(&[0u8; 64]).is_none());
    }
}
