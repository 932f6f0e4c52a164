//! Store-and-forward envelopes carried by the gossip layer.

use std::collections::BTreeSet;
use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};
use crate::identity::PeerId;
use crate::limits::{
    DEFAULT_TTL_HOPS, GOSSIP_TTL_SECS, MAX_ENVELOPE_SIZE, MAX_GOSSIP_FRAME_SIZE,
    MAX_GOSSIP_PAYLOAD_SIZE, MAX_SEEN_BY, MAX_TTL_HOPS,
};

/// Globally unique envelope id, 32 random bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId([u8; 32]);

impl MessageId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        MessageId(bytes)
    }

    /// Builds an id from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MessageId(bytes)
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "MessageId({}..)", &hex[..8])
    }
}

/// One store-and-forward message in flight.
///
/// `ttl_hops` strictly decreases at every forwarding step and an
/// envelope with `ttl_hops == 0` is never forwarded again. `seen_by`
/// prevents pushing the same envelope back to a peer that already
/// handled it; it is bounded, so duplicate suppression by `message_id`
/// remains the primary defense.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GossipEnvelope {
    /// Unique envelope id, the dedup key.
    pub message_id: MessageId,
    /// Original sender.
    pub origin: PeerId,
    /// Final addressee.
    pub destination: PeerId,
    /// Opaque application payload.
    pub payload: Vec<u8>,
    /// Remaining hop budget.
    pub ttl_hops: u8,
    /// Peers known to have held this envelope.
    pub seen_by: BTreeSet<PeerId>,
    /// Creation time, unix seconds.
    pub issued_at: u64,
}

impl GossipEnvelope {
    /// Creates an envelope with the default hop budget. The origin is
    /// pre-seeded into `seen_by` so nothing routes the envelope back.
    pub fn new(origin: PeerId, destination: PeerId, payload: Vec<u8>, now: u64) -> Result<Self> {
        if payload.len() > MAX_GOSSIP_PAYLOAD_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_GOSSIP_PAYLOAD_SIZE,
                actual: payload.len(),
            });
        }
        let mut seen_by = BTreeSet::new();
        seen_by.insert(origin);
        Ok(GossipEnvelope {
            message_id: MessageId::generate(),
            origin,
            destination,
            payload,
            ttl_hops: DEFAULT_TTL_HOPS,
            seen_by,
            issued_at: now,
        })
    }

    /// Wall-clock expiry check.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.issued_at.saturating_add(GOSSIP_TTL_SECS)
    }

    /// Whether the envelope may be forwarded at all.
    pub fn can_forward(&self, now: u64) -> bool {
        self.ttl_hops > 0 && !self.is_expired(now)
    }

    /// Whether `peer` already held this envelope.
    pub fn has_seen(&self, peer: &PeerId) -> bool {
        self.seen_by.contains(peer)
    }

    /// Spends one hop: decrements the budget and records `forwarder` in
    /// `seen_by`. Fails when the budget is already exhausted.
    pub fn record_hop(&mut self, forwarder: PeerId) -> Result<()> {
        if self.ttl_hops == 0 {
            return Err(ProtoError::HopBudgetExhausted);
        }
        self.ttl_hops -= 1;
        if self.seen_by.len() < MAX_SEEN_BY {
            self.seen_by.insert(forwarder);
        }
        Ok(())
    }

    /// Structural validation applied to inbound envelopes.
    pub fn validate(&self) -> Result<()> {
        if self.payload.len() > MAX_GOSSIP_PAYLOAD_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_GOSSIP_PAYLOAD_SIZE,
                actual: self.payload.len(),
            });
        }
        if self.ttl_hops > MAX_TTL_HOPS {
            return Err(ProtoError::HopBudgetExhausted);
        }
        if self.seen_by.len() > MAX_SEEN_BY {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_SEEN_BY,
                actual: self.seen_by.len(),
            });
        }
        Ok(())
    }

    /// Serializes the envelope, enforcing the envelope cap.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_ENVELOPE_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Parses and validates an inbound envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(ProtoError::InputTooLarge {
                max: MAX_ENVELOPE_SIZE,
                actual: bytes.len(),
            });
        }
        let envelope: GossipEnvelope = bincode::deserialize(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

/// Delivery acknowledgement that flows back through the gossip mesh.
///
/// Holders that receive an ack drop their spooled copy and remember the
/// id, so a later re-offer of the same envelope is refused instead of
/// re-spooled.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GossipAck {
    /// The envelope being acknowledged.
    pub message_id: MessageId,
    /// The peer that delivered or discarded the envelope.
    pub acked_by: PeerId,
    /// Ack creation time, unix seconds.
    pub issued_at: u64,
}

/// One frame on a gossip exchange, either direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GossipFrame {
    /// An envelope pushed to the receiving peer.
    Envelope(GossipEnvelope),
    /// A delivery acknowledgement.
    Ack(GossipAck),
}

impl GossipFrame {
    /// Serializes the frame, enforcing the frame cap.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_GOSSIP_FRAME_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_GOSSIP_FRAME_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Parses an inbound frame, validating any carried envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_GOSSIP_FRAME_SIZE {
            return Err(ProtoError::InputTooLarge {
                max: MAX_GOSSIP_FRAME_SIZE,
                actual: bytes.len(),
            });
        }
        let frame: GossipFrame = bincode::deserialize(bytes)?;
        if let GossipFrame::Envelope(envelope) = &frame {
            envelope.validate()?;
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeKeypair;

    fn pair() -> (PeerId, PeerId) {
        (
            NodeKeypair::generate().peer_id(),
            NodeKeypair::generate().peer_id(),
        )
    }

    #[test]
    fn new_envelope_seeds_origin_into_seen_by() {
        let (origin, dest) = pair();
        let env = GossipEnvelope::new(origin, dest, b"hi".to_vec(), 100).unwrap();
        assert_eq!(env.ttl_hops, DEFAULT_TTL_HOPS);
        assert!(env.has_seen(&origin));
        assert!(!env.has_seen(&dest));
    }

    #[test]
    fn record_hop_decrements_and_records() {
        let (origin, dest) = pair();
        let forwarder = NodeKeypair::generate().peer_id();
        let mut env = GossipEnvelope::new(origin, dest, vec![1], 0).unwrap();

        env.record_hop(forwarder).unwrap();
        assert_eq!(env.ttl_hops, DEFAULT_TTL_HOPS - 1);
        assert!(env.has_seen(&forwarder));
    }

    #[test]
    fn exhausted_budget_refuses_hops() {
        let (origin, dest) = pair();
        let mut env = GossipEnvelope::new(origin, dest, vec![], 0).unwrap();
        env.ttl_hops = 0;
        let result = env.record_hop(NodeKeypair::generate().peer_id());
        assert!(matches!(result, Err(ProtoError::HopBudgetExhausted)));
        assert!(!env.can_forward(0));
    }

    #[test]
    fn wall_clock_expiry() {
        let (origin, dest) = pair();
        let env = GossipEnvelope::new(origin, dest, vec![], 1000).unwrap();
        assert!(!env.is_expired(1000 + GOSSIP_TTL_SECS - 1));
        assert!(env.is_expired(1000 + GOSSIP_TTL_SECS));
        assert!(!env.can_forward(1000 + GOSSIP_TTL_SECS));
    }

    #[test]
    fn oversized_payload_rejected_at_construction() {
        let (origin, dest) = pair();
        let payload = vec![0u8; MAX_GOSSIP_PAYLOAD_SIZE + 1];
        assert!(GossipEnvelope::new(origin, dest, payload, 0).is_err());
    }

    #[test]
    fn inbound_hop_budget_claim_is_capped() {
        let (origin, dest) = pair();
        let mut env = GossipEnvelope::new(origin, dest, vec![], 0).unwrap();
        env.ttl_hops = MAX_TTL_HOPS + 1;
        let bytes = bincode::serialize(&env).unwrap();
        assert!(GossipEnvelope::from_bytes(&bytes).is_err());
    }

    #[test]
    fn wire_roundtrip() {
        let (origin, dest) = pair();
        let mut env = GossipEnvelope::new(origin, dest, b"payload".to_vec(), 7).unwrap();
        env.record_hop(NodeKeypair::generate().peer_id()).unwrap();

        let bytes = env.to_bytes().unwrap();
        let back = GossipEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn oversized_input_rejected_before_decode() {
        let big = vec![0u8; MAX_ENVELOPE_SIZE + 1];
        assert!(matches!(
            GossipEnvelope::from_bytes(&big),
            Err(ProtoError::InputTooLarge { .. })
        ));
    }

    #[test]
    fn frame_roundtrips_both_variants() {
        let (origin, dest) = pair();
        let env = GossipEnvelope::new(origin, dest, b"x".to_vec(), 5).unwrap();
        let ack = GossipAck {
            message_id: env.message_id,
            acked_by: dest,
            issued_at: 9,
        };

        for frame in [GossipFrame::Envelope(env), GossipFrame::Ack(ack)] {
            let bytes = frame.to_bytes().unwrap();
            assert_eq!(GossipFrame::from_bytes(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn frame_rejects_invalid_carried_envelope() {
        let (origin, dest) = pair();
        let mut env = GossipEnvelope::new(origin, dest, vec![], 0).unwrap();
        env.ttl_hops = MAX_TTL_HOPS + 1;
        let bytes = bincode::serialize(&GossipFrame::Envelope(env)).unwrap();
        assert!(GossipFrame::from_bytes(&bytes).is_err());
    }
}
