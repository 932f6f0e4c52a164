//! Directory records: what the local node remembers about a peer.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::endpoint::{Endpoint, PeerAnnouncement, Tier};
use crate::error::{ProtoError, Result};
use crate::identity::PeerId;
use crate::limits::{DIRECTORY_RECORD_TTL_SECS, MAX_ENDPOINTS_PER_RECORD, MAX_PEER_RECORD_SIZE};

/// Local trust posture toward a peer. Advisory: the authorization seam
/// decides, this only feeds it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    /// No signal either way.
    #[default]
    Unknown,
    /// Completed at least one authenticated handshake.
    Trusted,
    /// Observed a protocol violation; connection attempts still allowed
    /// but surfaced to policy.
    Flagged,
}

/// Cached reachability knowledge for one peer.
///
/// Advisory by design: losing a record costs a DHT lookup, nothing else.
/// `last_successful_tier` is a dialing hint and is only ever written
/// through [`PeerRecord::mark_connected`] after a confirmed handshake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// The peer this record describes.
    pub peer_id: PeerId,
    /// Known ways to reach the peer.
    pub endpoints: BTreeSet<Endpoint>,
    /// Tier of the most recent successful connection.
    pub last_successful_tier: Option<Tier>,
    /// Last refresh, unix seconds.
    pub last_seen_at: u64,
    /// Local trust posture.
    pub trust: TrustState,
}

impl PeerRecord {
    /// Fresh record with no endpoints.
    pub fn new(peer_id: PeerId, now: u64) -> Self {
        PeerRecord {
            peer_id,
            endpoints: BTreeSet::new(),
            last_successful_tier: None,
            last_seen_at: now,
            trust: TrustState::default(),
        }
    }

    /// Merges one endpoint. Idempotent: re-adding a known endpoint only
    /// refreshes `last_seen_at`. Returns whether the endpoint was new.
    /// Records at capacity keep their existing set.
    pub fn merge_endpoint(&mut self, endpoint: Endpoint, now: u64) -> bool {
        self.last_seen_at = now;
        if self.endpoints.contains(&endpoint) {
            return false;
        }
        if self.endpoints.len() >= MAX_ENDPOINTS_PER_RECORD {
            return false;
        }
        self.endpoints.insert(endpoint)
    }

    /// Merges every endpoint a fresh announcement expands to.
    pub fn merge_announcement(&mut self, announcement: &PeerAnnouncement, now: u64) {
        for endpoint in announcement.endpoints() {
            self.merge_endpoint(endpoint, now);
        }
    }

    /// Records a handshake-confirmed connection over `tier`.
    pub fn mark_connected(&mut self, tier: Tier, now: u64) {
        self.last_successful_tier = Some(tier);
        self.last_seen_at = now;
        if self.trust == TrustState::Unknown {
            self.trust = TrustState::Trusted;
        }
    }

    /// Flags the peer after a protocol violation.
    pub fn mark_flagged(&mut self) {
        self.trust = TrustState::Flagged;
    }

    /// TTL check against the directory lifetime.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.last_seen_at.saturating_add(DIRECTORY_RECORD_TTL_SECS)
    }

    /// Endpoints dialable by the given tier, in candidate order.
    pub fn endpoints_for_tier(&self, tier: Tier) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .filter(|e| e.tier() == tier)
            .copied()
            .collect()
    }

    /// Serializes for storage, enforcing the record cap.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_PEER_RECORD_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                max: MAX_PEER_RECORD_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Parses a stored record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_PEER_RECORD_SIZE {
            return Err(ProtoError::InputTooLarge {
                max: MAX_PEER_RECORD_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bincode::deserialize(bytes)?)
    }
}
