//! Durable spool of gossip envelopes awaiting delivery.
//!
//! Envelopes destined for offline peers rest here until a forwarding
//! opportunity appears, an ack arrives, or the wall-clock TTL runs out.
//! Acked ids are remembered past deletion so a copy arriving later from a
//! slower path is dropped instead of resurrected.

use serde::{Deserialize, Serialize};

use passage_proto::limits::{GOSSIP_TTL_SECS, MAX_SEEN_BY};
use passage_proto::{GossipEnvelope, MessageId, PeerId};

use crate::db::StoreDb;
use crate::error::{Result, StoreError};

/// Tree name for spooled envelopes.
const SPOOL_TREE: &str = "gossip_spool";

/// Tree name for remembered acks.
const ACKED_TREE: &str = "gossip_acked";

/// Default cap on spooled envelopes.
pub const DEFAULT_SPOOL_CAPACITY: usize = 4096;

/// A spooled envelope with its forwarding bookkeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpooledEnvelope {
    /// The envelope itself.
    pub envelope: GossipEnvelope,
    /// When it entered the spool, unix seconds.
    pub spooled_at: u64,
    /// How many times it has been pushed onward.
    pub forward_count: u32,
    /// Most recent forward, unix seconds.
    pub last_forward_at: Option<u64>,
}

/// Aggregate counters over the spool contents.
#[derive(Debug, Clone, Default)]
pub struct SpoolStats {
    /// Envelopes currently spooled.
    pub spooled: usize,
    /// Ack ids remembered.
    pub acked_remembered: usize,
    /// Oldest spooled-at timestamp, if any envelope is held.
    pub oldest_spooled_at: Option<u64>,
}

/// Persistent store-and-forward spool keyed by message id.
#[derive(Debug, Clone)]
pub struct GossipSpool {
    spool: sled::Tree,
    acked: sled::Tree,
    capacity: usize,
}

impl GossipSpool {
    /// Open the spool with the default capacity.
    pub fn open(db: &StoreDb) -> Result<Self> {
        Self::with_capacity(db, DEFAULT_SPOOL_CAPACITY)
    }

    /// Open the spool with an explicit envelope cap.
    pub fn with_capacity(db: &StoreDb, capacity: usize) -> Result<Self> {
        Ok(Self {
            spool: db.tree(SPOOL_TREE)?,
            acked: db.tree(ACKED_TREE)?,
            capacity,
        })
    }

    /// Spool an envelope for later delivery.
    ///
    /// Returns `false` without writing when the id is already spooled or
    /// already acked. Fails with [`StoreError::StoreFull`] when the spool
    /// is at capacity.
    pub fn insert(&self, envelope: &GossipEnvelope, now: u64) -> Result<bool> {
        envelope.validate()?;
        let key = envelope.message_id.as_bytes();

        if self.contains(&envelope.message_id)? || self.was_acked(&envelope.message_id)? {
            return Ok(false);
        }
        if self.spool.len() >= self.capacity {
            return Err(StoreError::StoreFull(format!(
                "gossip spool at capacity ({} envelopes)",
                self.capacity
            )));
        }

        let spooled = SpooledEnvelope {
            envelope: envelope.clone(),
            spooled_at: now,
            forward_count: 0,
            last_forward_at: None,
        };
        let serialized = bincode::serialize(&spooled).map_err(|e| {
            StoreError::Serialization(format!("Failed to serialize envelope: {}", e))
        })?;
        self.spool
            .insert(key, serialized)
            .map_err(|e| StoreError::Database(format!("Failed to insert envelope: {}", e)))?;
        Ok(true)
    }

    /// Look up a spooled envelope by id.
    pub fn get(&self, id: &MessageId) -> Result<Option<SpooledEnvelope>> {
        let Some(value) = self
            .spool
            .get(id.as_bytes())
            .map_err(|e| StoreError::Database(format!("Failed to get envelope: {}", e)))?
        else {
            return Ok(None);
        };
        let spooled: SpooledEnvelope = bincode::deserialize(&value)
            .map_err(|e| StoreError::Serialization(format!("Failed to deserialize: {}", e)))?;
        Ok(Some(spooled))
    }

    /// Whether an envelope with this id is currently spooled.
    pub fn contains(&self, id: &MessageId) -> Result<bool> {
        self.spool
            .contains_key(id.as_bytes())
            .map_err(|e| StoreError::Database(format!("Failed to check envelope: {}", e)))
    }

    /// Process an ack: drop the local copy and remember the id.
    ///
    /// The id is remembered even when no copy is held, since an ack can
    /// outrun the envelope it acknowledges. Returns whether a copy was
    /// deleted.
    pub fn ack(&self, id: &MessageId, now: u64) -> Result<bool> {
        let key = id.as_bytes();
        let existed = self
            .spool
            .remove(key)
            .map_err(|e| StoreError::Database(format!("Failed to remove envelope: {}", e)))?
            .is_some();

        let acked_at = bincode::serialize(&now)
            .map_err(|e| StoreError::Serialization(format!("Failed to serialize ack: {}", e)))?;
        self.acked
            .insert(key, acked_at)
            .map_err(|e| StoreError::Database(format!("Failed to record ack: {}", e)))?;
        Ok(existed)
    }

    /// Whether an ack for this id has been seen.
    pub fn was_acked(&self, id: &MessageId) -> Result<bool> {
        self.acked
            .contains_key(id.as_bytes())
            .map_err(|e| StoreError::Database(format!("Failed to check ack: {}", e)))
    }

    /// Record that the envelope was pushed to `peer`.
    ///
    /// The peer lands in the stored copy's `seen_by`, so later calls to
    /// [`offers_for`](Self::offers_for) never offer the same envelope to
    /// the same peer twice, across restarts included.
    pub fn mark_pushed(&self, id: &MessageId, peer: PeerId, now: u64) -> Result<()> {
        let key = id.as_bytes();
        let value = self
            .spool
            .get(key)
            .map_err(|e| StoreError::Database(format!("Failed to get envelope: {}", e)))?
            .ok_or_else(|| StoreError::KeyNotFound(format!("Envelope not found: {}", id)))?;

        let mut spooled: SpooledEnvelope = bincode::deserialize(&value)
            .map_err(|e| StoreError::Serialization(format!("Failed to deserialize: {}", e)))?;
        if spooled.envelope.seen_by.len() < MAX_SEEN_BY {
            spooled.envelope.seen_by.insert(peer);
        }
        spooled.forward_count += 1;
        spooled.last_forward_at = Some(now);

        let serialized = bincode::serialize(&spooled)
            .map_err(|e| StoreError::Serialization(format!("Failed to serialize: {}", e)))?;
        self.spool
            .insert(key, serialized)
            .map_err(|e| StoreError::Database(format!("Failed to update envelope: {}", e)))?;
        Ok(())
    }

    /// All spooled envelopes, oldest first.
    pub fn pending(&self) -> Result<Vec<SpooledEnvelope>> {
        let mut envelopes = Vec::new();
        for result in self.spool.iter() {
            let (_, value) = result
                .map_err(|e| StoreError::Database(format!("Failed to iterate spool: {}", e)))?;
            let spooled: SpooledEnvelope = bincode::deserialize(&value)
                .map_err(|e| StoreError::Serialization(format!("Failed to deserialize: {}", e)))?;
            envelopes.push(spooled);
        }
        envelopes.sort_by_key(|s| s.spooled_at);
        Ok(envelopes)
    }

    /// Envelopes worth offering to a freshly connected peer, oldest first.
    ///
    /// An envelope qualifies when the peer is its destination, or when it
    /// still has hop budget and the peer has not already held it.
    pub fn offers_for(&self, peer: &PeerId, now: u64) -> Result<Vec<GossipEnvelope>> {
        let mut offers: Vec<SpooledEnvelope> = Vec::new();
        for spooled in self.pending()? {
            let envelope = &spooled.envelope;
            if envelope.is_expired(now) {
                continue;
            }
            if envelope.destination == *peer
                || (envelope.can_forward(now) && !envelope.has_seen(peer))
            {
                offers.push(spooled);
            }
        }
        Ok(offers.into_iter().map(|s| s.envelope).collect())
    }

    /// Drop envelopes past the gossip TTL and forget acks old enough that
    /// every copy in the network has expired too. Returns the number of
    /// envelopes removed.
    pub fn sweep_expired(&self, now: u64) -> Result<usize> {
        let mut dead_keys = Vec::new();
        for result in self.spool.iter() {
            let (key, value) = result
                .map_err(|e| StoreError::Database(format!("Failed to iterate spool: {}", e)))?;
            let spooled: SpooledEnvelope = match bincode::deserialize(&value) {
                Ok(spooled) => spooled,
                Err(_) => {
                    dead_keys.push(key);
                    continue;
                }
            };
            if spooled.envelope.is_expired(now) {
                dead_keys.push(key);
            }
        }
        let removed = dead_keys.len();
        for key in dead_keys {
            self.spool
                .remove(key)
                .map_err(|e| StoreError::Database(format!("Failed to remove envelope: {}", e)))?;
        }

        let mut stale_acks = Vec::new();
        for result in self.acked.iter() {
            let (key, value) = result
                .map_err(|e| StoreError::Database(format!("Failed to iterate acks: {}", e)))?;
            let acked_at: u64 = bincode::deserialize(&value).unwrap_or(0);
            if now.saturating_sub(acked_at) > GOSSIP_TTL_SECS {
                stale_acks.push(key);
            }
        }
        for key in stale_acks {
            self.acked
                .remove(key)
                .map_err(|e| StoreError::Database(format!("Failed to remove ack: {}", e)))?;
        }

        Ok(removed)
    }

    /// Number of spooled envelopes.
    pub fn len(&self) -> usize {
        self.spool.len()
    }

    /// Whether the spool holds no envelopes.
    pub fn is_empty(&self) -> bool {
        self.spool.is_empty()
    }

    /// Aggregate counters over the current contents.
    pub fn stats(&self) -> Result<SpoolStats> {
        let pending = self.pending()?;
        Ok(SpoolStats {
            spooled: pending.len(),
            acked_remembered: self.acked.len(),
            oldest_spooled_at: pending.first().map(|s| s.spooled_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_proto::NodeKeypair;
    use tempfile::TempDir;

    fn create_test_db() -> (TempDir, StoreDb) {
        let dir = TempDir::new().unwrap();
        let db = StoreDb::open(dir.path().join("store")).unwrap();
        (dir, db)
    }

    fn envelope(destination: PeerId, now: u64) -> GossipEnvelope {
        let origin = NodeKeypair::generate().peer_id();
        GossipEnvelope::new(origin, destination, b"payload".to_vec(), now).unwrap()
    }

    #[test]
    fn test_insert_and_get_roundtrip() {
        let (_dir, db) = create_test_db();
        let spool = GossipSpool::open(&db).unwrap();
        let env = envelope(NodeKeypair::generate().peer_id(), 100);

        assert!(spool.insert(&env, 100).unwrap());
        let spooled = spool.get(&env.message_id).unwrap().unwrap();
        assert_eq!(spooled.envelope, env);
        assert_eq!(spooled.spooled_at, 100);
        assert_eq!(spooled.forward_count, 0);
    }

    #[test]
    fn test_insert_duplicate_is_noop() {
        let (_dir, db) = create_test_db();
        let spool = GossipSpool::open(&db).unwrap();
        let env = envelope(NodeKeypair::generate().peer_id(), 0);

        assert!(spool.insert(&env, 0).unwrap());
        assert!(!spool.insert(&env, 1).unwrap());
        assert_eq!(spool.len(), 1);
    }

    #[test]
    fn test_insert_at_capacity_fails() {
        let (_dir, db) = create_test_db();
        let spool = GossipSpool::with_capacity(&db, 2).unwrap();
        let dest = NodeKeypair::generate().peer_id();

        spool.insert(&envelope(dest, 0), 0).unwrap();
        spool.insert(&envelope(dest, 0), 0).unwrap();
        let result = spool.insert(&envelope(dest, 0), 0);
        assert!(matches!(result, Err(StoreError::StoreFull(_))));
    }

    #[test]
    fn test_ack_removes_and_remembers() {
        let (_dir, db) = create_test_db();
        let spool = GossipSpool::open(&db).unwrap();
        let env = envelope(NodeKeypair::generate().peer_id(), 0);

        spool.insert(&env, 0).unwrap();
        assert!(spool.ack(&env.message_id, 10).unwrap());
        assert!(!spool.contains(&env.message_id).unwrap());
        assert!(spool.was_acked(&env.message_id).unwrap());

        // An acked envelope cannot be resurrected by a late copy.
        assert!(!spool.insert(&env, 20).unwrap());
        assert!(spool.is_empty());
    }

    #[test]
    fn test_ack_before_envelope_arrives() {
        let (_dir, db) = create_test_db();
        let spool = GossipSpool::open(&db).unwrap();
        let env = envelope(NodeKeypair::generate().peer_id(), 0);

        assert!(!spool.ack(&env.message_id, 0).unwrap());
        assert!(spool.was_acked(&env.message_id).unwrap());
        assert!(!spool.insert(&env, 5).unwrap());
    }

    #[test]
    fn test_mark_pushed_updates_bookkeeping() {
        let (_dir, db) = create_test_db();
        let spool = GossipSpool::open(&db).unwrap();
        let env = envelope(NodeKeypair::generate().peer_id(), 0);
        let first = NodeKeypair::generate().peer_id();
        let second = NodeKeypair::generate().peer_id();

        spool.insert(&env, 0).unwrap();
        spool.mark_pushed(&env.message_id, first, 30).unwrap();
        spool.mark_pushed(&env.message_id, second, 40).unwrap();

        let spooled = spool.get(&env.message_id).unwrap().unwrap();
        assert_eq!(spooled.forward_count, 2);
        assert_eq!(spooled.last_forward_at, Some(40));
        assert!(spooled.envelope.has_seen(&first));
        assert!(spooled.envelope.has_seen(&second));
    }

    #[test]
    fn test_mark_pushed_excludes_peer_from_offers() {
        let (_dir, db) = create_test_db();
        let spool = GossipSpool::open(&db).unwrap();
        let peer = NodeKeypair::generate().peer_id();
        let env = envelope(NodeKeypair::generate().peer_id(), 0);

        spool.insert(&env, 0).unwrap();
        assert_eq!(spool.offers_for(&peer, 1).unwrap().len(), 1);

        spool.mark_pushed(&env.message_id, peer, 2).unwrap();
        assert!(spool.offers_for(&peer, 3).unwrap().is_empty());
    }

    #[test]
    fn test_mark_pushed_unknown_id_fails() {
        let (_dir, db) = create_test_db();
        let spool = GossipSpool::open(&db).unwrap();
        let id = MessageId::generate();
        let peer = NodeKeypair::generate().peer_id();
        assert!(matches!(
            spool.mark_pushed(&id, peer, 0),
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_offers_for_destination_and_forwarding() {
        let (_dir, db) = create_test_db();
        let spool = GossipSpool::open(&db).unwrap();
        let peer = NodeKeypair::generate().peer_id();
        let other = NodeKeypair::generate().peer_id();

        let direct = envelope(peer, 0);
        let forwardable = envelope(other, 0);
        let mut already_seen = envelope(other, 0);
        already_seen.seen_by.insert(peer);

        spool.insert(&direct, 0).unwrap();
        spool.insert(&forwardable, 1).unwrap();
        spool.insert(&already_seen, 2).unwrap();

        let offers = spool.offers_for(&peer, 5).unwrap();
        assert_eq!(offers.len(), 2);
        assert!(offers.iter().any(|e| e.message_id == direct.message_id));
        assert!(offers.iter().any(|e| e.message_id == forwardable.message_id));
    }

    #[test]
    fn test_sweep_drops_expired_envelopes_and_old_acks() {
        let (_dir, db) = create_test_db();
        let spool = GossipSpool::open(&db).unwrap();
        let dest = NodeKeypair::generate().peer_id();

        let old = envelope(dest, 0);
        let fresh = envelope(dest, GOSSIP_TTL_SECS);
        spool.insert(&old, 0).unwrap();
        spool.insert(&fresh, GOSSIP_TTL_SECS).unwrap();

        let acked = envelope(dest, 0);
        spool.ack(&acked.message_id, GOSSIP_TTL_SECS).unwrap();

        let removed = spool.sweep_expired(GOSSIP_TTL_SECS + 1).unwrap();
        assert_eq!(removed, 1);
        assert!(spool.contains(&fresh.message_id).unwrap());
        assert!(spool.was_acked(&acked.message_id).unwrap());

        spool.sweep_expired(2 * GOSSIP_TTL_SECS + 2).unwrap();
        assert!(!spool.was_acked(&acked.message_id).unwrap());
    }

    #[test]
    fn test_pending_sorted_oldest_first() {
        let (_dir, db) = create_test_db();
        let spool = GossipSpool::open(&db).unwrap();
        let dest = NodeKeypair::generate().peer_id();

        spool.insert(&envelope(dest, 0), 30).unwrap();
        spool.insert(&envelope(dest, 0), 10).unwrap();
        spool.insert(&envelope(dest, 0), 20).unwrap();

        let pending = spool.pending().unwrap();
        let order: Vec<u64> = pending.iter().map(|s| s.spooled_at).collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn test_spool_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");
        let env = envelope(NodeKeypair::generate().peer_id(), 0);

        {
            let db = StoreDb::open(&path).unwrap();
            let spool = GossipSpool::open(&db).unwrap();
            spool.insert(&env, 0).unwrap();
            db.flush().unwrap();
        }

        let db = StoreDb::open(&path).unwrap();
        let spool = GossipSpool::open(&db).unwrap();
        assert!(spool.contains(&env.message_id).unwrap());
    }

    #[test]
    fn test_stats_reflect_contents() {
        let (_dir, db) = create_test_db();
        let spool = GossipSpool::open(&db).unwrap();
        let dest = NodeKeypair::generate().peer_id();

        spool.insert(&envelope(dest, 0), 15).unwrap();
        spool.insert(&envelope(dest, 0), 5).unwrap();
        spool.ack(&MessageId::generate(), 0).unwrap();

        let stats = spool.stats().unwrap();
        assert_eq!(stats.spooled, 2);
        assert_eq!(stats.acked_remembered, 1);
        assert_eq!(stats.oldest_spooled_at, Some(5));
    }
}
