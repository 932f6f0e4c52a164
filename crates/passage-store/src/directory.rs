//! Peer directory: durable cache of per-peer reachability records.
//!
//! The directory is advisory. A lost or stale record costs one DHT lookup
//! and nothing else, so reads are served from an in-memory map and every
//! mutation is written through to sled before the map is updated. Records
//! expire after the directory TTL and are dropped on load and by `sweep`.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use passage_proto::{Endpoint, PeerAnnouncement, PeerId, PeerRecord, Tier, TrustState};

use crate::db::StoreDb;
use crate::error::{Result, StoreError};

/// Tree name for peer records.
const DIRECTORY_TREE: &str = "peer_directory";

/// Aggregate counters over the directory contents.
#[derive(Debug, Clone, Default)]
pub struct DirectoryStats {
    /// Total records held.
    pub records: usize,
    /// Records for peers with at least one confirmed handshake.
    pub trusted: usize,
    /// Records flagged after a protocol violation.
    pub flagged: usize,
    /// Records carrying a last-successful-tier dialing hint.
    pub with_tier_hint: usize,
}

/// Durable, advisory cache of [`PeerRecord`]s keyed by peer id.
pub struct PeerDirectory {
    tree: sled::Tree,
    map: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl PeerDirectory {
    /// Open the directory, loading all records that have not expired.
    ///
    /// Rows that fail to decode or are already past their TTL are removed
    /// from the tree during the load.
    pub fn open(db: &StoreDb, now: u64) -> Result<Self> {
        let tree = db.tree(DIRECTORY_TREE)?;
        let mut map = HashMap::new();
        let mut dead_keys = Vec::new();

        for entry in tree.iter() {
            let (key, value) =
                entry.map_err(|e| StoreError::Database(format!("Failed to read record: {}", e)))?;
            match PeerRecord::from_bytes(&value) {
                Ok(record) if record.is_expired(now) => dead_keys.push(key),
                Ok(record) => {
                    map.insert(record.peer_id, record);
                }
                Err(_) => dead_keys.push(key),
            }
        }

        for key in dead_keys {
            tree.remove(key)
                .map_err(|e| StoreError::Database(format!("Failed to remove record: {}", e)))?;
        }

        Ok(Self {
            tree,
            map: RwLock::new(map),
        })
    }

    /// Look up the record for a peer.
    ///
    /// Expired records read as absent; physical removal is left to `sweep`.
    pub fn get(&self, peer_id: &PeerId, now: u64) -> Option<PeerRecord> {
        let map = self.read_map();
        map.get(peer_id).filter(|r| !r.is_expired(now)).cloned()
    }

    /// Merge one endpoint into a peer's record, creating the record if the
    /// peer is unknown. Idempotent: re-adding a known endpoint refreshes the
    /// record's freshness and returns `false`.
    pub fn put_endpoint(&self, peer_id: PeerId, endpoint: Endpoint, now: u64) -> Result<bool> {
        let mut map = self.write_map();
        let mut record = map
            .get(&peer_id)
            .cloned()
            .unwrap_or_else(|| PeerRecord::new(peer_id, now));
        let added = record.merge_endpoint(endpoint, now);
        self.persist(&record)?;
        map.insert(peer_id, record);
        Ok(added)
    }

    /// Merge every endpoint a peer's announcement expands to, creating the
    /// record if the peer is unknown. Returns the updated record.
    pub fn merge_announcement(
        &self,
        announcement: &PeerAnnouncement,
        now: u64,
    ) -> Result<PeerRecord> {
        let peer_id = announcement.peer_id;
        let mut map = self.write_map();
        let mut record = map
            .get(&peer_id)
            .cloned()
            .unwrap_or_else(|| PeerRecord::new(peer_id, now));
        record.merge_announcement(announcement, now);
        self.persist(&record)?;
        map.insert(peer_id, record.clone());
        Ok(record)
    }

    /// Record a handshake-confirmed connection over `tier`.
    ///
    /// This is the only path that writes the tier hint. The record is
    /// created if absent: a completed handshake is proof enough that the
    /// peer exists.
    pub fn mark_connected(&self, peer_id: PeerId, tier: Tier, now: u64) -> Result<()> {
        let mut map = self.write_map();
        let mut record = map
            .get(&peer_id)
            .cloned()
            .unwrap_or_else(|| PeerRecord::new(peer_id, now));
        record.mark_connected(tier, now);
        self.persist(&record)?;
        map.insert(peer_id, record);
        Ok(())
    }

    /// Flag a peer after a protocol violation. Returns `false` if the peer
    /// has no record to flag.
    pub fn mark_flagged(&self, peer_id: &PeerId) -> Result<bool> {
        let mut map = self.write_map();
        let Some(mut record) = map.get(peer_id).cloned() else {
            return Ok(false);
        };
        record.mark_flagged();
        self.persist(&record)?;
        map.insert(*peer_id, record);
        Ok(true)
    }

    /// Remove a peer's record entirely. Returns whether a record existed.
    pub fn evict(&self, peer_id: &PeerId) -> Result<bool> {
        let mut map = self.write_map();
        let existed = map.remove(peer_id).is_some();
        self.tree
            .remove(peer_id.as_bytes())
            .map_err(|e| StoreError::Database(format!("Failed to remove record: {}", e)))?;
        Ok(existed)
    }

    /// Remove all records past their TTL. Returns the number removed.
    pub fn sweep(&self, now: u64) -> Result<usize> {
        let expired: Vec<PeerId> = {
            let map = self.read_map();
            map.values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.peer_id)
                .collect()
        };

        for peer_id in &expired {
            self.evict(peer_id)?;
        }
        Ok(expired.len())
    }

    /// Number of records held, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    /// Whether the directory holds no records.
    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    /// Aggregate counters over the current contents.
    pub fn stats(&self) -> DirectoryStats {
        let map = self.read_map();
        let mut stats = DirectoryStats {
            records: map.len(),
            ..DirectoryStats::default()
        };
        for record in map.values() {
            match record.trust {
                TrustState::Trusted => stats.trusted += 1,
                TrustState::Flagged => stats.flagged += 1,
                TrustState::Unknown => {}
            }
            if record.last_successful_tier.is_some() {
                stats.with_tier_hint += 1;
            }
        }
        stats
    }

    fn persist(&self, record: &PeerRecord) -> Result<()> {
        let bytes = record.to_bytes()?;
        self.tree
            .insert(record.peer_id.as_bytes(), bytes)
            .map_err(|e| StoreError::Database(format!("Failed to store record: {}", e)))?;
        Ok(())
    }

    // Map writes are single inserts or removes, so a poisoned lock cannot
    // hold partial state.
    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<PeerId, PeerRecord>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<PeerId, PeerRecord>> {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PeerDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDirectory")
            .field("records", &self.len())
            .finish()
    }
}
