//! Routing table snapshot for warm restarts.
//!
//! The DHT persists its live contacts at shutdown and on a periodic tick;
//! on the next start the snapshot seeds the routing table before bootstrap
//! so the node rejoins without depending solely on the configured seeds.
//! The snapshot is advisory like everything else in this crate: contacts
//! that moved or died are shed by the first round of probes.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use passage_proto::PeerId;

use crate::db::StoreDb;
use crate::error::{Result, StoreError};

/// Tree name for the contact snapshot.
const CONTACTS_TREE: &str = "dht_contacts";

/// Key the snapshot blob is stored under.
const SNAPSHOT_KEY: &[u8] = b"snapshot_v1";

/// Contacts whose last exchange is older than this are not reloaded.
pub const DEFAULT_SNAPSHOT_MAX_AGE_SECS: u64 = 24 * 60 * 60;

/// One persisted routing table contact.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedContact {
    /// The peer's id.
    pub peer_id: PeerId,
    /// Address its RPC endpoint answered from.
    pub addr: SocketAddr,
    /// Last successful exchange, unix seconds.
    pub last_seen: u64,
}

#[derive(Serialize, Deserialize)]
struct ContactSnapshot {
    saved_at: u64,
    contacts: Vec<SavedContact>,
}

/// Persistent snapshot of the DHT routing table.
#[derive(Debug, Clone)]
pub struct ContactStore {
    tree: sled::Tree,
}

impl ContactStore {
    /// Open the contact store within the given database.
    pub fn open(db: &StoreDb) -> Result<Self> {
        Ok(Self {
            tree: db.tree(CONTACTS_TREE)?,
        })
    }

    /// Replace the snapshot with the given contacts.
    pub fn save(&self, contacts: &[SavedContact], now: u64) -> Result<()> {
        let snapshot = ContactSnapshot {
            saved_at: now,
            contacts: contacts.to_vec(),
        };
        let bytes = bincode::serialize(&snapshot).map_err(|e| {
            StoreError::Serialization(format!("Failed to serialize snapshot: {}", e))
        })?;
        self.tree
            .insert(SNAPSHOT_KEY, bytes)
            .map_err(|e| StoreError::Database(format!("Failed to store snapshot: {}", e)))?;
        Ok(())
    }

    /// Load contacts whose last exchange is at most `max_age_secs` old.
    ///
    /// A missing snapshot reads as empty. An undecodable snapshot is
    /// discarded and reads as empty.
    pub fn load(&self, now: u64, max_age_secs: u64) -> Result<Vec<SavedContact>> {
        let Some(bytes) = self
            .tree
            .get(SNAPSHOT_KEY)
            .map_err(|e| StoreError::Database(format!("Failed to read snapshot: {}", e)))?
        else {
            return Ok(Vec::new());
        };

        let snapshot: ContactSnapshot = match bincode::deserialize(&bytes) {
            Ok(snapshot) => snapshot,
            Err(_) => {
                self.clear()?;
                return Ok(Vec::new());
            }
        };

        Ok(snapshot
            .contacts
            .into_iter()
            .filter(|c| now.saturating_sub(c.last_seen) <= max_age_secs)
            .collect())
    }

    /// When the current snapshot was taken, if one exists.
    pub fn saved_at(&self) -> Result<Option<u64>> {
        let Some(bytes) = self
            .tree
            .get(SNAPSHOT_KEY)
            .map_err(|e| StoreError::Database(format!("Failed to read snapshot: {}", e)))?
        else {
            return Ok(None);
        };
        let snapshot: ContactSnapshot = bincode::deserialize(&bytes).map_err(|e| {
            StoreError::Serialization(format!("Failed to deserialize snapshot: {}", e))
        })?;
        Ok(Some(snapshot.saved_at))
    }

    /// Drop the snapshot entirely.
    pub fn clear(&self) -> Result<()> {
        self.tree
            .remove(SNAPSHOT_KEY)
            .map_err(|e| StoreError::Database(format!("Failed to remove snapshot: {}", e)))?;
        Ok(())
    }
}
