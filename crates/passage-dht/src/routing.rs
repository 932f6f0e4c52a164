//! Kademlia routing table: 256 k-buckets over XOR distance.
//!
//! Insert policy per bucket, in order:
//! 1. A known contact is refreshed and moved to the most-recent end.
//! 2. A bucket with room accepts the newcomer unless its subnet already
//!    occupies [`SUBNET_DIVERSITY_LIMIT`] slots.
//! 3. A full bucket evicts its least-recently-seen head only if that
//!    head is stale; otherwise the newcomer goes to a bounded
//!    replacement cache and is promoted when a slot opens.
//!
//! A contact lives in exactly one bucket and no bucket ever exceeds `k`.

use std::collections::VecDeque;

use passage_proto::PeerId;

use crate::contact::Contact;
use crate::distance::Distance;
use crate::error::{DhtError, Result};

/// Contacts from one subnet allowed per bucket.
pub const SUBNET_DIVERSITY_LIMIT: usize = 2;

/// Replacement cache capacity per bucket.
const MAX_REPLACEMENTS: usize = 8;

/// Number of buckets: one per possible distance bit.
const BUCKET_COUNT: usize = 256;

/// Outcome of a routing table insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Contact was already present; refreshed and moved to the tail.
    Refreshed,
    /// Contact added to a bucket with room.
    Added,
    /// A stale head was evicted to make room.
    Replaced,
    /// Bucket full and healthy; contact parked in the replacement cache.
    Deferred,
    /// Rejected: subnet already at its per-bucket limit.
    RejectedSubnet,
}

/// One k-bucket: live entries ordered least-recently-seen first, plus a
/// replacement cache.
#[derive(Debug, Default)]
struct KBucket {
    entries: VecDeque<Contact>,
    replacements: VecDeque<Contact>,
    last_refreshed: u64,
}

impl KBucket {
    fn position(&self, peer_id: &PeerId) -> Option<usize> {
        self.entries.iter().position(|c| c.peer_id == *peer_id)
    }

    fn subnet_count(&self, contact: &Contact) -> usize {
        let key = contact.subnet_key();
        self.entries
            .iter()
            .filter(|c| c.subnet_key() == key)
            .count()
    }

    fn insert(&mut self, mut contact: Contact, k: usize, now: u64) -> InsertOutcome {
        if let Some(pos) = self.position(&contact.peer_id) {
            let mut existing = self.entries.remove(pos).unwrap_or(contact);
            existing.touch(now);
            existing.addr = contact.addr;
            self.entries.push_back(existing);
            return InsertOutcome::Refreshed;
        }

        if self.entries.len() < k {
            if self.subnet_count(&contact) >= SUBNET_DIVERSITY_LIMIT {
                return InsertOutcome::RejectedSubnet;
            }
            contact.touch(now);
            self.entries.push_back(contact);
            return InsertOutcome::Added;
        }

        let head_is_stale = self
            .entries
            .front()
            .map(|head| head.is_stale(now))
            .unwrap_or(false);
        if head_is_stale {
            self.entries.pop_front();
            contact.touch(now);
            self.entries.push_back(contact);
            return InsertOutcome::Replaced;
        }

        self.park_replacement(contact);
        InsertOutcome::Deferred
    }

    fn park_replacement(&mut self, contact: Contact) {
        self.replacements.retain(|c| c.peer_id != contact.peer_id);
        if self.replacements.len() >= MAX_REPLACEMENTS {
            self.replacements.pop_front();
        }
        self.replacements.push_back(contact);
    }

    /// Removes a contact and promotes the freshest replacement.
    fn remove(&mut self, peer_id: &PeerId) -> Option<Contact> {
        let pos = self.position(peer_id)?;
        let removed = self.entries.remove(pos);
        if let Some(promoted) = self.replacements.pop_back() {
            self.entries.push_back(promoted);
        }
        removed
    }

    fn mark_failed(&mut self, peer_id: &PeerId, now: u64) {
        let Some(pos) = self.position(peer_id) else {
            return;
        };
        let stale = match self.entries.get_mut(pos) {
            Some(entry) => {
                entry.record_failure();
                entry.is_stale(now)
            }
            None => false,
        };
        if stale {
            self.remove(peer_id);
        }
    }
}

/// Snapshot of table occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoutingTableStats {
    /// Live contacts across all buckets.
    pub contacts: usize,
    /// Buckets holding at least one contact.
    pub occupied_buckets: usize,
    /// Contacts parked in replacement caches.
    pub replacements: usize,
}

/// The full routing table for one local id.
pub struct RoutingTable {
    local_id: PeerId,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Empty table for `local_id` with bucket capacity `k`.
    pub fn new(local_id: PeerId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, KBucket::default);
        RoutingTable {
            local_id,
            k,
            buckets,
        }
    }

    /// The id this table is centered on.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    fn bucket_for(&self, peer_id: &PeerId) -> Option<usize> {
        Distance::between(&self.local_id, peer_id).bucket_index()
    }

    /// Inserts or refreshes a contact. Inserting the local id is an
    /// error; everything else reports the bucket's decision.
    pub fn insert(&mut self, contact: Contact, now: u64) -> Result<InsertOutcome> {
        let index = self
            .bucket_for(&contact.peer_id)
            .ok_or(DhtError::SelfContact)?;
        Ok(self.buckets[index].insert(contact, self.k, now))
    }

    /// Removes a contact, promoting a replacement if one is parked.
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<Contact> {
        let index = self.bucket_for(peer_id)?;
        self.buckets[index].remove(peer_id)
    }

    /// Records an unanswered probe; stale contacts are dropped and a
    /// replacement promoted.
    pub fn mark_failed(&mut self, peer_id: &PeerId, now: u64) {
        if let Some(index) = self.bucket_for(peer_id) {
            self.buckets[index].mark_failed(peer_id, now);
        }
    }

    /// Whether the table knows this peer.
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.bucket_for(peer_id)
            .map(|i| self.buckets[i].position(peer_id).is_some())
            .unwrap_or(false)
    }

    /// Looks up a live contact.
    pub fn get(&self, peer_id: &PeerId) -> Option<Contact> {
        let index = self.bucket_for(peer_id)?;
        let pos = self.buckets[index].position(peer_id)?;
        self.buckets[index].entries.get(pos).copied()
    }

    /// The `count` contacts closest to `target`, nearest first. Equal
    /// distances (impossible for distinct ids) aside, ties in usefulness
    /// favor the most recently seen contact.
    pub fn closest(&self, target: &PeerId, count: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().copied())
            .collect();
        all.sort_by(|a, b| {
            Distance::between(&a.peer_id, target)
                .cmp(&Distance::between(&b.peer_id, target))
                .then(b.last_seen.cmp(&a.last_seen))
        });
        all.truncate(count);
        all
    }

    /// Total live contacts.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    /// Whether the table holds no contacts at all.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> RoutingTableStats {
        RoutingTableStats {
            contacts: self.len(),
            occupied_buckets: self.buckets.iter().filter(|b| !b.entries.is_empty()).count(),
            replacements: self.buckets.iter().map(|b| b.replacements.len()).sum(),
        }
    }

    /// Every live contact, for snapshots.
    pub fn all_contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().copied())
            .collect()
    }

    /// Indices of occupied buckets that have not been refreshed within
    /// `interval_secs`.
    pub fn buckets_needing_refresh(&self, now: u64, interval_secs: u64) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.entries.is_empty() && now >= b.last_refreshed.saturating_add(interval_secs)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Records a completed refresh for a bucket.
    pub fn mark_refreshed(&mut self, index: usize, now: u64) {
        if let Some(bucket) = self.buckets.get_mut(index) {
            bucket.last_refreshed = now;
        }
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("local_id", &self.local_id)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{CONTACT_STALE_SECS, MAX_FAILED_PROBES};
    use passage_proto::{NodeKeypair, PeerId};
    use std::net::SocketAddr;

    const K: usize = 4;

    fn id() -> PeerId {
        NodeKeypair::generate().peer_id()
    }

    fn contact_at(ip: [u8; 4], now: u64) -> Contact {
        Contact::new(id(), SocketAddr::from((ip, 4000)), now)
    }

    /// Contact that lands in the same bucket as `reference` relative to
    /// `local`, found by rejection sampling.
    fn contact_in_bucket(local: &PeerId, bucket: usize, ip: [u8; 4], now: u64) -> Contact {
        loop {
            let candidate = id();
            if Distance::between(local, &candidate).bucket_index() == Some(bucket) {
                return Contact::new(candidate, SocketAddr::from((ip, 4000)), now);
            }
        }
    }

    /// Most random ids land in high buckets; 255 has probability 1/2.
    const HIGH_BUCKET: usize = 255;

    #[test]
    fn inserting_local_id_is_an_error() {
        let local = id();
        let mut table = RoutingTable::new(local, K);
        let this = Contact::new(local, SocketAddr::from(([127, 0, 0, 1], 1)), 0);
        assert!(matches!(table.insert(this, 0), Err(DhtError::SelfContact)));
    }

    #[test]
    fn insert_and_lookup() {
        let mut table = RoutingTable::new(id(), K);
        let c = contact_at([192, 0, 2, 1], 10);
        assert_eq!(table.insert(c, 10).unwrap(), InsertOutcome::Added);
        assert!(table.contains(&c.peer_id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reinsert_refreshes_and_moves_to_tail() {
        let local = id();
        let mut table = RoutingTable::new(local, K);
        let a = contact_in_bucket(&local, HIGH_BUCKET, [192, 0, 2, 1], 10);
        let b = contact_in_bucket(&local, HIGH_BUCKET, [198, 51, 100, 1], 11);
        table.insert(a, 10).unwrap();
        table.insert(b, 11).unwrap();

        assert_eq!(table.insert(a, 50).unwrap(), InsertOutcome::Refreshed);
        let got = table.get(&a.peer_id).unwrap();
        assert_eq!(got.last_seen, 50);
    }

    #[test]
    fn bucket_capacity_is_never_exceeded() {
        let local = id();
        let mut table = RoutingTable::new(local, K);
        // Distinct /24 subnets so diversity never interferes.
        for i in 0..K + 3 {
            let c = contact_in_bucket(&local, HIGH_BUCKET, [10, i as u8, 0, 1], 100);
            table.insert(c, 100).unwrap();
        }
        assert!(table.len() <= K);
        assert_eq!(table.stats().replacements, 3);
    }

    #[test]
    fn full_bucket_with_fresh_head_defers() {
        let local = id();
        let mut table = RoutingTable::new(local, K);
        for i in 0..K {
            let c = contact_in_bucket(&local, HIGH_BUCKET, [10, i as u8, 0, 1], 100);
            table.insert(c, 100).unwrap();
        }
        let newcomer = contact_in_bucket(&local, HIGH_BUCKET, [10, 99, 0, 1], 101);
        assert_eq!(table.insert(newcomer, 101).unwrap(), InsertOutcome::Deferred);
        assert!(!table.contains(&newcomer.peer_id));
    }

    #[test]
    fn stale_head_is_evicted_for_newcomer() {
        let local = id();
        let mut table = RoutingTable::new(local, K);
        let mut first = None;
        for i in 0..K {
            let c = contact_in_bucket(&local, HIGH_BUCKET, [10, i as u8, 0, 1], 100);
            table.insert(c, 100).unwrap();
            first.get_or_insert(c.peer_id);
        }
        let head = first.unwrap();

        let later = 100 + CONTACT_STALE_SECS;
        let newcomer = contact_in_bucket(&local, HIGH_BUCKET, [10, 99, 0, 1], later);
        assert_eq!(table.insert(newcomer, later).unwrap(), InsertOutcome::Replaced);
        assert!(!table.contains(&head));
        assert!(table.contains(&newcomer.peer_id));
        assert_eq!(table.len(), K);
    }

    #[test]
    fn removal_promotes_replacement() {
        let local = id();
        let mut table = RoutingTable::new(local, K);
        let mut members = Vec::new();
        for i in 0..K {
            let c = contact_in_bucket(&local, HIGH_BUCKET, [10, i as u8, 0, 1], 100);
            table.insert(c, 100).unwrap();
            members.push(c);
        }
        let parked = contact_in_bucket(&local, HIGH_BUCKET, [10, 99, 0, 1], 101);
        assert_eq!(table.insert(parked, 101).unwrap(), InsertOutcome::Deferred);

        table.remove(&members[0].peer_id);
        assert!(table.contains(&parked.peer_id));
        assert_eq!(table.len(), K);
    }

    #[test]
    fn subnet_diversity_limits_bucket_share() {
        let local = id();
        let mut table = RoutingTable::new(local, K);
        for host in 0..SUBNET_DIVERSITY_LIMIT as u8 {
            let c = contact_in_bucket(&local, HIGH_BUCKET, [203, 0, 113, host + 1], 100);
            assert_eq!(table.insert(c, 100).unwrap(), InsertOutcome::Added);
        }
        let third = contact_in_bucket(&local, HIGH_BUCKET, [203, 0, 113, 200], 100);
        assert_eq!(
            table.insert(third, 100).unwrap(),
            InsertOutcome::RejectedSubnet
        );
    }

    #[test]
    fn repeated_failures_drop_contact() {
        let mut table = RoutingTable::new(id(), K);
        let c = contact_at([192, 0, 2, 1], 100);
        table.insert(c, 100).unwrap();
        for _ in 0..MAX_FAILED_PROBES {
            table.mark_failed(&c.peer_id, 101);
        }
        assert!(!table.contains(&c.peer_id));
    }

    #[test]
    fn closest_orders_by_distance() {
        let local = id();
        let mut table = RoutingTable::new(local, 20);
        for i in 0..12u8 {
            table
                .insert(contact_at([10, 0, i, 1], 100 + i as u64), 100 + i as u64)
                .unwrap();
        }
        let target = id();
        let closest = table.closest(&target, 5);
        assert_eq!(closest.len(), 5);
        for pair in closest.windows(2) {
            assert!(
                Distance::between(&pair[0].peer_id, &target)
                    <= Distance::between(&pair[1].peer_id, &target)
            );
        }
    }

    #[test]
    fn refresh_bookkeeping() {
        let mut table = RoutingTable::new(id(), K);
        let c = contact_at([192, 0, 2, 1], 100);
        table.insert(c, 100).unwrap();

        let due = table.buckets_needing_refresh(100 + 3600, 3600);
        assert_eq!(due.len(), 1);
        table.mark_refreshed(due[0], 100 + 3600);
        assert!(table.buckets_needing_refresh(100 + 3600, 3600).is_empty());
    }

    #[test]
    fn empty_table_reports_empty() {
        let table = RoutingTable::new(id(), K);
        assert!(table.is_empty());
        assert!(table.closest(&id(), 5).is_empty());
    }
}
