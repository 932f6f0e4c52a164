//! Iterative lookup state, kept free of I/O.
//!
//! The node drives this frontier: pull a batch with
//! [`Lookup::next_batch`], query those contacts in parallel, feed the
//! outcomes back through [`Lookup::on_response`] and
//! [`Lookup::on_failure`], repeat until [`Lookup::is_complete`].
//! Candidates are ordered by XOR distance to the target, so each batch
//! asks the closest peers not yet tried.

use std::collections::{BTreeMap, HashSet};

use passage_proto::PeerId;

use crate::contact::Contact;
use crate::distance::Distance;

/// Consecutive unproductive rounds before a lookup gives up.
const MAX_STALL_ROUNDS: u32 = 2;

/// Upper bound on tracked candidates; the farthest are pruned beyond it.
const MAX_CANDIDATES: usize = 128;

/// State of one iterative lookup.
#[derive(Debug)]
pub struct Lookup {
    local_id: PeerId,
    target: PeerId,
    k: usize,
    alpha: usize,
    candidates: BTreeMap<Distance, Contact>,
    queried: HashSet<PeerId>,
    responded: HashSet<PeerId>,
    in_flight: HashSet<PeerId>,
    batch_remaining: usize,
    batch_improved: bool,
    stalled_rounds: u32,
}

impl Lookup {
    /// Starts a lookup for `target` from the given seed contacts.
    pub fn new(local_id: PeerId, target: PeerId, k: usize, alpha: usize, seeds: Vec<Contact>) -> Self {
        let mut lookup = Lookup {
            local_id,
            target,
            k,
            alpha,
            candidates: BTreeMap::new(),
            queried: HashSet::new(),
            responded: HashSet::new(),
            in_flight: HashSet::new(),
            batch_remaining: 0,
            batch_improved: false,
            stalled_rounds: 0,
        };
        for seed in seeds {
            lookup.add_candidate(seed);
        }
        lookup
    }

    /// The lookup target.
    pub fn target(&self) -> PeerId {
        self.target
    }

    /// Up to `alpha` closest not-yet-queried contacts, marked in flight.
    ///
    /// Returns an empty batch while an earlier batch is still being
    /// resolved or when no untried candidates remain.
    pub fn next_batch(&mut self) -> Vec<Contact> {
        if !self.in_flight.is_empty() {
            return Vec::new();
        }
        let batch: Vec<Contact> = self
            .candidates
            .values()
            .filter(|c| !self.queried.contains(&c.peer_id) && !self.in_flight.contains(&c.peer_id))
            .take(self.alpha)
            .copied()
            .collect();
        for contact in &batch {
            self.in_flight.insert(contact.peer_id);
        }
        self.batch_remaining = batch.len();
        self.batch_improved = false;
        batch
    }

    /// Records a successful response carrying `contacts`.
    pub fn on_response(&mut self, responder: PeerId, contacts: Vec<Contact>) {
        self.settle(responder);
        self.responded.insert(responder);
        for contact in contacts {
            if self.add_candidate(contact) {
                self.batch_improved = true;
            }
        }
    }

    /// Records a failed or unanswered query.
    ///
    /// The peer stays marked as queried so it is not asked again.
    pub fn on_failure(&mut self, peer: PeerId) {
        self.settle(peer);
    }

    /// Whether the lookup has converged.
    ///
    /// True once no queries are outstanding and either the closest `k`
    /// known candidates have all been queried or two whole rounds passed
    /// without discovering anyone closer.
    pub fn is_complete(&self) -> bool {
        if !self.in_flight.is_empty() {
            return false;
        }
        if self.stalled_rounds >= MAX_STALL_ROUNDS {
            return true;
        }
        self.candidates
            .values()
            .take(self.k)
            .all(|c| self.queried.contains(&c.peer_id))
    }

    /// The closest `k` contacts found so far.
    pub fn closest(&self) -> Vec<Contact> {
        self.candidates.values().take(self.k).copied().collect()
    }

    /// Peers that answered, closest first. Used to pick storage targets.
    pub fn closest_responded(&self) -> Vec<Contact> {
        self.candidates
            .values()
            .filter(|c| self.responded.contains(&c.peer_id))
            .take(self.k)
            .copied()
            .collect()
    }

    fn settle(&mut self, peer: PeerId) {
        if self.in_flight.remove(&peer) {
            self.batch_remaining = self.batch_remaining.saturating_sub(1);
            if self.batch_remaining == 0 {
                if self.batch_improved {
                    self.stalled_rounds = 0;
                } else {
                    self.stalled_rounds += 1;
                }
            }
        }
        self.queried.insert(peer);
    }

    /// Inserts a candidate; true when it lands among the closest `k`.
    fn add_candidate(&mut self, contact: Contact) -> bool {
        if contact.peer_id == self.local_id || self.queried.contains(&contact.peer_id) {
            return false;
        }
        let distance = Distance::between(&self.target, &contact.peer_id);
        if self.candidates.contains_key(&distance) {
            return false;
        }
        self.candidates.insert(distance, contact);
        self.prune();
        let rank = self.candidates.range(..=distance).count();
        rank <= self.k
    }

    fn prune(&mut self) {
        while self.candidates.len() > MAX_CANDIDATES {
            let farthest = match self.candidates.keys().next_back() {
                Some(d) => *d,
                None => break,
            };
            if let Some(contact) = self.candidates.get(&farthest) {
                if self.in_flight.contains(&contact.peer_id) {
                    break;
                }
            }
            self.candidates.remove(&farthest);
        }
    }
}

// ==== Lookup Tests ====

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn pid(first: u8) -> PeerId {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        bytes[31] = 1;
        PeerId::from_bytes(&bytes).unwrap()
    }

    fn contact(first: u8) -> Contact {
        let addr: SocketAddr = format!("198.51.100.{}:4000", first).parse().unwrap();
        Contact::new(pid(first), addr, 1_000)
    }

    fn target() -> PeerId {
        PeerId::from_bytes(&[0u8; 32]).unwrap()
    }

    fn lookup_with_seeds(seeds: Vec<Contact>) -> Lookup {
        Lookup::new(pid(0xff), target(), 4, 2, seeds)
    }

    #[test]
    fn batches_are_closest_first_and_alpha_sized() {
        let mut lookup = lookup_with_seeds(vec![contact(8), contact(2), contact(32), contact(16)]);
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].peer_id, pid(2));
        assert_eq!(batch[1].peer_id, pid(8));
    }

    #[test]
    fn no_new_batch_while_one_is_in_flight() {
        let mut lookup = lookup_with_seeds(vec![contact(2), contact(4), contact(8)]);
        let first = lookup.next_batch();
        assert_eq!(first.len(), 2);
        assert!(lookup.next_batch().is_empty());

        lookup.on_response(first[0].peer_id, vec![]);
        assert!(lookup.next_batch().is_empty());
        lookup.on_failure(first[1].peer_id);
        assert_eq!(lookup.next_batch().len(), 1);
    }

    #[test]
    fn responses_widen_the_frontier() {
        let mut lookup = lookup_with_seeds(vec![contact(64)]);
        let batch = lookup.next_batch();
        assert_eq!(batch.len(), 1);

        lookup.on_response(pid(64), vec![contact(3), contact(5)]);
        let next = lookup.next_batch();
        assert_eq!(next[0].peer_id, pid(3));
        assert_eq!(next[1].peer_id, pid(5));
    }

    #[test]
    fn own_id_is_never_a_candidate() {
        let mut lookup = lookup_with_seeds(vec![contact(64)]);
        lookup.next_batch();

        let local = Contact::new(pid(0xff), "198.51.100.9:4000".parse().unwrap(), 1_000);
        lookup.on_response(pid(64), vec![local]);
        assert!(lookup.next_batch().is_empty());
        assert!(lookup.is_complete());
    }

    #[test]
    fn failed_peers_are_not_reissued() {
        let mut lookup = lookup_with_seeds(vec![contact(2), contact(4)]);
        let batch = lookup.next_batch();
        lookup.on_failure(batch[0].peer_id);
        lookup.on_failure(batch[1].peer_id);

        assert!(lookup.next_batch().is_empty());
        assert!(lookup.is_complete());
    }

    #[test]
    fn completes_when_closest_k_all_queried() {
        let mut lookup = lookup_with_seeds(vec![contact(2), contact(4), contact(8), contact(16)]);
        assert!(!lookup.is_complete());

        while !lookup.is_complete() {
            let batch = lookup.next_batch();
            assert!(!batch.is_empty(), "incomplete lookup must have work");
            for contact in batch {
                lookup.on_response(contact.peer_id, vec![]);
            }
        }
        let closest = lookup.closest();
        assert_eq!(closest.len(), 4);
        assert_eq!(closest[0].peer_id, pid(2));
    }

    #[test]
    fn stalls_out_after_two_unproductive_rounds() {
        // Seeds keep answering with far contacts only, never anything
        // closer than what is already known.
        let mut lookup = lookup_with_seeds(vec![contact(1), contact(2)]);
        let mut far = 0x40u8;
        let mut rounds = 0;
        while !lookup.is_complete() {
            let batch = lookup.next_batch();
            if batch.is_empty() {
                break;
            }
            rounds += 1;
            for c in batch {
                lookup.on_response(c.peer_id, vec![contact(far), contact(far + 1)]);
                far = far.saturating_add(2);
            }
            assert!(rounds <= 16, "stall detection must bound the rounds");
        }
        assert!(lookup.is_complete());
    }

    #[test]
    fn closest_responded_excludes_silent_peers() {
        let mut lookup = lookup_with_seeds(vec![contact(2), contact(4)]);
        let batch = lookup.next_batch();
        lookup.on_response(batch[0].peer_id, vec![]);
        lookup.on_failure(batch[1].peer_id);

        let responded = lookup.closest_responded();
        assert_eq!(responded.len(), 1);
        assert_eq!(responded[0].peer_id, batch[0].peer_id);
    }
}
