//! Routing table contacts and their liveness bookkeeping.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use passage_proto::PeerId;

/// Seconds without a response after which a contact counts as stale.
pub const CONTACT_STALE_SECS: u64 = 15 * 60;

/// Failed probes after which a contact counts as stale regardless of age.
pub const MAX_FAILED_PROBES: u8 = 2;

/// Bits of an IPv4 address that define its diversity subnet (/24).
const SUBNET_PREFIX_V4: usize = 3;

/// Bytes of an IPv6 address that define its diversity subnet (/48).
const SUBNET_PREFIX_V6: usize = 6;

/// Subnet grouping key used for bucket diversity limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubnetKey {
    /// First three octets of an IPv4 address.
    V4([u8; 3]),
    /// First six bytes of an IPv6 address.
    V6([u8; 6]),
}

impl SubnetKey {
    /// Derives the subnet key for an address.
    pub fn from_ip(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                let mut key = [0u8; SUBNET_PREFIX_V4];
                key.copy_from_slice(&octets[..SUBNET_PREFIX_V4]);
                SubnetKey::V4(key)
            }
            IpAddr::V6(v6) => {
                let octets = v6.octets();
                let mut key = [0u8; SUBNET_PREFIX_V6];
                key.copy_from_slice(&octets[..SUBNET_PREFIX_V6]);
                SubnetKey::V6(key)
            }
        }
    }
}

/// One known DHT participant.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// The peer's id.
    pub peer_id: PeerId,
    /// Address its RPC endpoint answered from.
    pub addr: SocketAddr,
    /// Last time we heard from it, unix seconds.
    pub last_seen: u64,
    /// Probes that went unanswered since `last_seen`.
    pub failed_probes: u8,
}

impl Contact {
    /// New contact first heard from at `now`.
    pub fn new(peer_id: PeerId, addr: SocketAddr, now: u64) -> Self {
        Contact {
            peer_id,
            addr,
            last_seen: now,
            failed_probes: 0,
        }
    }

    /// Records a successful exchange.
    pub fn touch(&mut self, now: u64) {
        self.last_seen = now;
        self.failed_probes = 0;
    }

    /// Records an unanswered probe.
    pub fn record_failure(&mut self) {
        self.failed_probes = self.failed_probes.saturating_add(1);
    }

    /// Stale contacts are eviction candidates when their bucket fills.
    pub fn is_stale(&self, now: u64) -> bool {
        self.failed_probes >= MAX_FAILED_PROBES
            || now >= self.last_seen.saturating_add(CONTACT_STALE_SECS)
    }

    /// Subnet diversity key for this contact.
    pub fn subnet_key(&self) -> SubnetKey {
        SubnetKey::from_ip(&self.addr.ip())
    }

    /// Wire representation for RPC responses.
    pub fn to_wire(&self) -> passage_proto::Contact {
        passage_proto::Contact {
            peer_id: self.peer_id,
            addr: self.addr,
        }
    }

    /// Builds a contact from its wire representation.
    pub fn from_wire(wire: &passage_proto::Contact, now: u64) -> Self {
        Contact::new(wire.peer_id, wire.addr, now)
    }
}
