//! Property-based tests for protocol invariants.
//!
//! Covered here:
//! - Peer id hex encoding is a bijection on 32-byte strings.
//! - XOR distance laws the routing layer depends on.
//! - Gossip hop accounting: budgets only decrease, forwarders are
//!   recorded at most once.
//! - Wire codecs roundtrip and never panic on arbitrary input.

use proptest::prelude::*;

use crate::endpoint::{NatKind, PeerAnnouncement, PunchAdvert};
use crate::envelope::GossipEnvelope;
use crate::identity::PeerId;
use crate::limits::{MAX_GOSSIP_PAYLOAD_SIZE, MAX_TTL_HOPS};
use crate::rpc::{RpcMessage, RpcRequest};
use crate::wire::{parse_probe, probe_bytes, Hello, ProbeKind, RelayFrame};

fn arb_peer_id() -> impl Strategy<Value = PeerId> {
    proptest::array::uniform32(any::<u8>()).prop_map(|bytes| PeerId::from_bytes(&bytes).unwrap())
}

fn arb_v4(port: u16) -> std::net::SocketAddrV4 {
    std::net::SocketAddrV4::new(std::net::Ipv4Addr::new(192, 0, 2, 1), port)
}

// ==== Peer Id Property Tests ====

proptest! {
    #[test]
    fn peer_id_hex_roundtrip(bytes in proptest::array::uniform32(any::<u8>())) {
        let id = PeerId::from_bytes(&bytes).unwrap();
        let back = PeerId::from_hex(&id.to_hex()).unwrap();
        prop_assert_eq!(back, id);
    }

    #[test]
    fn peer_id_from_hex_never_panics(s in ".{0,128}") {
        let _ = PeerId::from_hex(&s);
    }

    #[test]
    fn xor_distance_identity_and_symmetry(
        a in proptest::array::uniform32(any::<u8>()),
        b in proptest::array::uniform32(any::<u8>()),
    ) {
        let a = PeerId::from_bytes(&a).unwrap();
        let b = PeerId::from_bytes(&b).unwrap();
        prop_assert_eq!(a.xor(&a), [0u8; 32]);
        prop_assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn xor_distance_composes(
        a in proptest::array::uniform32(any::<u8>()),
        b in proptest::array::uniform32(any::<u8>()),
        c in proptest::array::uniform32(any::<u8>()),
    ) {
        let a = PeerId::from_bytes(&a).unwrap();
        let b = PeerId::from_bytes(&b).unwrap();
        let c = PeerId::from_bytes(&c).unwrap();
        let direct = a.xor(&c);
        let via: Vec<u8> = a
            .xor(&b)
            .iter()
            .zip(b.xor(&c).iter())
            .map(|(x, y)| x ^ y)
            .collect();
        prop_assert_eq!(direct.to_vec(), via);
    }
}

// ==== Envelope Property Tests ====

proptest! {
    #[test]
    fn hop_budget_strictly_decreases(
        origin in arb_peer_id(),
        dest in arb_peer_id(),
        forwarders in proptest::collection::vec(arb_peer_id(), 1..8),
    ) {
        let mut env = GossipEnvelope::new(origin, dest, vec![1, 2, 3], 0).unwrap();
        let mut last = env.ttl_hops;
        for f in forwarders {
            if env.ttl_hops == 0 {
                prop_assert!(env.record_hop(f).is_err());
                break;
            }
            env.record_hop(f).unwrap();
            prop_assert_eq!(env.ttl_hops, last - 1);
            prop_assert!(env.has_seen(&f));
            last = env.ttl_hops;
        }
    }

    #[test]
    fn repeated_forwarder_recorded_once(
        origin in arb_peer_id(),
        dest in arb_peer_id(),
        forwarder in arb_peer_id(),
    ) {
        let mut env = GossipEnvelope::new(origin, dest, vec![], 0).unwrap();
        env.record_hop(forwarder).unwrap();
        let before = env.seen_by.len();
        env.record_hop(forwarder).unwrap();
        prop_assert_eq!(env.seen_by.len(), before);
    }

    #[test]
    fn envelope_roundtrip(
        origin in arb_peer_id(),
        dest in arb_peer_id(),
        payload in proptest::collection::vec(any::<u8>(), 0..512),
        ttl in 0..=MAX_TTL_HOPS,
        issued_at in any::<u32>(),
    ) {
        let mut env = GossipEnvelope::new(origin, dest, payload, issued_at as u64).unwrap();
        env.ttl_hops = ttl;
        let back = GossipEnvelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(back, env);
    }

    #[test]
    fn envelope_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let _ = GossipEnvelope::from_bytes(&bytes);
    }

    #[test]
    fn payload_cap_is_exact(extra in 0usize..4) {
        let origin = PeerId::from_bytes(&[1u8; 32]).unwrap();
        let dest = PeerId::from_bytes(&[2u8; 32]).unwrap();
        let payload = vec![0u8; MAX_GOSSIP_PAYLOAD_SIZE + extra];
        let result = GossipEnvelope::new(origin, dest, payload, 0);
        prop_assert_eq!(result.is_ok(), extra == 0);
    }
}

// ==== RPC Property Tests ====

proptest! {
    #[test]
    fn rpc_store_roundtrip(
        sender in arb_peer_id(),
        key in arb_peer_id(),
        value in proptest::collection::vec(any::<u8>(), 0..1024),
    ) {
        let msg = RpcMessage::request(sender, RpcRequest::Store { key, value });
        let back = RpcMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(back, msg);
    }

    #[test]
    fn rpc_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let _ = RpcMessage::from_bytes(&bytes);
    }
}

// ==== Announcement Property Tests ====

proptest! {
    #[test]
    fn announcement_roundtrip(
        peer_id in arb_peer_id(),
        port in 1024u16..,
        punch_port in prop::option::of(1u16..),
        issued_at in any::<u32>(),
    ) {
        let ann = PeerAnnouncement {
            peer_id,
            ipv4_local: Some(arb_v4(port)),
            ipv4_external: None,
            nat: NatKind::Cone,
            ipv6: None,
            relay: None,
            punch: punch_port.map(|p| PunchAdvert {
                port: p,
                nat: NatKind::Cone,
                success_rate: 0.5,
            }),
            reachable_via: Vec::new(),
            issued_at: issued_at as u64,
        };
        let back = PeerAnnouncement::from_value_bytes(&ann.to_value_bytes().unwrap()).unwrap();
        prop_assert_eq!(back, ann);
    }

    #[test]
    fn announcement_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..1024)) {
        let _ = PeerAnnouncement::from_value_bytes(&bytes);
    }
}

// ==== Probe & Frame Property Tests ====

proptest! {
    #[test]
    fn probe_roundtrip(token in proptest::array::uniform16(any::<u8>())) {
        for kind in [ProbeKind::Punch, ProbeKind::PunchAck, ProbeKind::Check, ProbeKind::CheckAck] {
            let bytes = probe_bytes(kind, &token);
            prop_assert_eq!(parse_probe(&bytes), Some((kind, token)));
        }
    }

    #[test]
    fn probe_parse_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = parse_probe(&bytes);
    }

    #[test]
    fn relay_frame_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let _ = RelayFrame::from_bytes(&bytes);
    }

    #[test]
    fn hello_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..600)) {
        let _ = Hello::from_bytes(&bytes);
    }
}
