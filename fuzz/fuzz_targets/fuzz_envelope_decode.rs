//! Fuzz target for GossipFrame::from_bytes.
//!
//! Tests that parsing arbitrary bytes as a gossip frame is handled safely
//! and that decoded envelopes satisfy their structural invariants.

#![no_main]

use libfuzzer_sys::fuzz_target;
use passage_proto::limits::{MAX_GOSSIP_PAYLOAD_SIZE, MAX_SEEN_BY, MAX_TTL_HOPS};
use passage_proto::GossipFrame;

fuzz_target!(|data: &[u8]| {
    // Should succeed for valid frames under the cap, fail otherwise - never panic
    let result = GossipFrame::from_bytes(data);

    if let Ok(frame) = result {
        // A decoded envelope has already passed validation
        if let GossipFrame::Envelope(envelope) = &frame {
            assert!(envelope.payload.len() <= MAX_GOSSIP_PAYLOAD_SIZE);
            assert!(envelope.ttl_hops <= MAX_TTL_HOPS);
            assert!(envelope.seen_by.len() <= MAX_SEEN_BY);
        }

        // Roundtrip through to_bytes
        let bytes = frame.to_bytes().unwrap();
        let roundtrip = GossipFrame::from_bytes(&bytes).unwrap();
        assert_eq!(frame, roundtrip);
    }
});
