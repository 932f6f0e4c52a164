//! Fuzz target for PeerId::from_hex.
//!
//! Tests that parsing arbitrary strings as hex peer ids is handled safely.

#![no_main]

use libfuzzer_sys::fuzz_target;
use passage_proto::PeerId;

fuzz_target!(|data: &[u8]| {
    // Try to interpret input as a string
    if let Ok(s) = std::str::from_utf8(data) {
        // Should succeed for valid 64-char hex, fail otherwise - never panic
        let result = PeerId::from_hex(s);

        // If successful, verify roundtrip
        if let Ok(peer_id) = result {
            let hex = peer_id.to_hex();
            let roundtrip = PeerId::from_hex(&hex).unwrap();
            assert_eq!(peer_id, roundtrip);
        }
    }
});
