//! Fuzz target for PeerAnnouncement::from_value_bytes.
//!
//! Tests that parsing arbitrary DHT values as announcements is handled
//! safely and that accepted records always carry a dialable address.

#![no_main]

use libfuzzer_sys::fuzz_target;
use passage_proto::PeerAnnouncement;

fuzz_target!(|data: &[u8]| {
    // Should succeed for valid JSON under the cap, fail otherwise - never panic
    let result = PeerAnnouncement::from_value_bytes(data);

    if let Ok(announcement) = result {
        // Validation guarantees at least one address and nonzero
        // advertised ports
        assert!(!announcement.endpoints().is_empty());
        if let Some(relay) = &announcement.relay {
            assert_ne!(relay.port, 0);
        }
        if let Some(punch) = &announcement.punch {
            assert_ne!(punch.port, 0);
        }

        // If re-encoding fits the cap, verify roundtrip
        if let Ok(bytes) = announcement.to_value_bytes() {
            let roundtrip = PeerAnnouncement::from_value_bytes(&bytes).unwrap();
            assert_eq!(announcement, roundtrip);
        }
    }
});
