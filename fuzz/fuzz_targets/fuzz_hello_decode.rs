//! Fuzz target for Hello::from_bytes.
//!
//! Tests that parsing arbitrary bytes as a handshake hello is handled
//! safely and that verifying a decoded hello never panics.

#![no_main]

use libfuzzer_sys::fuzz_target;
use passage_proto::Hello;

fuzz_target!(|data: &[u8]| {
    // Should succeed for valid frames under the cap, fail otherwise - never panic
    let result = Hello::from_bytes(data);

    if let Ok(hello) = result {
        // Verification of arbitrary key and signature material must
        // reject cleanly, never panic
        let _ = hello.verify(None, hello.issued_at);

        // Roundtrip through to_bytes
        let bytes = hello.to_bytes().unwrap();
        let roundtrip = Hello::from_bytes(&bytes).unwrap();
        assert_eq!(hello, roundtrip);
    }
});
