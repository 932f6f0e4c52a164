//! Fuzz target for RpcMessage::from_bytes.
//!
//! Tests that parsing arbitrary bytes as a DHT RPC packet is handled safely.

#![no_main]

use libfuzzer_sys::fuzz_target;
use passage_proto::limits::MAX_RPC_PACKET_SIZE;
use passage_proto::RpcMessage;

fuzz_target!(|data: &[u8]| {
    // Should succeed for valid JSON under the cap, fail otherwise - never panic
    let result = RpcMessage::from_bytes(data);

    if data.len() > MAX_RPC_PACKET_SIZE {
        assert!(result.is_err());
    }

    // If successful, verify roundtrip
    if let Ok(message) = result {
        if let Ok(bytes) = message.to_bytes() {
            let roundtrip = RpcMessage::from_bytes(&bytes).unwrap();
            assert_eq!(message, roundtrip);
        }
    }
});
