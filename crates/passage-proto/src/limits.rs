//! Protocol size bounds, budgets, and default timing constants.
//!
//! Every decode path checks its input against the relevant `MAX_*` bound
//! before deserializing, so a hostile datagram is rejected by length
//! alone. Timing constants here are protocol-level defaults; runtime
//! tunables live in the per-subsystem `Config` types.

// === Identity ===

/// Serialized keypair seed length in bytes.
pub const KEYPAIR_SEED_SIZE: usize = 32;

/// Peer id length in bytes (BLAKE3 output).
pub const PEER_ID_SIZE: usize = 32;

// === DHT RPC ===

/// Maximum UDP datagram accepted by the RPC endpoint.
pub const MAX_RPC_PACKET_SIZE: usize = 8192;

/// Maximum serialized value stored under a DHT key.
pub const MAX_DHT_VALUE_SIZE: usize = 4096;

/// Maximum contacts returned from a single FindNode/FindValue response.
pub const MAX_CONTACTS_PER_RESPONSE: usize = 32;

/// Replication factor: bucket capacity and lookup result width.
pub const DHT_K: usize = 20;

/// Lookup parallelism per round.
pub const DHT_ALPHA: usize = 3;

/// Seconds after which a stored DHT record expires.
pub const DHT_RECORD_TTL_SECS: u64 = 2 * 60 * 60;

// === Gossip ===

/// Maximum application payload inside a gossip envelope.
pub const MAX_GOSSIP_PAYLOAD_SIZE: usize = 16 * 1024;

/// Maximum serialized gossip envelope (payload plus routing metadata).
pub const MAX_ENVELOPE_SIZE: usize = MAX_GOSSIP_PAYLOAD_SIZE + 4096;

/// Default hop budget for store-and-forward envelopes.
pub const DEFAULT_TTL_HOPS: u8 = 5;

/// Hard ceiling on the hop budget an inbound envelope may claim.
pub const MAX_TTL_HOPS: u8 = 16;

/// Wall-clock lifetime of a gossip envelope in seconds.
pub const GOSSIP_TTL_SECS: u64 = 24 * 60 * 60;

/// Peers an envelope is pushed to per forwarding step.
pub const GOSSIP_FANOUT: usize = 3;

/// Upper bound on the `seen_by` set carried in an envelope.
pub const MAX_SEEN_BY: usize = 64;

/// Maximum serialized gossip frame (an envelope plus the frame tag).
pub const MAX_GOSSIP_FRAME_SIZE: usize = MAX_ENVELOPE_SIZE + 64;

// === Handshake ===

/// Maximum serialized hello frame.
pub const MAX_HELLO_SIZE: usize = 512;

/// Maximum skew tolerated on a hello timestamp, in seconds.
pub const MAX_HELLO_SKEW_SECS: u64 = 5 * 60;

// === Relay ===

/// Maximum serialized relay frame (data frames dominate).
pub const MAX_RELAY_FRAME_SIZE: usize = 64 * 1024;

/// Maximum payload inside a relay data frame.
pub const MAX_RELAY_DATA_SIZE: usize = 60 * 1024;

/// Default session capacity advertised by a volunteer relay.
pub const DEFAULT_RELAY_MAX_SESSIONS: usize = 10;

/// Seconds of silence after which a relay session is torn down.
pub const RELAY_IDLE_TIMEOUT_SECS: u64 = 5 * 60;

// === Directory ===

/// Seconds a directory record survives without a `last_seen_at` refresh.
pub const DIRECTORY_RECORD_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Seconds an announcement remains plausible for dialing.
pub const ANNOUNCEMENT_FRESH_SECS: u64 = 24 * 60 * 60;

/// Endpoints retained per directory record.
pub const MAX_ENDPOINTS_PER_RECORD: usize = 16;

/// Maximum serialized directory record.
pub const MAX_PEER_RECORD_SIZE: usize = 4096;

// === Signaling ===

/// Maximum serialized signaling payload.
pub const MAX_SIGNAL_SIZE: usize = 4096;

/// Maximum candidate addresses per offer/answer.
pub const MAX_CANDIDATES: usize = 8;
