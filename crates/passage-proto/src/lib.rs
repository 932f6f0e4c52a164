//! Identity, data model, and wire formats for the passage connectivity core.
//!
//! This crate defines everything that crosses a process boundary or is
//! persisted by the higher layers:
//!
//! - **Identity**: Ed25519 node keypairs and the [`PeerId`] derived from
//!   the verifying key by a domain-separated BLAKE3 hash.
//! - **Reachability model**: transport [`Tier`]s, dialable [`Endpoint`]s,
//!   NAT classification, and the [`PeerAnnouncement`] record published to
//!   the DHT.
//! - **Directory records**: the cached [`PeerRecord`] with its
//!   last-successful-tier hint.
//! - **Wire formats**: DHT RPC datagrams, the gossip [`GossipEnvelope`],
//!   relay frames, signaling payloads, and the authenticated hello.
//!
//! All decode paths validate input size against the bounds in [`limits`]
//! before deserializing. Nothing in this crate performs I/O.
//!
//! # Example
//!
//! ```
//! use passage_proto::{NodeKeypair, PeerId};
//!
//! let keypair = NodeKeypair::generate();
//! let peer_id = keypair.peer_id();
//! let parsed: PeerId = peer_id.to_hex().parse().unwrap();
//! assert_eq!(parsed, peer_id);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod limits;
pub mod record;
pub mod rpc;
pub mod wire;

#[cfg(test)]
mod proptests;

pub use endpoint::{
    AddrScope, Endpoint, NatKind, PeerAnnouncement, PunchAdvert, RelayAdvert, Tier, Transport,
};
pub use envelope::{GossipAck, GossipEnvelope, GossipFrame, MessageId};
pub use error::{ProtoError, Result};
pub use identity::{NodeKeypair, PeerId};
pub use record::{PeerRecord, TrustState};
pub use rpc::{Contact, RpcId, RpcMessage, RpcPayload, RpcRequest, RpcResponse};
pub use wire::{
    CandidateAddr, CandidateKind, Hello, RelayFrame, RendezvousTicket, SessionId, SignalPayload,
};

/// Current protocol version carried in handshakes and RPC headers.
pub const PROTOCOL_VERSION: u16 = 1;

/// Unix timestamp in seconds. Clock errors collapse to 0 rather than
/// panicking; callers treat 0 as "unknown, always stale".
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Unix timestamp in milliseconds, same error posture as [`unix_now`].
pub fn unix_now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
