//! Error types for connectivity operations, grouped into the four
//! classes the orchestrator escalates on.

use passage_proto::Tier;
use thiserror::Error;

/// How the orchestrator reacts to an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Absorbed by tier escalation and backoff.
    Transient,
    /// Terminal for the request, never auto-retried.
    PolicyDenied,
    /// Terminal, surfaced to the caller.
    ResourceExhausted,
    /// Terminal for that peer; may flag it in the directory.
    ProtocolViolation,
}

/// Errors that can occur during connectivity operations.
#[derive(Error, Debug)]
pub enum NetError {
    /// Attempt ran out of time.
    #[error("Operation timed out")]
    Timeout,

    /// Peer could not be reached on any candidate address.
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    /// NAT topology rules out this path.
    #[error("NAT incompatible: {0}")]
    NatIncompatible(String),

    /// Tier skipped: no applicable candidates.
    #[error("Tier {0} not applicable")]
    TierSkipped(Tier),

    /// Tier suppressed by its circuit breaker.
    #[error("Circuit breaker open for tier {0}")]
    BreakerOpen(Tier),

    /// The authorizer refused the peer.
    #[error("Denied by policy: {0}")]
    Denied(String),

    /// No relay candidate with session headroom.
    #[error("No relay available")]
    NoRelayAvailable,

    /// Gossip enqueue found zero connected peers.
    #[error("No gossip peers connected")]
    NoGossipPeers,

    /// Durable spool refused the envelope.
    #[error("Spool full: {0}")]
    SpoolFull(String),

    /// Handshake failed: bad signature, id mismatch, or stale timestamp.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Malformed or oversized frame on an established path.
    #[error("Wire error: {0}")]
    Wire(String),

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Proto(#[from] passage_proto::ProtoError),

    /// DHT operation failed.
    #[error("DHT operation failed: {0}")]
    Dht(#[from] passage_dht::DhtError),

    /// Store operation failed.
    #[error("Store operation failed: {0}")]
    Store(#[from] passage_store::StoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// The class driving the orchestrator's reaction.
    pub fn class(&self) -> ErrorClass {
        match self {
            NetError::Timeout
            | NetError::Unreachable(_)
            | NetError::NatIncompatible(_)
            | NetError::TierSkipped(_)
            | NetError::BreakerOpen(_)
            | NetError::Dht(_)
            | NetError::Io(_) => ErrorClass::Transient,
            NetError::Denied(_) => ErrorClass::PolicyDenied,
            NetError::NoRelayAvailable | NetError::NoGossipPeers | NetError::SpoolFull(_) => {
                ErrorClass::ResourceExhausted
            }
            NetError::Store(passage_store::StoreError::StoreFull(_)) => {
                ErrorClass::ResourceExhausted
            }
            NetError::Store(_)
            | NetError::Handshake(_)
            | NetError::Wire(_)
            | NetError::InvalidConfig(_)
            | NetError::Proto(_) => ErrorClass::ProtocolViolation,
        }
    }

    /// Whether escalation to the next tier should continue.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Result type for connectivity operations.
pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_allow_escalation() {
        assert!(NetError::Timeout.is_transient());
        assert!(NetError::Unreachable("no route".into()).is_transient());
        assert!(NetError::BreakerOpen(Tier::Relay).is_transient());
        assert!(NetError::TierSkipped(Tier::HolePunch).is_transient());
    }

    #[test]
    fn denial_is_terminal() {
        assert_eq!(
            NetError::Denied("blocked".into()).class(),
            ErrorClass::PolicyDenied
        );
    }

    #[test]
    fn exhaustion_class() {
        assert_eq!(
            NetError::NoGossipPeers.class(),
            ErrorClass::ResourceExhausted
        );
        assert_eq!(
            NetError::NoRelayAvailable.class(),
            ErrorClass::ResourceExhausted
        );
        let full = NetError::Store(passage_store::StoreError::StoreFull("spool".into()));
        assert_eq!(full.class(), ErrorClass::ResourceExhausted);
    }

    #[test]
    fn violations_are_terminal_for_peer() {
        assert_eq!(
            NetError::Handshake("bad signature".into()).class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(
            NetError::Wire("oversized frame".into()).class(),
            ErrorClass::ProtocolViolation
        );
    }
}
