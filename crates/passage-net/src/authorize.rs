//! Authorization seam consulted before any inbound peer gains session
//! state. The policy engine itself lives outside this crate; listeners,
//! the relay server, and the gossip intake all call through this trait.

use std::collections::HashSet;

use passage_proto::PeerId;

use crate::transport::BoxFuture;

/// Action name for accepting an inbound connection.
pub const ACTION_CONNECTION: &str = "connection";

/// Action name for accepting inbound gossip frames.
pub const ACTION_GOSSIP: &str = "gossip";

/// Action name for a relay registration.
pub const ACTION_RELAY: &str = "relay";

/// Outcome of an authorization check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The action may proceed.
    Allow,
    /// The action is refused; the reason reaches logs, not the peer.
    Deny {
        /// Why the peer was refused.
        reason: String,
    },
}

impl Decision {
    /// Whether the action may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Capability trait deciding whether a peer may perform an action.
///
/// This trait uses boxed futures instead of async fn to enable
/// dynamic dispatch (dyn-compatibility).
pub trait Authorizer: Send + Sync {
    /// Decides whether `peer_id` may perform `action`.
    fn authorize(&self, peer_id: &PeerId, action: &str) -> BoxFuture<'_, Decision>;
}

/// Permits every peer and action; the default when no policy engine is
/// wired in.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _peer_id: &PeerId, _action: &str) -> BoxFuture<'_, Decision> {
        Box::pin(async { Decision::Allow })
    }
}

/// Static blocklist: denies the listed peers, allows everyone else.
#[derive(Clone, Debug, Default)]
pub struct DenyList {
    denied: HashSet<PeerId>,
}

impl DenyList {
    /// Blocklist over the given peers.
    pub fn new(denied: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            denied: denied.into_iter().collect(),
        }
    }
}

impl Authorizer for DenyList {
    fn authorize(&self, peer_id: &PeerId, _action: &str) -> BoxFuture<'_, Decision> {
        let decision = if self.denied.contains(peer_id) {
            Decision::Deny {
                reason: format!("peer {} is on the deny list", peer_id),
            }
        } else {
            Decision::Allow
        };
        Box::pin(async move { decision })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_proto::NodeKeypair;

    #[tokio::test]
    async fn allow_all_allows() {
        let peer = NodeKeypair::generate().peer_id();
        let decision = AllowAll.authorize(&peer, ACTION_CONNECTION).await;
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn deny_list_blocks_only_listed_peers() {
        let blocked = NodeKeypair::generate().peer_id();
        let other = NodeKeypair::generate().peer_id();
        let policy = DenyList::new([blocked]);

        assert!(!policy.authorize(&blocked, ACTION_GOSSIP).await.is_allowed());
        assert!(policy.authorize(&other, ACTION_GOSSIP).await.is_allowed());
    }
}
