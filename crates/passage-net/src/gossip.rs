//! Store-and-forward gossip: the fallback that moves a message when no
//! live tier can reach its destination.
//!
//! Envelopes persist in the spool and ride the gossip lane of whatever
//! channels happen to be open, hopping peer to peer until the
//! destination comes online. Delivery flows an ack back through the
//! mesh so holders drop their copies. The manager owns the gossip lane
//! of every promoted channel; the application lane never sees a gossip
//! frame.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use passage_proto::{unix_now, GossipAck, GossipEnvelope, GossipFrame, MessageId, PeerId};
use passage_store::GossipSpool;

use crate::config::NetConfig;
use crate::error::{ErrorClass, NetError, Result};
use crate::transport::{Channel, ChannelRegistry, CHANNEL_BUFFER};

/// Seconds between expiry sweeps over the spool.
const SWEEP_INTERVAL_SECS: u64 = 60;

/// What handling one inbound gossip frame amounted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GossipDisposition {
    /// The envelope was addressed to us and went upward.
    Delivered,
    /// The envelope was re-spooled and pushed to this many peers.
    Forwarded(usize),
    /// Already held or already acknowledged; dropped.
    Duplicate,
    /// Hop budget or wall clock ran out; dropped and counted.
    Expired,
    /// An acknowledgement was processed.
    AckHandled,
}

/// The store-and-forward manager.
///
/// One instance per node. Cheap to share; all state lives in the spool
/// and the channel registry.
pub struct GossipManager {
    local: PeerId,
    registry: Arc<ChannelRegistry>,
    spool: GossipSpool,
    fanout: usize,
    delivered_tx: mpsc::Sender<GossipEnvelope>,
}

impl GossipManager {
    /// Builds the manager and the receiver surfacing envelopes that
    /// were addressed to this node.
    pub fn new(
        local: PeerId,
        registry: Arc<ChannelRegistry>,
        spool: GossipSpool,
        config: &NetConfig,
    ) -> (Self, mpsc::Receiver<GossipEnvelope>) {
        let (delivered_tx, delivered_rx) = mpsc::channel(CHANNEL_BUFFER);
        (
            GossipManager {
                local,
                registry,
                spool,
                fanout: config.gossip_fanout,
                delivered_tx,
            },
            delivered_rx,
        )
    }

    /// Spools an envelope and pushes it to up to `fanout` connected
    /// peers that have not held it yet.
    ///
    /// With zero connected peers the copy stays spooled and the call
    /// fails; the next promoted channel triggers the anti-entropy offer
    /// that moves it.
    pub async fn enqueue(&self, envelope: &GossipEnvelope, now: u64) -> Result<MessageId> {
        self.spool.insert(envelope, now)?;
        let connected = self.registry.connected_peers().await;
        if connected.is_empty() {
            return Err(NetError::NoGossipPeers);
        }
        let pushed = self.push_to_peers(envelope, None, now).await;
        debug!(
            id = %envelope.message_id,
            destination = %envelope.destination,
            pushed,
            "Envelope enqueued"
        );
        Ok(envelope.message_id)
    }

    /// Handles one frame read off a channel's gossip lane.
    pub async fn handle_frame(
        &self,
        from: PeerId,
        bytes: &[u8],
        now: u64,
    ) -> Result<GossipDisposition> {
        match GossipFrame::from_bytes(bytes)? {
            GossipFrame::Ack(ack) => {
                let held = self.spool.ack(&ack.message_id, now)?;
                debug!(id = %ack.message_id, acked_by = %ack.acked_by, held, "Ack processed");
                Ok(GossipDisposition::AckHandled)
            }
            GossipFrame::Envelope(mut envelope) => {
                let id = envelope.message_id;
                if self.spool.was_acked(&id)? {
                    // The sender still holds a delivered envelope; the
                    // ack lets it drop the copy.
                    self.send_ack(from, id, now).await;
                    return Ok(GossipDisposition::Duplicate);
                }
                if envelope.destination == self.local {
                    self.spool.ack(&id, now)?;
                    self.send_ack(from, id, now).await;
                    if self.delivered_tx.send(envelope).await.is_err() {
                        warn!(id = %id, "Delivered envelope dropped: consumer gone");
                    }
                    return Ok(GossipDisposition::Delivered);
                }
                if self.spool.contains(&id)? {
                    return Ok(GossipDisposition::Duplicate);
                }
                if envelope.is_expired(now) || envelope.ttl_hops == 0 {
                    debug!(id = %id, ttl = envelope.ttl_hops, "Envelope expired in transit");
                    return Ok(GossipDisposition::Expired);
                }
                envelope.record_hop(self.local)?;
                self.spool.insert(&envelope, now)?;
                let pushed = self.push_to_peers(&envelope, Some(from), now).await;
                Ok(GossipDisposition::Forwarded(pushed))
            }
        }
    }

    /// Anti-entropy push: offers spooled envelopes this peer should
    /// hold. Called for every freshly promoted channel.
    pub async fn on_peer_connected(&self, peer: PeerId, now: u64) -> usize {
        let offers = match self.spool.offers_for(&peer, now) {
            Ok(offers) => offers,
            Err(e) => {
                warn!(%peer, %e, "Spool scan for offers failed");
                return 0;
            }
        };
        let mut sent = 0;
        for envelope in offers {
            let Some(channel) = self.registry.get(&peer).await else {
                break;
            };
            if self.push_one(&channel, &envelope, now).await {
                sent += 1;
            } else {
                break;
            }
        }
        if sent > 0 {
            debug!(%peer, sent, "Anti-entropy offers pushed");
        }
        sent
    }

    /// Consumes promoted channels, reading each one's gossip lane until
    /// the peer goes away, and sweeps expired envelopes periodically.
    pub async fn run(self: Arc<Self>, mut promoted: mpsc::Receiver<Arc<Channel>>) {
        let mut sweep = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            tokio::select! {
                maybe = promoted.recv() => {
                    let Some(channel) = maybe else { return };
                    let peer = channel.peer_id();
                    self.on_peer_connected(peer, unix_now()).await;
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        manager.drive_channel(peer, channel).await;
                    });
                }
                _ = sweep.tick() => {
                    match self.spool.sweep_expired(unix_now()) {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "Expired gossip envelopes swept"),
                        Err(e) => warn!(%e, "Expiry sweep failed"),
                    }
                }
            }
        }
    }

    /// Envelopes currently spooled.
    pub fn spooled(&self) -> usize {
        self.spool.len()
    }

    async fn drive_channel(&self, peer: PeerId, channel: Arc<Channel>) {
        while let Some(frame) = channel.recv_gossip().await {
            match self.handle_frame(peer, &frame, unix_now()).await {
                Ok(disposition) => {
                    debug!(%peer, ?disposition, "Gossip frame handled");
                }
                Err(e) => {
                    warn!(%peer, %e, "Gossip frame rejected");
                    if e.class() == ErrorClass::ProtocolViolation {
                        break;
                    }
                }
            }
        }
        debug!(%peer, "Gossip lane closed");
    }

    /// Pushes to up to `fanout` connected peers, the destination first
    /// when it happens to be connected, skipping `exclude` and peers
    /// already in `seen_by`.
    async fn push_to_peers(
        &self,
        envelope: &GossipEnvelope,
        exclude: Option<PeerId>,
        now: u64,
    ) -> usize {
        let mut peers = self.registry.connected_peers().await;
        peers.sort_by_key(|p| *p != envelope.destination);

        let mut pushed = 0;
        for peer in peers {
            if pushed >= self.fanout {
                break;
            }
            if Some(peer) == exclude || peer == self.local || envelope.has_seen(&peer) {
                continue;
            }
            let Some(channel) = self.registry.get(&peer).await else {
                continue;
            };
            if self.push_one(&channel, envelope, now).await {
                pushed += 1;
            }
        }
        pushed
    }

    async fn push_one(&self, channel: &Channel, envelope: &GossipEnvelope, now: u64) -> bool {
        let frame = match GossipFrame::Envelope(envelope.clone()).to_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(id = %envelope.message_id, %e, "Unserializable envelope skipped");
                return false;
            }
        };
        if channel.send_gossip(frame).await.is_err() {
            return false;
        }
        if let Err(e) = self
            .spool
            .mark_pushed(&envelope.message_id, channel.peer_id(), now)
        {
            debug!(id = %envelope.message_id, %e, "Push bookkeeping failed");
        }
        true
    }

    async fn send_ack(&self, to: PeerId, message_id: MessageId, now: u64) {
        let ack = GossipFrame::Ack(GossipAck {
            message_id,
            acked_by: self.local,
            issued_at: now,
        });
        let Ok(frame) = ack.to_bytes() else { return };
        if let Some(channel) = self.registry.get(&to).await {
            let _ = channel.send_gossip(frame).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_proto::{NodeKeypair, Tier};
    use passage_store::StoreDb;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn manager_with_spool(local: PeerId) -> (Arc<GossipManager>, mpsc::Receiver<GossipEnvelope>, Arc<ChannelRegistry>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = StoreDb::open(dir.path()).unwrap();
        let spool = GossipSpool::open(&db).unwrap();
        let registry = Arc::new(ChannelRegistry::new());
        let (manager, delivered_rx) =
            GossipManager::new(local, registry.clone(), spool, &NetConfig::default());
        (Arc::new(manager), delivered_rx, registry, dir)
    }

    fn peer() -> PeerId {
        NodeKeypair::generate().peer_id()
    }

    /// Registers a channel pair and returns the far end.
    async fn connect(registry: &ChannelRegistry, local: PeerId, remote: PeerId) -> Channel {
        let (ours, theirs) = Channel::pair(local, remote, Tier::DirectIpv4);
        registry.register(Arc::new(ours)).await;
        theirs
    }

    async fn recv_frame(channel: &Channel) -> GossipFrame {
        let bytes = timeout(Duration::from_secs(2), channel.recv_gossip())
            .await
            .unwrap()
            .unwrap();
        GossipFrame::from_bytes(&bytes).unwrap()
    }

    #[tokio::test]
    async fn enqueue_without_peers_keeps_the_copy() {
        let local = peer();
        let (manager, _rx, _registry, _dir) = manager_with_spool(local);
        let envelope = GossipEnvelope::new(local, peer(), b"hold this".to_vec(), 100).unwrap();

        let err = manager.enqueue(&envelope, 100).await.unwrap_err();
        assert!(matches!(err, NetError::NoGossipPeers));
        assert_eq!(err.class(), ErrorClass::ResourceExhausted);
        assert_eq!(manager.spooled(), 1);
    }

    #[tokio::test]
    async fn enqueue_pushes_to_fanout_peers_skipping_seen() {
        let local = peer();
        let (manager, _rx, registry, _dir) = manager_with_spool(local);

        let seen_peer = peer();
        let clean: Vec<PeerId> = (0..3).map(|_| peer()).collect();
        let seen_end = connect(&registry, local, seen_peer).await;
        let mut clean_ends = Vec::new();
        for p in &clean {
            clean_ends.push(connect(&registry, local, *p).await);
        }

        let mut envelope = GossipEnvelope::new(local, peer(), b"fan out".to_vec(), 100).unwrap();
        envelope.seen_by.insert(seen_peer);

        manager.enqueue(&envelope, 100).await.unwrap();

        for end in &clean_ends {
            let frame = recv_frame(end).await;
            assert!(matches!(frame, GossipFrame::Envelope(e) if e.message_id == envelope.message_id));
        }
        assert!(
            timeout(Duration::from_millis(100), seen_end.recv_gossip())
                .await
                .is_err(),
            "peer in seen_by must not be pushed to"
        );
    }

    #[tokio::test]
    async fn delivery_acks_and_surfaces_the_envelope() {
        let local = peer();
        let sender = peer();
        let (manager, mut delivered_rx, registry, _dir) = manager_with_spool(local);
        let sender_end = connect(&registry, local, sender).await;

        let envelope = GossipEnvelope::new(sender, local, b"for you".to_vec(), 100).unwrap();
        let frame = GossipFrame::Envelope(envelope.clone()).to_bytes().unwrap();

        let disposition = manager.handle_frame(sender, &frame, 100).await.unwrap();
        assert_eq!(disposition, GossipDisposition::Delivered);

        let surfaced = delivered_rx.recv().await.unwrap();
        assert_eq!(surfaced.payload, b"for you".to_vec());

        match recv_frame(&sender_end).await {
            GossipFrame::Ack(ack) => {
                assert_eq!(ack.message_id, envelope.message_id);
                assert_eq!(ack.acked_by, local);
            }
            other => panic!("expected an ack, got {:?}", other),
        }

        // A replay of the same envelope is refused with another ack.
        let disposition = manager.handle_frame(sender, &frame, 110).await.unwrap();
        assert_eq!(disposition, GossipDisposition::Duplicate);
    }

    #[tokio::test]
    async fn forwarding_spends_a_hop_and_records_us() {
        let local = peer();
        let sender = peer();
        let next = peer();
        let (manager, _rx, registry, _dir) = manager_with_spool(local);
        let _sender_end = connect(&registry, local, sender).await;
        let next_end = connect(&registry, local, next).await;

        let envelope = GossipEnvelope::new(sender, peer(), b"pass it on".to_vec(), 100).unwrap();
        let ttl_before = envelope.ttl_hops;
        let frame = GossipFrame::Envelope(envelope.clone()).to_bytes().unwrap();

        let disposition = manager.handle_frame(sender, &frame, 100).await.unwrap();
        assert_eq!(disposition, GossipDisposition::Forwarded(1));

        match recv_frame(&next_end).await {
            GossipFrame::Envelope(forwarded) => {
                assert_eq!(forwarded.ttl_hops, ttl_before - 1);
                assert!(forwarded.has_seen(&local));
            }
            other => panic!("expected the envelope, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn exhausted_and_expired_envelopes_are_dropped() {
        let local = peer();
        let sender = peer();
        let (manager, _rx, registry, _dir) = manager_with_spool(local);
        let next_end = connect(&registry, local, peer()).await;
        let _sender_end = connect(&registry, local, sender).await;

        let mut spent = GossipEnvelope::new(sender, peer(), b"out of hops".to_vec(), 100).unwrap();
        spent.ttl_hops = 0;
        let frame = GossipFrame::Envelope(spent.clone()).to_bytes().unwrap();
        let disposition = manager.handle_frame(sender, &frame, 100).await.unwrap();
        assert_eq!(disposition, GossipDisposition::Expired);
        assert!(!manager.spool.contains(&spent.message_id).unwrap());

        let old = GossipEnvelope::new(sender, peer(), b"too old".to_vec(), 100).unwrap();
        let frame = GossipFrame::Envelope(old.clone()).to_bytes().unwrap();
        let far_future = 100 + 60 * 60 * 24 * 30;
        let disposition = manager
            .handle_frame(sender, &frame, far_future)
            .await
            .unwrap();
        assert_eq!(disposition, GossipDisposition::Expired);

        assert!(
            timeout(Duration::from_millis(100), next_end.recv_gossip())
                .await
                .is_err(),
            "dropped envelopes must not be forwarded"
        );
    }

    #[tokio::test]
    async fn inbound_ack_clears_the_spooled_copy() {
        let local = peer();
        let holder = peer();
        let (manager, _rx, registry, _dir) = manager_with_spool(local);
        let _holder_end = connect(&registry, local, holder).await;

        let envelope = GossipEnvelope::new(local, peer(), b"spooled".to_vec(), 100).unwrap();
        manager.spool.insert(&envelope, 100).unwrap();

        let ack = GossipFrame::Ack(GossipAck {
            message_id: envelope.message_id,
            acked_by: holder,
            issued_at: 120,
        })
        .to_bytes()
        .unwrap();
        let disposition = manager.handle_frame(holder, &ack, 120).await.unwrap();
        assert_eq!(disposition, GossipDisposition::AckHandled);
        assert!(!manager.spool.contains(&envelope.message_id).unwrap());
        assert!(manager.spool.was_acked(&envelope.message_id).unwrap());
    }

    #[tokio::test]
    async fn promoted_peer_receives_spooled_offers() {
        let local = peer();
        let destination = peer();
        let (manager, _rx, registry, _dir) = manager_with_spool(local);

        let envelope =
            GossipEnvelope::new(local, destination, b"waiting for you".to_vec(), 100).unwrap();
        manager.spool.insert(&envelope, 100).unwrap();

        let destination_end = connect(&registry, local, destination).await;
        let sent = manager.on_peer_connected(destination, 150).await;
        assert_eq!(sent, 1);

        match recv_frame(&destination_end).await {
            GossipFrame::Envelope(offered) => assert_eq!(offered.message_id, envelope.message_id),
            other => panic!("expected the envelope, got {:?}", other),
        }

        // Destination offers repeat until the ack lands, so a lost
        // first copy is retried on the next connect.
        assert_eq!(manager.on_peer_connected(destination, 155).await, 1);

        let ack = GossipFrame::Ack(GossipAck {
            message_id: envelope.message_id,
            acked_by: destination,
            issued_at: 160,
        })
        .to_bytes()
        .unwrap();
        manager.handle_frame(destination, &ack, 160).await.unwrap();
        assert_eq!(manager.on_peer_connected(destination, 165).await, 0);
    }

    #[tokio::test]
    async fn malformed_frame_is_a_protocol_violation() {
        let local = peer();
        let (manager, _rx, _registry, _dir) = manager_with_spool(local);
        let err = manager
            .handle_frame(peer(), b"not a frame", 100)
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::ProtocolViolation);
    }
}
