//! The connection orchestrator: one `connect` call walks a request
//! through resolution, the tier ladder, and the gossip fallback.
//!
//! Tier groups run in priority order. Within a group every applicable
//! tier races in a `JoinSet`; the first channel wins and its siblings
//! are aborted. A group with no applicable tier costs nothing. When the
//! ladder is exhausted the pending payload moves to the gossip spool,
//! so the request outcome is honest: a live channel, a queued copy, or
//! an error naming why neither was possible.

use std::collections::BTreeSet;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use passage_dht::DhtNode;
use passage_proto::{unix_now, GossipEnvelope, MessageId, PeerAnnouncement, PeerId, Tier};
use passage_store::PeerDirectory;

use crate::breaker::CircuitBreaker;
use crate::config::NetConfig;
use crate::error::{ErrorClass, NetError, Result};
use crate::events::{AttemptState, EventSender, RequestId};
use crate::gossip::GossipManager;
use crate::transport::{Channel, ChannelRegistry, DialTarget, RelayCandidate, TierDialer};

/// How a connect request ended.
#[derive(Debug)]
pub enum ConnectOutcome {
    /// A live channel, registered and ready for frames.
    Channel(Arc<Channel>),
    /// No live path; a payload that was pending is now spooled under
    /// the carried id.
    Queued(Option<MessageId>),
}

/// Emits `Cancelled` when a request future is dropped before reaching
/// an outcome.
struct CancelGuard {
    events: EventSender,
    request_id: RequestId,
    peer: PeerId,
    armed: bool,
}

impl CancelGuard {
    fn new(events: EventSender, request_id: RequestId, peer: PeerId) -> Self {
        Self {
            events,
            request_id,
            peer,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.events
                .emit(self.request_id, self.peer, None, AttemptState::Cancelled);
        }
    }
}

/// Single coordination point for outbound connectivity.
///
/// Holds the tier dialers, the per-`(peer, tier)` breakers, and the
/// seams into the directory, the DHT, and the gossip manager. All
/// methods take `&self`; concurrent requests share the breakers and
/// the channel registry.
pub struct Orchestrator {
    local: PeerId,
    config: NetConfig,
    directory: Arc<PeerDirectory>,
    registry: Arc<ChannelRegistry>,
    gossip: Arc<GossipManager>,
    dht: Option<Arc<DhtNode>>,
    dialers: Vec<Arc<dyn TierDialer>>,
    breaker: CircuitBreaker,
    events: EventSender,
    promoted_tx: mpsc::Sender<Arc<Channel>>,
}

impl Orchestrator {
    /// Builds an orchestrator with no dialers and no DHT; attach those
    /// with [`with_dialer`](Self::with_dialer) and
    /// [`with_dht`](Self::with_dht).
    pub fn new(
        local: PeerId,
        config: NetConfig,
        directory: Arc<PeerDirectory>,
        registry: Arc<ChannelRegistry>,
        gossip: Arc<GossipManager>,
        events: EventSender,
        promoted_tx: mpsc::Sender<Arc<Channel>>,
    ) -> Result<Self> {
        config.validate()?;
        let breaker = CircuitBreaker::new(&config);
        Ok(Self {
            local,
            config,
            directory,
            registry,
            gossip,
            dht: None,
            dialers: Vec::new(),
            breaker,
            events,
            promoted_tx,
        })
    }

    /// Attaches the DHT used for resolution.
    pub fn with_dht(mut self, dht: Arc<DhtNode>) -> Self {
        self.dht = Some(dht);
        self
    }

    /// Registers one tier dialer. Order does not matter; the tier
    /// ladder is fixed.
    pub fn with_dialer(mut self, dialer: Arc<dyn TierDialer>) -> Self {
        self.dialers.push(dialer);
        self
    }

    /// The registry holding every promoted channel.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Connects to a peer under the configured request deadline.
    pub async fn connect(&self, peer: PeerId) -> Result<ConnectOutcome> {
        self.request(peer, None, self.config.request_deadline).await
    }

    /// Connects under an explicit per-request deadline.
    pub async fn connect_with_deadline(
        &self,
        peer: PeerId,
        deadline: Duration,
    ) -> Result<ConnectOutcome> {
        self.request(peer, None, deadline).await
    }

    /// Delivers a payload over a live channel when one can be had, and
    /// spools it for gossip when it cannot.
    pub async fn send_or_queue(&self, peer: PeerId, payload: Vec<u8>) -> Result<ConnectOutcome> {
        self.request(peer, Some(payload), self.config.request_deadline)
            .await
    }

    async fn request(
        &self,
        peer: PeerId,
        payload: Option<Vec<u8>>,
        deadline: Duration,
    ) -> Result<ConnectOutcome> {
        let request_id = RequestId::next();
        let mut guard = CancelGuard::new(self.events.clone(), request_id, peer);

        if let Some(channel) = self.registry.get(&peer).await {
            if Self::try_send(&channel, &payload).await {
                self.events
                    .emit(request_id, peer, Some(channel.tier()), AttemptState::Connected);
                guard.disarm();
                return Ok(ConnectOutcome::Channel(channel));
            }
            debug!(%peer, "Cached channel died mid-send; dialing fresh");
        }

        let established = match timeout(deadline, self.establish(request_id, peer)).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                guard.disarm();
                return Err(e);
            }
            Err(_) => {
                debug!(%peer, %request_id, "Request deadline expired");
                None
            }
        };

        if let Some(channel) = established {
            if Self::try_send(&channel, &payload).await {
                guard.disarm();
                return Ok(ConnectOutcome::Channel(channel));
            }
            debug!(%peer, "Fresh channel died mid-send; queueing instead");
        }

        let queued = match payload {
            Some(bytes) => {
                let envelope = match GossipEnvelope::new(self.local, peer, bytes, unix_now()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        guard.disarm();
                        return Err(e.into());
                    }
                };
                match self.gossip.enqueue(&envelope, unix_now()).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        self.events
                            .emit(request_id, peer, None, AttemptState::Exhausted);
                        warn!(%peer, %e, "Request exhausted: gossip fallback failed");
                        guard.disarm();
                        return Err(e);
                    }
                }
            }
            None => None,
        };
        self.events.emit(request_id, peer, None, AttemptState::Queued);
        info!(%peer, queued = ?queued, "No live path; request queued");
        guard.disarm();
        Ok(ConnectOutcome::Queued(queued))
    }

    async fn establish(&self, request_id: RequestId, peer: PeerId) -> Result<Option<Arc<Channel>>> {
        let target = self.resolve(request_id, peer).await;
        self.attempt_tiers(request_id, &target).await
    }

    /// Gathers everything dialable about a peer: the directory cache
    /// first, then whatever the DHT returns within the resolution
    /// deadline. A miss on both still yields a target; the negotiated
    /// tier needs only live signaling.
    async fn resolve(&self, request_id: RequestId, peer: PeerId) -> DialTarget {
        self.events
            .emit(request_id, peer, None, AttemptState::Resolving);
        let now = unix_now();
        let mut target = DialTarget::new(peer);

        if let Some(record) = self.directory.get(&peer, now) {
            target.endpoints = record.endpoints.iter().copied().collect();
            target.tier_hint = record.last_successful_tier;
        }

        if let Some(dht) = &self.dht {
            match dht.observed_addr().await {
                Ok((addr, nat)) => {
                    target.local_reflexive = Some(addr);
                    target.local_nat = nat;
                }
                Err(e) => debug!(%e, "Own reflexive address unknown"),
            }
            if timeout(
                self.config.resolution_deadline,
                self.resolve_remote(dht, &mut target),
            )
            .await
            .is_err()
            {
                debug!(%peer, "Resolution deadline hit; dialing with what arrived");
            }
        }

        debug!(
            %peer,
            endpoints = target.endpoints.len(),
            relays = target.relay_candidates.len(),
            hint = ?target.tier_hint,
            "Resolution finished"
        );
        target
    }

    async fn resolve_remote(&self, dht: &Arc<DhtNode>, target: &mut DialTarget) {
        let now = unix_now();
        match dht.find_peer(target.peer_id).await {
            Ok(announcement) => {
                match self.directory.merge_announcement(&announcement, now) {
                    Ok(record) => {
                        target.endpoints = record.endpoints.iter().copied().collect();
                        if target.tier_hint.is_none() {
                            target.tier_hint = record.last_successful_tier;
                        }
                    }
                    Err(e) => warn!(peer = %target.peer_id, %e, "Announcement not cached"),
                }
                target.announcement = Some(announcement);
            }
            Err(e) => debug!(peer = %target.peer_id, %e, "DHT lookup came back empty"),
        }

        let mut relay_ids = BTreeSet::new();
        if let Some(announcement) = &target.announcement {
            relay_ids.extend(announcement.reachable_via.iter().copied());
        }
        for endpoint in &target.endpoints {
            if let Some(via) = endpoint.via {
                relay_ids.insert(via);
            }
        }
        relay_ids.remove(&self.local);

        let mut lookups = JoinSet::new();
        for relay_id in relay_ids {
            let dht = Arc::clone(dht);
            lookups.spawn(async move { dht.find_peer(relay_id).await });
        }
        while let Some(joined) = lookups.join_next().await {
            let Ok(Ok(announcement)) = joined else { continue };
            if let Some(candidate) = relay_candidate(&announcement) {
                target.relay_candidates.push(candidate);
            }
        }
    }

    /// Walks the tier groups, racing each group in one `JoinSet`.
    /// Returns the promoted channel, `None` when every group came up
    /// empty, or an error on a policy denial.
    async fn attempt_tiers(
        &self,
        request_id: RequestId,
        target: &DialTarget,
    ) -> Result<Option<Arc<Channel>>> {
        let peer = target.peer_id;
        for group in tier_groups(target.tier_hint) {
            let mut attempts: JoinSet<(Tier, Result<Channel>)> = JoinSet::new();
            for tier in group {
                let Some(dialer) = self.dialers.iter().find(|d| d.tier() == tier) else {
                    continue;
                };
                if !dialer.applicable(target) {
                    self.events
                        .emit(request_id, peer, Some(tier), AttemptState::TierSkipped);
                    debug!(%peer, ?tier, "Tier not applicable");
                    continue;
                }
                if !self.breaker.check(&peer, tier, Instant::now()) {
                    self.events
                        .emit(request_id, peer, Some(tier), AttemptState::TierSkipped);
                    debug!(%peer, ?tier, "Breaker open; tier suppressed");
                    continue;
                }

                self.events
                    .emit(request_id, peer, Some(tier), AttemptState::Attempting);
                let dialer = Arc::clone(dialer);
                let target = target.clone();
                let limit = self.config.tier_timeout(tier);
                attempts.spawn(async move {
                    let result = match timeout(limit, dialer.dial(target)).await {
                        Ok(result) => result,
                        Err(_) => Err(NetError::Timeout),
                    };
                    (tier, result)
                });
            }

            while let Some(joined) = attempts.join_next().await {
                let Ok((tier, result)) = joined else { continue };
                match result {
                    Ok(channel) => {
                        attempts.abort_all();
                        self.breaker.record_success(&peer, tier);
                        return Ok(Some(self.promote(request_id, channel).await));
                    }
                    Err(e) if e.class() == ErrorClass::PolicyDenied => {
                        attempts.abort_all();
                        self.events
                            .emit(request_id, peer, Some(tier), AttemptState::TierFailed);
                        warn!(%peer, ?tier, %e, "Connection denied by policy");
                        return Err(e);
                    }
                    Err(e @ (NetError::TierSkipped(_) | NetError::BreakerOpen(_))) => {
                        self.events
                            .emit(request_id, peer, Some(tier), AttemptState::TierSkipped);
                        debug!(%peer, ?tier, %e, "Tier skipped at dial time");
                    }
                    Err(e) => {
                        if e.class() == ErrorClass::ProtocolViolation {
                            match self.directory.mark_flagged(&peer) {
                                Ok(_) => warn!(%peer, ?tier, %e, "Peer flagged after protocol violation"),
                                Err(store_err) => warn!(%peer, %store_err, "Flagging failed"),
                            }
                        }
                        self.breaker.record_failure(&peer, tier, Instant::now());
                        self.events
                            .emit(request_id, peer, Some(tier), AttemptState::TierFailed);
                        debug!(%peer, ?tier, %e, "Tier attempt failed");
                    }
                }
            }
        }
        Ok(None)
    }

    /// Registers the winning channel, records the tier hint, and hands
    /// the channel to the gossip manager.
    async fn promote(&self, request_id: RequestId, channel: Channel) -> Arc<Channel> {
        let channel = Arc::new(channel);
        let peer = channel.peer_id();
        let tier = channel.tier();
        self.registry.register(Arc::clone(&channel)).await;
        if let Err(e) = self.directory.mark_connected(peer, tier, unix_now()) {
            warn!(%peer, %e, "Tier hint not recorded");
        }
        if self.promoted_tx.send(Arc::clone(&channel)).await.is_err() {
            debug!(%peer, "Gossip manager gone; promotion not announced");
        }
        self.events
            .emit(request_id, peer, Some(tier), AttemptState::Connected);
        info!(%peer, ?tier, "Channel promoted");
        channel
    }

    async fn try_send(channel: &Channel, payload: &Option<Vec<u8>>) -> bool {
        match payload {
            Some(bytes) => channel.send(bytes.clone()).await.is_ok(),
            None => true,
        }
    }
}

/// The tier ladder. A hint moves its whole group to the front; the
/// groups themselves never change shape.
fn tier_groups(hint: Option<Tier>) -> Vec<Vec<Tier>> {
    let mut groups = vec![
        vec![Tier::DirectIpv6, Tier::DirectIpv4],
        vec![Tier::Negotiated],
        vec![Tier::HolePunch],
        vec![Tier::Relay],
    ];
    if let Some(hint) = hint {
        if let Some(pos) = groups.iter().position(|g| g.contains(&hint)) {
            let preferred = groups.remove(pos);
            groups.insert(0, preferred);
        }
    }
    groups
}

/// Builds a dialable relay candidate out of a volunteer's announcement.
fn relay_candidate(announcement: &PeerAnnouncement) -> Option<RelayCandidate> {
    let advert = announcement.relay?;
    let addr = if let Some(v4) = announcement.ipv4_external.or(announcement.ipv4_local) {
        SocketAddr::V4(SocketAddrV4::new(*v4.ip(), advert.port))
    } else if let Some(v6) = announcement.ipv6 {
        SocketAddr::V6(SocketAddrV6::new(*v6.ip(), advert.port, 0, 0))
    } else {
        return None;
    };
    Some(RelayCandidate {
        peer_id: announcement.peer_id,
        addr,
        advert: Some(advert),
        rtt: None,
    })
}
