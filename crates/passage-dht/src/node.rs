//! The DHT node: one UDP socket, a routing table, a bounded record
//! store, and the iterative lookup driver on top of them.
//!
//! A node answers five requests: `ping`, `find_node`, `find_value`,
//! `store`, and `observe`. Stored values are peer announcements keyed
//! by the announcing peer's id; anything else is refused. The routing
//! table refreshes itself from inbound traffic, so merely being asked
//! questions keeps a node's view of the network current.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use passage_proto::endpoint::{NatKind, PeerAnnouncement};
use passage_proto::rpc::{RpcRequest, RpcResponse};
use passage_proto::{unix_now, PeerId};

use crate::config::DhtConfig;
use crate::contact::Contact;
use crate::distance::random_id_in_bucket;
use crate::error::{DhtError, Result};
use crate::limiter::{RateLimitConfig, RateLimitDecision, RpcRateLimiter};
use crate::lookup::Lookup;
use crate::routing::{RoutingTable, RoutingTableStats};
use crate::rpc::{InboundRpc, RpcSocket, RpcSocketStatsSnapshot};

/// Observers asked per reflexive-address measurement.
const OBSERVE_SAMPLE: usize = 3;

/// Buckets refreshed per maintenance pass.
const REFRESH_BUCKETS_PER_PASS: usize = 4;

/// A value held in the local record store.
#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    stored_at: u64,
}

/// Cached result of a reflexive-address measurement.
#[derive(Debug, Clone, Copy)]
struct ObservedSnapshot {
    addr: SocketAddr,
    nat: NatKind,
    taken_at: Instant,
}

#[derive(Debug, Default)]
struct NodeCounters {
    lookups_started: AtomicU64,
    lookups_completed: AtomicU64,
    lookups_timed_out: AtomicU64,
    values_served: AtomicU64,
    stores_accepted: AtomicU64,
    stores_rejected: AtomicU64,
    observes_answered: AtomicU64,
    rate_limited: AtomicU64,
}

/// Point-in-time view of node activity.
#[derive(Debug, Clone, Copy)]
pub struct DhtStatsSnapshot {
    /// Routing table occupancy.
    pub routing: RoutingTableStats,
    /// Values in the local record store.
    pub records: usize,
    /// Socket traffic counters.
    pub rpc: RpcSocketStatsSnapshot,
    /// Iterative lookups begun.
    pub lookups_started: u64,
    /// Lookups that ran to convergence.
    pub lookups_completed: u64,
    /// Lookups cut short by the deadline.
    pub lookups_timed_out: u64,
    /// `find_value` requests answered from the local store.
    pub values_served: u64,
    /// Store requests accepted.
    pub stores_accepted: u64,
    /// Store requests refused.
    pub stores_rejected: u64,
    /// Observe requests answered.
    pub observes_answered: u64,
    /// Inbound requests dropped by the rate limiter.
    pub rate_limited: u64,
}

enum DriveResult {
    Value(Vec<u8>),
    Nodes(Vec<Contact>),
    ValueMissing,
}

/// A running DHT participant.
///
/// Construct with [`DhtNode::bind`], then call [`DhtNode::start`] to
/// drive the socket before issuing lookups; requests cannot complete
/// until the receive loop is running.
pub struct DhtNode {
    local_id: PeerId,
    config: DhtConfig,
    socket: Arc<RpcSocket>,
    routing: RwLock<RoutingTable>,
    records: RwLock<HashMap<PeerId, StoredValue>>,
    limiter: Mutex<RpcRateLimiter>,
    observed: Mutex<Option<ObservedSnapshot>>,
    counters: NodeCounters,
}

impl DhtNode {
    /// Binds the RPC socket and assembles an idle node.
    pub async fn bind(local_id: PeerId, config: DhtConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let socket = RpcSocket::bind(
            config.bind_addr,
            local_id,
            config.rpc_timeout,
            config.rpc_retries,
        )
        .await?;
        info!(peer_id = %local_id, addr = %socket.local_addr()?, "dht node bound");
        Ok(Arc::new(Self {
            local_id,
            socket,
            routing: RwLock::new(RoutingTable::new(local_id, config.k)),
            records: RwLock::new(HashMap::new()),
            limiter: Mutex::new(RpcRateLimiter::new(RateLimitConfig::default())),
            observed: Mutex::new(None),
            config,
            counters: NodeCounters::default(),
        }))
    }

    /// This node's id.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns the run loop. Abort the handle to shut the node down.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = node.run().await {
                warn!(%err, "dht run loop exited");
            }
        })
    }

    /// Serves inbound requests and runs periodic maintenance.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                inbound = self.socket.recv() => {
                    let inbound = inbound?;
                    if let Err(err) = self.handle_inbound(inbound).await {
                        debug!(%err, "rpc dispatch failed");
                    }
                }
                _ = maintenance.tick() => {
                    self.run_maintenance().await;
                }
            }
        }
    }

    // === Inbound dispatch ===

    async fn handle_inbound(&self, inbound: InboundRpc) -> Result<()> {
        match self.limiter.lock().await.check(inbound.from.ip()) {
            RateLimitDecision::Allowed => {}
            RateLimitDecision::Limited | RateLimitDecision::Banned => {
                self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                trace!(from = %inbound.from, "request dropped by rate limiter");
                return Ok(());
            }
        }

        // Traffic refreshes the table: every well-formed request is
        // evidence the sender is alive at that address.
        self.insert_contact(inbound.sender, inbound.from).await;

        let response = match inbound.request {
            RpcRequest::Ping => RpcResponse::Pong,
            RpcRequest::FindNode { target } => self.answer_find_node(&target, &inbound.sender).await,
            RpcRequest::FindValue { key } => self.answer_find_value(&key, &inbound.sender).await,
            RpcRequest::Store { key, value } => self.answer_store(key, value).await,
            RpcRequest::Observe => {
                self.counters.observes_answered.fetch_add(1, Ordering::Relaxed);
                RpcResponse::Observed { addr: inbound.from }
            }
        };
        self.socket
            .respond(inbound.from, inbound.rpc_id, response)
            .await
    }

    async fn answer_find_node(&self, target: &PeerId, requester: &PeerId) -> RpcResponse {
        let contacts = self
            .routing
            .read()
            .await
            .closest(target, self.config.k)
            .iter()
            .filter(|c| c.peer_id != *requester)
            .map(Contact::to_wire)
            .collect();
        RpcResponse::Nodes { contacts }
    }

    async fn answer_find_value(&self, key: &PeerId, requester: &PeerId) -> RpcResponse {
        let now = unix_now();
        let hit = {
            let records = self.records.read().await;
            records
                .get(key)
                .filter(|stored| !self.is_record_expired(stored, now))
                .map(|stored| stored.value.clone())
        };
        match hit {
            Some(value) => {
                self.counters.values_served.fetch_add(1, Ordering::Relaxed);
                RpcResponse::Value { value }
            }
            None => self.answer_find_node(key, requester).await,
        }
    }

    async fn answer_store(&self, key: PeerId, value: Vec<u8>) -> RpcResponse {
        let reason = match PeerAnnouncement::from_value_bytes(&value) {
            Ok(announcement) => {
                if announcement.peer_id != key {
                    Some("announcement key mismatch".to_string())
                } else if let Err(err) = announcement.validate() {
                    Some(err.to_string())
                } else {
                    None
                }
            }
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = reason {
            self.counters.stores_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, %reason, "store refused");
            return RpcResponse::Denied { reason };
        }
        self.store_local(key, value).await;
        self.counters.stores_accepted.fetch_add(1, Ordering::Relaxed);
        RpcResponse::Stored
    }

    // === Outbound operations ===

    /// Probes `addr` and, on a pong, admits the responder to the table.
    pub async fn ping(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId> {
        let (sender, response) = self.socket.request(addr, RpcRequest::Ping).await?;
        match response {
            RpcResponse::Pong => {
                self.insert_contact(sender, addr).await;
                Ok(sender)
            }
            other => Err(DhtError::LookupFailed(format!(
                "ping answered with {other:?}"
            ))),
        }
    }

    /// Joins the network through the configured seeds.
    ///
    /// Seeds are probed concurrently; one answer is enough. A follow-up
    /// lookup for our own id then fills the nearby buckets. With no
    /// seeds configured this is a no-op, which is how the first node of
    /// a fresh network starts.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<usize> {
        if self.config.bootstrap.is_empty() {
            info!("no bootstrap seeds configured, starting alone");
            return Ok(0);
        }
        let mut probes = JoinSet::new();
        for addr in self.config.bootstrap.clone() {
            let node = Arc::clone(self);
            probes.spawn(async move { node.ping(addr).await });
        }
        let mut reached = 0usize;
        while let Some(joined) = probes.join_next().await {
            if matches!(joined, Ok(Ok(_))) {
                reached += 1;
            }
        }
        if reached == 0 {
            return Err(DhtError::NoSeedsResponded);
        }
        if let Err(err) = self.find_node(self.local_id).await {
            debug!(%err, "self-lookup after bootstrap failed");
        }
        info!(reached, "bootstrap complete");
        Ok(reached)
    }

    /// Iterative node lookup: the `k` closest contacts to `target`.
    ///
    /// Fails fast with [`DhtError::EmptyRoutingTable`] when there is
    /// nobody to ask.
    pub async fn find_node(self: &Arc<Self>, target: PeerId) -> Result<Vec<Contact>> {
        match self.iterative(target, false).await? {
            DriveResult::Nodes(contacts) => Ok(contacts),
            DriveResult::Value(_) | DriveResult::ValueMissing => Err(DhtError::LookupFailed(
                "node lookup yielded no contact set".into(),
            )),
        }
    }

    /// Fetches the raw value stored under `key`.
    pub async fn get_value(self: &Arc<Self>, key: PeerId) -> Result<Vec<u8>> {
        let now = unix_now();
        let local = {
            let records = self.records.read().await;
            records
                .get(&key)
                .filter(|stored| !self.is_record_expired(stored, now))
                .map(|stored| stored.value.clone())
        };
        if let Some(value) = local {
            return Ok(value);
        }
        match self.iterative(key, true).await? {
            DriveResult::Value(value) => Ok(value),
            DriveResult::Nodes(_) | DriveResult::ValueMissing => Err(DhtError::NotFound),
        }
    }

    /// Looks up a peer's announcement and validates it belongs to them.
    pub async fn find_peer(self: &Arc<Self>, peer_id: PeerId) -> Result<PeerAnnouncement> {
        let value = self.get_value(peer_id).await?;
        let announcement = PeerAnnouncement::from_value_bytes(&value)?;
        if announcement.peer_id != peer_id {
            return Err(DhtError::LookupFailed(
                "announcement names a different peer".into(),
            ));
        }
        announcement.validate()?;
        Ok(announcement)
    }

    /// Stores `value` under `key` at the `k` closest live nodes.
    ///
    /// Returns how many nodes acknowledged. The local copy is written
    /// unconditionally so our own records resolve even when isolated.
    pub async fn put_value(self: &Arc<Self>, key: PeerId, value: Vec<u8>) -> Result<usize> {
        self.store_local(key, value.clone()).await;
        let targets = self.find_node(key).await?;
        let mut stores = JoinSet::new();
        for contact in targets {
            let node = Arc::clone(self);
            let value = value.clone();
            stores.spawn(async move {
                node.socket
                    .request(contact.addr, RpcRequest::Store { key, value })
                    .await
            });
        }
        let mut acked = 0usize;
        while let Some(joined) = stores.join_next().await {
            match joined {
                Ok(Ok((_, RpcResponse::Stored))) => acked += 1,
                Ok(Ok((sender, RpcResponse::Denied { reason }))) => {
                    debug!(%sender, %reason, "remote refused store");
                }
                _ => {}
            }
        }
        Ok(acked)
    }

    /// Publishes our announcement under our own id.
    pub async fn announce(self: &Arc<Self>, announcement: &PeerAnnouncement) -> Result<usize> {
        announcement.validate()?;
        let replicas = self
            .put_value(announcement.peer_id, announcement.to_value_bytes()?)
            .await?;
        info!(replicas, "announcement published");
        Ok(replicas)
    }

    /// Measures our reflexive address by asking a few peers where our
    /// datagrams come from, then classifies the NAT in front of us.
    ///
    /// Agreement between observers means a stable mapping (cone NAT, or
    /// none at all when the mapping equals the bound address). Distinct
    /// answers per observer mean a symmetric NAT. A single answer is
    /// inconclusive. Results are cached briefly.
    pub async fn observed_addr(self: &Arc<Self>) -> Result<(SocketAddr, NatKind)> {
        if let Some(snapshot) = *self.observed.lock().await {
            if snapshot.taken_at.elapsed() < self.config.observe_cache {
                return Ok((snapshot.addr, snapshot.nat));
            }
        }

        let observers: Vec<Contact> = {
            let routing = self.routing.read().await;
            let mut all = routing.all_contacts();
            all.shuffle(&mut rand::thread_rng());
            all.truncate(OBSERVE_SAMPLE);
            all
        };
        if observers.is_empty() {
            return Err(DhtError::EmptyRoutingTable);
        }

        let mut queries = JoinSet::new();
        for contact in observers {
            let node = Arc::clone(self);
            queries.spawn(async move { node.socket.request(contact.addr, RpcRequest::Observe).await });
        }
        let mut votes: Vec<SocketAddr> = Vec::new();
        while let Some(joined) = queries.join_next().await {
            if let Ok(Ok((_, RpcResponse::Observed { addr }))) = joined {
                votes.push(addr);
            }
        }
        if votes.is_empty() {
            return Err(DhtError::LookupFailed("no observer answered".into()));
        }

        let (addr, nat) = self.classify_votes(&votes)?;
        *self.observed.lock().await = Some(ObservedSnapshot {
            addr,
            nat,
            taken_at: Instant::now(),
        });
        info!(%addr, ?nat, observers = votes.len(), "reflexive address measured");
        Ok((addr, nat))
    }

    fn classify_votes(&self, votes: &[SocketAddr]) -> Result<(SocketAddr, NatKind)> {
        let mut counts: HashMap<SocketAddr, usize> = HashMap::new();
        for vote in votes {
            *counts.entry(*vote).or_insert(0) += 1;
        }
        let (winner, count) = counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(addr, count)| (*addr, *count))
            .ok_or_else(|| DhtError::LookupFailed("no observer answered".into()))?;

        let nat = if count >= 2 {
            if self.local_addr().map(|local| local == winner).unwrap_or(false) {
                NatKind::None
            } else {
                NatKind::Cone
            }
        } else if votes.len() >= 2 {
            // Two or more observers, no agreement: per-destination mappings.
            NatKind::Symmetric
        } else {
            NatKind::Unknown
        };
        Ok((winner, nat))
    }

    // === Iterative lookup driver ===

    async fn iterative(self: &Arc<Self>, target: PeerId, want_value: bool) -> Result<DriveResult> {
        let (k, alpha) = (self.config.k, self.config.alpha);
        let seeds = self.routing.read().await.closest(&target, k);
        if seeds.is_empty() {
            return Err(DhtError::EmptyRoutingTable);
        }
        self.counters.lookups_started.fetch_add(1, Ordering::Relaxed);

        let mut lookup = Lookup::new(self.local_id, target, k, alpha, seeds);
        let drive = async {
            while !lookup.is_complete() {
                let batch = lookup.next_batch();
                if batch.is_empty() {
                    break;
                }
                let mut queries = JoinSet::new();
                for contact in batch {
                    let node = Arc::clone(self);
                    queries.spawn(async move {
                        let request = if want_value {
                            RpcRequest::FindValue { key: target }
                        } else {
                            RpcRequest::FindNode { target }
                        };
                        (contact, node.socket.request(contact.addr, request).await)
                    });
                }
                while let Some(joined) = queries.join_next().await {
                    let (contact, result) = match joined {
                        Ok(pair) => pair,
                        Err(_) => continue,
                    };
                    match result {
                        Ok((sender, RpcResponse::Nodes { contacts })) => {
                            self.insert_contact(sender, contact.addr).await;
                            let now = unix_now();
                            let found = contacts.iter().map(|c| Contact::from_wire(c, now)).collect();
                            lookup.on_response(sender, found);
                        }
                        Ok((sender, RpcResponse::Value { value })) if want_value => {
                            self.insert_contact(sender, contact.addr).await;
                            return Some(value);
                        }
                        Ok(_) => lookup.on_failure(contact.peer_id),
                        Err(err) => {
                            trace!(peer = %contact.peer_id, %err, "lookup query failed");
                            self.routing
                                .write()
                                .await
                                .mark_failed(&contact.peer_id, unix_now());
                            lookup.on_failure(contact.peer_id);
                        }
                    }
                }
            }
            None
        };

        let timed = tokio::time::timeout(self.config.lookup_timeout, drive).await;
        match timed {
            Ok(Some(value)) => {
                self.counters.lookups_completed.fetch_add(1, Ordering::Relaxed);
                Ok(DriveResult::Value(value))
            }
            Ok(None) => {
                self.counters.lookups_completed.fetch_add(1, Ordering::Relaxed);
                if want_value {
                    Ok(DriveResult::ValueMissing)
                } else {
                    Ok(DriveResult::Nodes(lookup.closest()))
                }
            }
            Err(_) => {
                self.counters.lookups_timed_out.fetch_add(1, Ordering::Relaxed);
                if want_value {
                    Err(DhtError::Timeout)
                } else {
                    let partial = lookup.closest();
                    if partial.is_empty() {
                        Err(DhtError::Timeout)
                    } else {
                        debug!(target = %target, "lookup deadline hit, returning partial result");
                        Ok(DriveResult::Nodes(partial))
                    }
                }
            }
        }
    }

    // === Local state ===

    async fn insert_contact(&self, peer_id: PeerId, addr: SocketAddr) {
        if peer_id == self.local_id {
            return;
        }
        let contact = Contact::new(peer_id, addr, unix_now());
        match self.routing.write().await.insert(contact, unix_now()) {
            Ok(outcome) => trace!(peer = %peer_id, ?outcome, "routing insert"),
            Err(err) => debug!(peer = %peer_id, %err, "routing insert refused"),
        }
    }

    fn is_record_expired(&self, stored: &StoredValue, now: u64) -> bool {
        now >= stored.stored_at.saturating_add(self.config.record_ttl.as_secs())
    }

    async fn store_local(&self, key: PeerId, value: Vec<u8>) {
        let mut records = self.records.write().await;
        if records.len() >= self.config.max_records && !records.contains_key(&key) {
            // Full: the oldest record makes way.
            if let Some(oldest) = records
                .iter()
                .min_by_key(|(_, stored)| stored.stored_at)
                .map(|(key, _)| *key)
            {
                records.remove(&oldest);
            }
        }
        records.insert(
            key,
            StoredValue {
                value,
                stored_at: unix_now(),
            },
        );
    }

    /// Seeds the routing table from persisted contacts, typically at
    /// startup before bootstrap. Returns how many were admitted.
    pub async fn restore_contacts(&self, contacts: Vec<Contact>) -> usize {
        let now = unix_now();
        let mut routing = self.routing.write().await;
        let mut admitted = 0usize;
        for contact in contacts {
            if routing.insert(contact, now).is_ok() {
                admitted += 1;
            }
        }
        admitted
    }

    /// All live contacts, for persistence across restarts.
    pub async fn snapshot_contacts(&self) -> Vec<Contact> {
        self.routing.read().await.all_contacts()
    }

    /// Activity counters and table occupancy.
    pub async fn stats(&self) -> DhtStatsSnapshot {
        DhtStatsSnapshot {
            routing: self.routing.read().await.stats(),
            records: self.records.read().await.len(),
            rpc: self.socket.stats(),
            lookups_started: self.counters.lookups_started.load(Ordering::Relaxed),
            lookups_completed: self.counters.lookups_completed.load(Ordering::Relaxed),
            lookups_timed_out: self.counters.lookups_timed_out.load(Ordering::Relaxed),
            values_served: self.counters.values_served.load(Ordering::Relaxed),
            stores_accepted: self.counters.stores_accepted.load(Ordering::Relaxed),
            stores_rejected: self.counters.stores_rejected.load(Ordering::Relaxed),
            observes_answered: self.counters.observes_answered.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
        }
    }

    // === Maintenance ===

    async fn run_maintenance(self: &Arc<Self>) {
        let now = unix_now();
        {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|_, stored| !self.is_record_expired(stored, now));
            let swept = before - records.len();
            if swept > 0 {
                debug!(swept, "expired records dropped");
            }
        }
        self.limiter.lock().await.sweep();

        let stale_buckets = {
            let routing = self.routing.read().await;
            let mut buckets =
                routing.buckets_needing_refresh(now, self.config.refresh_interval.as_secs());
            buckets.truncate(REFRESH_BUCKETS_PER_PASS);
            buckets
        };
        for index in stale_buckets {
            self.routing.write().await.mark_refreshed(index, now);
            let node = Arc::clone(self);
            // Refresh lookups run detached; awaiting them here would
            // stall the receive loop they depend on.
            tokio::spawn(async move {
                let target = random_id_in_bucket(&node.local_id, index);
                if let Err(err) = node.find_node(target).await {
                    trace!(index, %err, "bucket refresh lookup failed");
                }
            });
        }
    }
}

impl std::fmt::Debug for DhtNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtNode")
            .field("local_id", &self.local_id)
            .field("bind_addr", &self.config.bind_addr)
            .finish()
    }
}

// ==== DHT Node Tests ====
