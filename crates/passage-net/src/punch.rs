//! Hole-punch tier: UDP probes fired from both sides at an agreed
//! instant, coordinated by a rendezvous ticket.
//!
//! The initiator writes a [`RendezvousTicket`] naming its reflexive
//! address and a punch time, and delivers it over signaling when a
//! service is configured, otherwise through the DHT under the
//! responder's punch key. Both sides then burst probes carrying the
//! ticket nonce; the first probe to cross in either direction proves
//! the mapping, and the mutual hello upgrades it to a channel. Probes
//! open paths but never identities, so an unanswered or forged probe
//! yields nothing.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use passage_dht::DhtNode;
use passage_proto::wire::{parse_probe, probe_bytes, punch_key, ProbeKind};
use passage_proto::{unix_now_millis, NodeKeypair, PeerId, RendezvousTicket, Tier};

use crate::authorize::{Authorizer, Decision, ACTION_CONNECTION};
use crate::config::NetConfig;
use crate::error::{NetError, Result};
use crate::handshake::exchange_hello_datagram;
use crate::negotiated::Signaling;
use crate::transport::{channel_from_udp, BoxFuture, Channel, ChannelRegistry, DialTarget, TierDialer};

/// Probes sent per burst.
const PUNCH_BURST: usize = 3;

/// Milliseconds between probe bursts.
const PUNCH_RETRY_MS: u64 = 200;

/// Milliseconds of lead time written into a fresh ticket, enough for a
/// live signaling hop to deliver it before the agreed instant.
const PUNCH_LEAD_MS: u64 = 500;

/// How long a ticket stays actionable past its punch time.
const TICKET_STALE_MS: u64 = 30_000;

/// Dialer for [`Tier::HolePunch`].
pub struct PunchDialer {
    keypair: Arc<NodeKeypair>,
    signaling: Option<Arc<dyn Signaling>>,
    dht: Option<Arc<DhtNode>>,
    bind_ip: IpAddr,
    punch_deadline: Duration,
}

impl PunchDialer {
    /// New dialer. Ticket delivery prefers `signaling` and falls back
    /// to `dht`; with neither configured the tier is never applicable.
    pub fn new(
        keypair: Arc<NodeKeypair>,
        signaling: Option<Arc<dyn Signaling>>,
        dht: Option<Arc<DhtNode>>,
        config: &NetConfig,
    ) -> Self {
        PunchDialer {
            keypair,
            signaling,
            dht,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            punch_deadline: config.punch_timeout,
        }
    }

    /// Binds punch sockets to `ip` instead of the wildcard.
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    async fn deliver(&self, ticket: &RendezvousTicket) -> Result<()> {
        if let Some(signaling) = &self.signaling {
            match signaling.deliver_ticket(ticket.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(%e, "Signaling ticket delivery failed, trying the DHT"),
            }
        }
        let dht = self
            .dht
            .as_ref()
            .ok_or(NetError::TierSkipped(Tier::HolePunch))?;
        let stored = dht
            .put_value(punch_key(&ticket.responder), ticket.to_bytes()?)
            .await?;
        debug!(responder = %ticket.responder, stored, "Ticket stored in the DHT");
        Ok(())
    }
}

impl TierDialer for PunchDialer {
    fn tier(&self) -> Tier {
        Tier::HolePunch
    }

    fn applicable(&self, target: &DialTarget) -> bool {
        if self.signaling.is_none() && self.dht.is_none() {
            return false;
        }
        if !target.local_nat.is_punchable() || target.local_reflexive.is_none() {
            return false;
        }
        let Some(announcement) = &target.announcement else {
            return false;
        };
        let Some(punch) = &announcement.punch else {
            return false;
        };
        punch.nat.is_punchable() && announcement.ipv4_external.is_some()
    }

    fn dial(&self, target: DialTarget) -> BoxFuture<'_, Result<Channel>> {
        Box::pin(async move {
            let announcement = target
                .announcement
                .as_ref()
                .ok_or_else(|| NetError::NatIncompatible("no announcement for punch".into()))?;
            let punch = announcement
                .punch
                .as_ref()
                .ok_or_else(|| NetError::NatIncompatible("peer advertises no punch port".into()))?;
            let external = announcement.ipv4_external.ok_or_else(|| {
                NetError::NatIncompatible("peer's external address unknown".into())
            })?;
            let reflexive = target.local_reflexive.ok_or_else(|| {
                NetError::NatIncompatible("our reflexive address unknown".into())
            })?;
            let peer_addr = SocketAddr::new(IpAddr::V4(*external.ip()), punch.port);

            let socket = UdpSocket::bind((self.bind_ip, 0)).await?;
            // The reflexive observation names another socket's mapping,
            // so only the address part is reused; the port is ours.
            let initiator_addr = SocketAddr::new(reflexive.ip(), socket.local_addr()?.port());

            let ticket = RendezvousTicket::new(
                self.keypair.peer_id(),
                target.peer_id,
                initiator_addr,
                unix_now_millis() + PUNCH_LEAD_MS,
            );
            self.deliver(&ticket).await?;
            debug!(peer = %target.peer_id, punch_at = ticket.punch_at, "Ticket delivered");

            wait_for(ticket.punch_at).await;
            let proven =
                punch_probes(&socket, peer_addr, &ticket.nonce, self.punch_deadline).await?;
            socket.connect(proven).await?;
            let verified =
                exchange_hello_datagram(&socket, &self.keypair, Some(&target.peer_id)).await?;
            debug!(peer = %verified, addr = %proven, "Punched path established");
            Ok(channel_from_udp(socket, verified, Tier::HolePunch))
        })
    }
}

/// Answers a rendezvous ticket from the responder's side.
///
/// Mirrors the initiator's probe schedule at `ticket.initiator_addr`
/// from the given socket, then runs the hello pinned to the initiator.
pub async fn answer_ticket(
    ticket: &RendezvousTicket,
    keypair: Arc<NodeKeypair>,
    socket: UdpSocket,
    deadline: Duration,
) -> Result<Channel> {
    wait_for(ticket.punch_at).await;
    let proven = punch_probes(&socket, ticket.initiator_addr, &ticket.nonce, deadline).await?;
    socket.connect(proven).await?;
    let verified = exchange_hello_datagram(&socket, &keypair, Some(&ticket.initiator)).await?;
    debug!(peer = %verified, addr = %proven, "Answered punch established");
    Ok(channel_from_udp(socket, verified, Tier::HolePunch))
}

/// Polls the DHT for tickets addressed to this node and answers them.
///
/// One rendezvous runs at a time; the advertised port is rebound
/// between sessions so consecutive initiators always find the same
/// port, at the cost of serializing concurrent punches.
pub struct PunchListener {
    keypair: Arc<NodeKeypair>,
    dht: Arc<DhtNode>,
    authorizer: Arc<dyn Authorizer>,
    bind_ip: IpAddr,
    port: u16,
    poll_interval: Duration,
    punch_deadline: Duration,
}

impl PunchListener {
    /// Binds the punch port and returns the listener.
    ///
    /// `port` 0 picks an ephemeral port; [`local_port`](Self::local_port)
    /// reports the resolved one for the node's announcement.
    pub async fn bind(
        keypair: Arc<NodeKeypair>,
        dht: Arc<DhtNode>,
        authorizer: Arc<dyn Authorizer>,
        bind_ip: IpAddr,
        port: u16,
        config: &NetConfig,
    ) -> Result<Self> {
        // Bind once up front so a taken port fails at startup, then
        // release; run() rebinds per session.
        let probe = UdpSocket::bind((bind_ip, port)).await?;
        let resolved = probe.local_addr()?.port();
        drop(probe);
        Ok(PunchListener {
            keypair,
            dht,
            authorizer,
            bind_ip,
            port: resolved,
            poll_interval: Duration::from_secs(2),
            punch_deadline: config.punch_timeout,
        })
    }

    /// Port the listener answers on, for the node's punch advert.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Runs the poll loop until the promoted channel receiver closes.
    pub async fn run(self, registry: Arc<ChannelRegistry>, promoted_tx: mpsc::Sender<Arc<Channel>>) {
        let our_key = punch_key(&self.keypair.peer_id());
        let mut handled: HashSet<[u8; 16]> = HashSet::new();

        loop {
            if promoted_tx.is_closed() {
                return;
            }
            sleep(self.poll_interval).await;

            let bytes = match self.dht.get_value(our_key).await {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            let ticket = match RendezvousTicket::from_bytes(&bytes) {
                Ok(ticket) => ticket,
                Err(e) => {
                    warn!(%e, "Discarding malformed punch ticket");
                    continue;
                }
            };
            if !ticket_actionable(&ticket, &self.keypair.peer_id(), unix_now_millis(), &handled) {
                continue;
            }
            if let Decision::Deny { reason } = self
                .authorizer
                .authorize(&ticket.initiator, ACTION_CONNECTION)
                .await
            {
                info!(peer = %ticket.initiator, %reason, "Refusing punch ticket");
                handled.insert(ticket.nonce);
                continue;
            }
            handled.insert(ticket.nonce);

            let socket = match UdpSocket::bind((self.bind_ip, self.port)).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(%e, port = self.port, "Punch port rebind failed");
                    continue;
                }
            };
            match answer_ticket(&ticket, self.keypair.clone(), socket, self.punch_deadline).await {
                Ok(channel) => {
                    let channel = Arc::new(channel);
                    registry.register(channel.clone()).await;
                    let _ = promoted_tx.send(channel).await;
                }
                Err(e) => {
                    debug!(peer = %ticket.initiator, %e, "Punch session failed");
                }
            }
        }
    }
}

/// Whether a polled ticket is worth acting on.
fn ticket_actionable(
    ticket: &RendezvousTicket,
    local: &PeerId,
    now_millis: u64,
    handled: &HashSet<[u8; 16]>,
) -> bool {
    ticket.responder == *local
        && !handled.contains(&ticket.nonce)
        && ticket.punch_at.saturating_add(TICKET_STALE_MS) > now_millis
}

/// Sleeps until the agreed punch instant; a past instant fires now.
async fn wait_for(punch_at: u64) {
    let now = unix_now_millis();
    if punch_at > now {
        sleep(Duration::from_millis(punch_at - now)).await;
    }
}

/// Bursts punch probes at `peer` until one crosses in either direction.
async fn punch_probes(
    socket: &UdpSocket,
    peer: SocketAddr,
    nonce: &[u8; 16],
    deadline: Duration,
) -> Result<SocketAddr> {
    let punch = probe_bytes(ProbeKind::Punch, nonce);
    let ack = probe_bytes(ProbeKind::PunchAck, nonce);

    let mut buf = [0u8; 64];
    let mut bursts = tokio::time::interval(Duration::from_millis(PUNCH_RETRY_MS));
    let expired = sleep(deadline);
    tokio::pin!(expired);

    loop {
        tokio::select! {
            _ = bursts.tick() => {
                for _ in 0..PUNCH_BURST {
                    let _ = socket.send_to(&punch, peer).await;
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (n, src) = received?;
                match parse_probe(&buf[..n]) {
                    Some((ProbeKind::PunchAck, t)) if t == *nonce => return Ok(src),
                    Some((ProbeKind::Punch, t)) if t == *nonce => {
                        let _ = socket.send_to(&ack, src).await;
                        return Ok(src);
                    }
                    Some(_) => {}
                    None => return Ok(src),
                }
            }
            _ = &mut expired => return Err(NetError::Timeout),
        }
    }
}
