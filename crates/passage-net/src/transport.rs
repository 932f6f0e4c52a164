//! The channel abstraction every tier produces, the registry of
//! promoted channels, and the dialer trait the orchestrator drives.
//!
//! A channel carries two lanes over one socket: the application lane
//! the caller reads, and a gossip lane the store-and-forward manager
//! owns. Each frame starts with a one-byte lane tag; the pump tasks
//! split inbound frames by tag so the two consumers never contend.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use passage_proto::{
    unix_now, Endpoint, NatKind, PeerAnnouncement, PeerId, RelayAdvert, Tier,
};

use crate::error::{NetError, Result};

/// A boxed future that is Send.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Buffered frames per channel lane.
pub(crate) const CHANNEL_BUFFER: usize = 64;

/// Largest frame accepted on a stream-backed channel.
pub(crate) const MAX_STREAM_FRAME_SIZE: usize = 64 * 1024;

/// Largest datagram accepted on a datagram-backed channel.
pub(crate) const MAX_DATAGRAM_SIZE: usize = 32 * 1024;

/// Lane tag for application frames.
pub(crate) const LANE_APP: u8 = 0;

/// Lane tag for gossip frames.
pub(crate) const LANE_GOSSIP: u8 = 1;

// ============================================================================
// Framing
// ============================================================================

/// Writes one length-prefixed frame (u32 big-endian prefix).
pub(crate) async fn write_frame<W>(stream: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > MAX_STREAM_FRAME_SIZE {
        return Err(NetError::Wire(format!(
            "outbound frame of {} bytes exceeds cap",
            bytes.len()
        )));
    }
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame, rejecting oversized claims before
/// any allocation.
pub(crate) async fn read_frame<R>(stream: &mut R, max: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max {
        return Err(NetError::Wire(format!(
            "inbound frame claims {} bytes, cap is {}",
            len, max
        )));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

fn tag_frame(lane: u8, bytes: Vec<u8>) -> Vec<u8> {
    let mut framed = Vec::with_capacity(bytes.len() + 1);
    framed.push(lane);
    framed.extend_from_slice(&bytes);
    framed
}

// ============================================================================
// Channel
// ============================================================================

/// Inbound halves of a channel's two lanes.
struct LaneReceivers {
    app: Mutex<mpsc::Receiver<Vec<u8>>>,
    gossip: Mutex<mpsc::Receiver<Vec<u8>>>,
}

/// Sending halves handed to a channel's pump writer.
pub(crate) struct LaneSenders {
    pub(crate) app: mpsc::Sender<Vec<u8>>,
    pub(crate) gossip: mpsc::Sender<Vec<u8>>,
}

impl LaneSenders {
    /// Routes one inbound frame to its lane by tag. Unknown tags are
    /// dropped. Returns `false` once the target lane's consumer is gone.
    pub(crate) async fn route(&self, frame: Vec<u8>) -> bool {
        match frame.split_first() {
            Some((&LANE_APP, rest)) => self.app.send(rest.to_vec()).await.is_ok(),
            Some((&LANE_GOSSIP, rest)) => self.gossip.send(rest.to_vec()).await.is_ok(),
            _ => !self.app.is_closed() || !self.gossip.is_closed(),
        }
    }

    /// Resolves once the owning channel is dropped, so a pump parked on
    /// a silent socket still releases it.
    pub(crate) async fn closed(&self) {
        tokio::join!(self.app.closed(), self.gossip.closed());
    }
}

/// A promoted bidirectional channel to one peer.
///
/// Frames are whole messages. The application lane is read through
/// [`recv`](Self::recv); the gossip lane through
/// [`recv_gossip`](Self::recv_gossip), which only the gossip manager
/// drives. Dropping the channel closes the outbound side, which ends
/// the pumps and releases the socket.
pub struct Channel {
    peer_id: PeerId,
    tier: Tier,
    out: mpsc::Sender<Vec<u8>>,
    lanes: LaneReceivers,
    established_at: u64,
}

impl Channel {
    /// Assembles a channel around an outbound queue of tagged frames
    /// and the two inbound lanes. Returns the inbound senders for the
    /// pump that feeds them.
    pub(crate) fn with_pumps(
        peer_id: PeerId,
        tier: Tier,
        out: mpsc::Sender<Vec<u8>>,
    ) -> (Self, LaneSenders) {
        let (app_tx, app_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (gossip_tx, gossip_rx) = mpsc::channel(CHANNEL_BUFFER);
        let channel = Self {
            peer_id,
            tier,
            out,
            lanes: LaneReceivers {
                app: Mutex::new(app_rx),
                gossip: Mutex::new(gossip_rx),
            },
            established_at: unix_now(),
        };
        (
            channel,
            LaneSenders {
                app: app_tx,
                gossip: gossip_tx,
            },
        )
    }

    /// Two connected in-process channels, one per end.
    ///
    /// `left` addresses `right_peer` and vice versa. Used by tests and
    /// in-process wiring; each end's pump is a spawned router task.
    pub fn pair(left_peer: PeerId, right_peer: PeerId, tier: Tier) -> (Channel, Channel) {
        let (left_out, right_in) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER);
        let (right_out, left_in) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER);
        let (left, left_lanes) = Channel::with_pumps(right_peer, tier, left_out);
        let (right, right_lanes) = Channel::with_pumps(left_peer, tier, right_out);

        for (mut inbound, lanes) in [(left_in, left_lanes), (right_in, right_lanes)] {
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        maybe = inbound.recv() => match maybe {
                            Some(frame) => {
                                if !lanes.route(frame).await {
                                    break;
                                }
                            }
                            None => break,
                        },
                        _ = lanes.closed() => break,
                    }
                }
            });
        }
        (left, right)
    }

    /// The peer on the far end.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The tier that produced this channel.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// When the channel was promoted, unix seconds.
    pub fn established_at(&self) -> u64 {
        self.established_at
    }

    /// Sends one application frame, waiting for pump buffer space.
    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.send_tagged(LANE_APP, frame).await
    }

    /// Receives the next application frame; `None` once the far side
    /// is gone.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.lanes.app.lock().await.recv().await
    }

    /// Sends one gossip frame.
    pub(crate) async fn send_gossip(&self, frame: Vec<u8>) -> Result<()> {
        self.send_tagged(LANE_GOSSIP, frame).await
    }

    /// Receives the next gossip frame.
    pub(crate) async fn recv_gossip(&self) -> Option<Vec<u8>> {
        self.lanes.gossip.lock().await.recv().await
    }

    /// Whether the outbound side is still open.
    pub fn is_open(&self) -> bool {
        !self.out.is_closed()
    }

    async fn send_tagged(&self, lane: u8, frame: Vec<u8>) -> Result<()> {
        self.out
            .send(tag_frame(lane, frame))
            .await
            .map_err(|_| NetError::Unreachable("channel closed".into()))
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer_id", &self.peer_id)
            .field("tier", &self.tier)
            .field("established_at", &self.established_at)
            .finish()
    }
}

/// Wraps an authenticated TCP stream in a channel by spawning its pump
/// tasks. The reader pump ends on EOF or a framing error; the writer
/// pump ends when the channel is dropped.
pub(crate) fn channel_from_stream(stream: TcpStream, peer_id: PeerId, tier: Tier) -> Channel {
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER);
    let (channel, lanes) = Channel::with_pumps(peer_id, tier, out_tx);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = read_frame(&mut read_half, MAX_STREAM_FRAME_SIZE) => match result {
                    Ok(frame) => {
                        if !lanes.route(frame).await {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer_id, "Channel reader stopped: {}", e);
                        break;
                    }
                },
                _ = lanes.closed() => break,
            }
        }
    });

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                debug!(peer = %peer_id, "Channel writer stopped: {}", e);
                break;
            }
        }
    });

    channel
}

/// Wraps a connected UDP socket in a channel. One datagram carries one
/// tagged frame; no length prefix is needed.
pub(crate) fn channel_from_udp(socket: UdpSocket, peer_id: PeerId, tier: Tier) -> Channel {
    let socket = Arc::new(socket);
    let recv_socket = Arc::clone(&socket);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER);
    let (channel, lanes) = Channel::with_pumps(peer_id, tier, out_tx);

    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                result = recv_socket.recv(&mut buf) => match result {
                    Ok(n) => {
                        if !lanes.route(buf[..n].to_vec()).await {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer_id, "Datagram reader stopped: {}", e);
                        break;
                    }
                },
                _ = lanes.closed() => break,
            }
        }
    });

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = socket.send(&frame).await {
                debug!(peer = %peer_id, "Datagram writer stopped: {}", e);
                break;
            }
        }
    });

    channel
}

// ============================================================================
// Registry
// ============================================================================

/// All currently promoted channels, one per peer.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<PeerId, Arc<Channel>>>,
}

impl ChannelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a promoted channel, replacing any stale entry for the
    /// same peer.
    pub async fn register(&self, channel: Arc<Channel>) {
        self.channels
            .write()
            .await
            .insert(channel.peer_id(), channel);
    }

    /// The live channel to a peer, when one exists.
    pub async fn get(&self, peer_id: &PeerId) -> Option<Arc<Channel>> {
        let channels = self.channels.read().await;
        match channels.get(peer_id) {
            Some(channel) if channel.is_open() => Some(Arc::clone(channel)),
            _ => None,
        }
    }

    /// Drops the entry for a peer, returning whether one existed.
    pub async fn remove(&self, peer_id: &PeerId) -> bool {
        self.channels.write().await.remove(peer_id).is_some()
    }

    /// Peers with an open channel right now. Closed channels found on
    /// the way are swept out.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let mut channels = self.channels.write().await;
        channels.retain(|_, c| c.is_open());
        channels.keys().copied().collect()
    }

    /// Number of registered channels, open or not.
    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Whether no channel is registered.
    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }
}

// ============================================================================
// Dial targets
// ============================================================================

/// A relay a target might be reached through, with the selection
/// signals known at resolution time.
#[derive(Clone, Debug)]
pub struct RelayCandidate {
    /// The relay peer.
    pub peer_id: PeerId,
    /// Address the relay listens on.
    pub addr: SocketAddr,
    /// The relay's advertised capacity, when its announcement was seen.
    pub advert: Option<RelayAdvert>,
    /// Observed round-trip time, when one is known.
    pub rtt: Option<Duration>,
}

/// Everything resolution learned about one peer, handed to each tier
/// dialer unchanged.
#[derive(Clone, Debug)]
pub struct DialTarget {
    /// The peer to connect to.
    pub peer_id: PeerId,
    /// Candidate endpoints, best first within each tier.
    pub endpoints: Vec<Endpoint>,
    /// The peer's announcement, when resolution found a fresh one.
    pub announcement: Option<PeerAnnouncement>,
    /// Relays the peer keeps registrations with.
    pub relay_candidates: Vec<RelayCandidate>,
    /// NAT class on our own side.
    pub local_nat: NatKind,
    /// Our own reflexive address, when observed.
    pub local_reflexive: Option<SocketAddr>,
    /// Tier that worked last time, from the directory cache.
    pub tier_hint: Option<Tier>,
}

impl DialTarget {
    /// A target with nothing but the peer id resolved.
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            endpoints: Vec::new(),
            announcement: None,
            relay_candidates: Vec::new(),
            local_nat: NatKind::Unknown,
            local_reflexive: None,
            tier_hint: None,
        }
    }

    /// Candidate endpoints dialable by `tier`.
    pub fn endpoints_for(&self, tier: Tier) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .filter(|e| e.tier() == tier)
            .copied()
            .collect()
    }
}

// ============================================================================
// Dialer trait
// ============================================================================

/// One connection-establishment tier.
///
/// This trait uses boxed futures instead of async fn to enable
/// dynamic dispatch (dyn-compatibility).
pub trait TierDialer: Send + Sync {
    /// The tier this dialer implements.
    fn tier(&self) -> Tier;

    /// Whether the tier can run against this target at all. An
    /// inapplicable tier is skipped, never failed.
    fn applicable(&self, target: &DialTarget) -> bool;

    /// Attempts the tier. The caller bounds the attempt with the
    /// per-tier timeout and may abort it at any await point.
    fn dial(&self, target: DialTarget) -> BoxFuture<'_, Result<Channel>>;
}
