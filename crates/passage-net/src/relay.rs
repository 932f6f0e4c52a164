//! Relay tier: framed forwarding through a volunteer peer.
//!
//! The client dials the relay directly, proves identities with the
//! hello, registers the peer it wants, and waits for the relay to pair
//! it with the counterpart's registration. From then on application
//! frames travel inside [`RelayFrame::Data`] and the relay forwards
//! them verbatim; payloads stay opaque end to end. The server half is
//! the volunteer mode a node can opt into, advertised through its
//! announcement.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use passage_proto::limits::MAX_RELAY_FRAME_SIZE;
use passage_proto::{NodeKeypair, PeerId, RelayAdvert, RelayFrame, SessionId, Tier};

use crate::authorize::{Authorizer, Decision, ACTION_RELAY};
use crate::error::{NetError, Result};
use crate::handshake::exchange_hello;
use crate::transport::{
    read_frame, write_frame, BoxFuture, Channel, DialTarget, RelayCandidate, TierDialer,
    CHANNEL_BUFFER,
};

/// Sessions a volunteer holds by default.
pub const DEFAULT_RELAY_MAX_SESSIONS: usize = 10;

/// Seconds without traffic before a session or pending registration is
/// torn down.
const RELAY_IDLE_SECS: u64 = 300;

/// Per-direction forwarding budget, bytes per second averaged over the
/// session lifetime.
const RELAY_BYTES_PER_SEC: u64 = 256 * 1024;

// ============================================================================
// Client
// ============================================================================

/// Picks the relay to try: lowest round-trip time among candidates with
/// session headroom, ties broken by fewest active sessions. Candidates
/// without an advert count as available, without a measurement they
/// rank last.
pub(crate) fn select_relay(candidates: &[RelayCandidate]) -> Option<&RelayCandidate> {
    candidates
        .iter()
        .filter(|c| c.advert.as_ref().map_or(true, |a| a.headroom() > 0))
        .min_by_key(|c| {
            (
                c.rtt.unwrap_or(Duration::MAX),
                c.advert.as_ref().map_or(u32::MAX, |a| a.active_sessions),
            )
        })
}

/// Dialer for [`Tier::Relay`].
pub struct RelayDialer {
    keypair: Arc<NodeKeypair>,
}

impl RelayDialer {
    /// New dialer.
    pub fn new(keypair: Arc<NodeKeypair>) -> Self {
        RelayDialer { keypair }
    }

    async fn dial_via(&self, relay: &RelayCandidate, target: PeerId) -> Result<Channel> {
        let mut stream = TcpStream::connect(relay.addr).await?;
        exchange_hello(&mut stream, &self.keypair, Some(&relay.peer_id)).await?;

        let register = RelayFrame::Register { target }.to_bytes()?;
        write_frame(&mut stream, &register).await?;

        loop {
            let frame = read_frame(&mut stream, MAX_RELAY_FRAME_SIZE).await?;
            match RelayFrame::from_bytes(&frame)? {
                RelayFrame::Waiting => {
                    debug!(relay = %relay.peer_id, peer = %target, "Held in relay waiting room");
                }
                RelayFrame::Ready { session_id } => {
                    debug!(relay = %relay.peer_id, %session_id, "Relay session ready");
                    return Ok(channel_over_relay(stream, target));
                }
                RelayFrame::Close { reason } => {
                    return Err(NetError::Unreachable(format!("relay closed: {}", reason)));
                }
                _ => return Err(NetError::Wire("unexpected frame from relay".into())),
            }
        }
    }
}

impl TierDialer for RelayDialer {
    fn tier(&self) -> Tier {
        Tier::Relay
    }

    fn applicable(&self, target: &DialTarget) -> bool {
        !target.relay_candidates.is_empty()
    }

    fn dial(&self, target: DialTarget) -> BoxFuture<'_, Result<Channel>> {
        Box::pin(async move {
            let mut remaining = target.relay_candidates.clone();
            let mut last_err = None;

            // One reselection from the remaining candidates, then the
            // tier fails.
            for _ in 0..2 {
                let Some(chosen) = select_relay(&remaining).cloned() else {
                    break;
                };
                remaining.retain(|c| c.peer_id != chosen.peer_id);
                match self.dial_via(&chosen, target.peer_id).await {
                    Ok(channel) => return Ok(channel),
                    Err(e @ NetError::Denied(_)) => return Err(e),
                    Err(e) => {
                        debug!(relay = %chosen.peer_id, %e, "Relay candidate failed");
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err.unwrap_or(NetError::NoRelayAvailable))
        })
    }
}

/// Wraps a paired relay connection in a channel.
///
/// Outbound lane-tagged frames ride inside [`RelayFrame::Data`];
/// inbound `Data` payloads are unwrapped back onto the lanes. A `Close`
/// from the relay ends the pumps.
fn channel_over_relay(stream: TcpStream, peer_id: PeerId) -> Channel {
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_BUFFER);
    let (channel, lanes) = Channel::with_pumps(peer_id, Tier::Relay, out_tx);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = read_frame(&mut read_half, MAX_RELAY_FRAME_SIZE) => {
                    let parsed = match result {
                        Ok(frame) => RelayFrame::from_bytes(&frame),
                        Err(e) => {
                            debug!(peer = %peer_id, "Relay reader stopped: {}", e);
                            break;
                        }
                    };
                    match parsed {
                        Ok(RelayFrame::Data { payload }) => {
                            if !lanes.route(payload).await {
                                break;
                            }
                        }
                        Ok(RelayFrame::Close { reason }) => {
                            debug!(peer = %peer_id, %reason, "Relay session closed");
                            break;
                        }
                        Ok(_) | Err(_) => {
                            debug!(peer = %peer_id, "Unexpected frame in relay session");
                            break;
                        }
                    }
                }
                _ = lanes.closed() => break,
            }
        }
    });

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let data = match (RelayFrame::Data { payload: frame }).to_bytes() {
                Ok(data) => data,
                Err(e) => {
                    debug!(peer = %peer_id, "Dropping oversized relay frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut write_half, &data).await {
                debug!(peer = %peer_id, "Relay writer stopped: {}", e);
                break;
            }
        }
    });

    channel
}

// ============================================================================
// Server
// ============================================================================

/// A registrant parked until its counterpart shows up.
struct WaitingParty {
    peer: PeerId,
    handoff: oneshot::Sender<(TcpStream, PeerId)>,
}

/// Volunteer relay: pairs registrations and forwards data frames.
pub struct RelayServer {
    keypair: Arc<NodeKeypair>,
    authorizer: Arc<dyn Authorizer>,
    listener: TcpListener,
    max_sessions: usize,
    idle: Duration,
    active: Arc<AtomicUsize>,
    waiting: Arc<Mutex<HashMap<(PeerId, PeerId), WaitingParty>>>,
}

impl RelayServer {
    /// Binds the relay listener.
    pub async fn bind(
        keypair: Arc<NodeKeypair>,
        authorizer: Arc<dyn Authorizer>,
        addr: SocketAddr,
        max_sessions: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(RelayServer {
            keypair,
            authorizer,
            listener,
            max_sessions,
            idle: Duration::from_secs(RELAY_IDLE_SECS),
            active: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Bound address, for the node's announcement.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Sessions currently being forwarded.
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Advert for this volunteer's announcement. Uptime is not tracked
    /// yet; volunteers advertise a neutral score.
    pub fn advert(&self) -> Result<RelayAdvert> {
        Ok(RelayAdvert {
            port: self.local_addr()?.port(),
            max_sessions: self.max_sessions as u32,
            active_sessions: self.active_sessions() as u32,
            uptime_score: 1.0,
        })
    }

    /// Accept loop; runs until the listener fails fatally.
    pub async fn run(self) {
        let server = Arc::new(self);
        loop {
            let (stream, remote) = match server.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Relay accept failed: {}", e);
                    continue;
                }
            };
            debug!(%remote, "Relay connection accepted");
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(e) = server.handle_registrant(stream).await {
                    debug!(%remote, "Relay registrant dropped: {}", e);
                }
            });
        }
    }

    async fn handle_registrant(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let registrant = exchange_hello(&mut stream, &self.keypair, None).await?;

        if let Decision::Deny { reason } = self.authorizer.authorize(&registrant, ACTION_RELAY).await
        {
            info!(peer = %registrant, %reason, "Refusing relay registration");
            return Err(NetError::Denied(reason));
        }

        let frame = timeout(self.idle, read_frame(&mut stream, MAX_RELAY_FRAME_SIZE))
            .await
            .map_err(|_| NetError::Timeout)??;
        let target = match RelayFrame::from_bytes(&frame)? {
            RelayFrame::Register { target } => target,
            _ => return Err(NetError::Wire("expected a registration".into())),
        };

        if self.active.load(Ordering::Relaxed) >= self.max_sessions {
            let close = RelayFrame::Close {
                reason: "at capacity".into(),
            }
            .to_bytes()?;
            let _ = write_frame(&mut stream, &close).await;
            return Err(NetError::SpoolFull("relay at capacity".into()));
        }

        let key = pair_key(registrant, target);
        let counterpart = {
            let mut waiting = self.waiting.lock().await;
            match waiting.remove(&key) {
                // A re-registration by the same peer replaces its stale
                // entry instead of pairing with itself.
                Some(party) if party.peer == registrant => None,
                Some(party) => Some(party),
                None => None,
            }
        };

        match counterpart {
            Some(party) => {
                if party.handoff.send((stream, registrant)).is_err() {
                    // The waiter gave up just now; nothing to pair with.
                    return Err(NetError::Unreachable("counterpart gone".into()));
                }
                Ok(())
            }
            None => self.wait_for_counterpart(stream, registrant, key).await,
        }
    }

    /// Parks the first registrant of a pair until the counterpart
    /// arrives or the idle timeout passes, then runs the session.
    async fn wait_for_counterpart(
        self: &Arc<Self>,
        mut stream: TcpStream,
        registrant: PeerId,
        key: (PeerId, PeerId),
    ) -> Result<()> {
        let (handoff, parked) = oneshot::channel();
        self.waiting.lock().await.insert(
            key,
            WaitingParty {
                peer: registrant,
                handoff,
            },
        );
        let waiting_frame = RelayFrame::Waiting.to_bytes()?;
        write_frame(&mut stream, &waiting_frame).await?;

        let (counterpart_stream, counterpart) = match timeout(self.idle, parked).await {
            Ok(Ok(handed)) => handed,
            Ok(Err(_)) => return Err(NetError::Unreachable("registration replaced".into())),
            Err(_) => {
                self.waiting.lock().await.remove(&key);
                let close = RelayFrame::Close {
                    reason: "no counterpart".into(),
                }
                .to_bytes()?;
                let _ = write_frame(&mut stream, &close).await;
                return Err(NetError::Timeout);
            }
        };

        self.run_session(stream, registrant, counterpart_stream, counterpart)
            .await
    }

    async fn run_session(
        self: &Arc<Self>,
        mut first: TcpStream,
        first_peer: PeerId,
        mut second: TcpStream,
        second_peer: PeerId,
    ) -> Result<()> {
        let session_id = SessionId::generate();
        let ready = RelayFrame::Ready { session_id }.to_bytes()?;
        write_frame(&mut first, &ready).await?;
        write_frame(&mut second, &ready).await?;

        self.active.fetch_add(1, Ordering::Relaxed);
        info!(%session_id, a = %first_peer, b = %second_peer, "Relay session started");

        let (first_read, first_write) = first.into_split();
        let (second_read, second_write) = second.into_split();
        let idle = self.idle;
        let mut forward = tokio::spawn(pump_direction(first_read, second_write, idle));
        let mut backward = tokio::spawn(pump_direction(second_read, first_write, idle));

        let cause = tokio::select! {
            done = &mut forward => {
                backward.abort();
                done
            }
            done = &mut backward => {
                forward.abort();
                done
            }
        };
        self.active.fetch_sub(1, Ordering::Relaxed);
        info!(
            %session_id,
            cause = cause.unwrap_or("aborted"),
            "Relay session ended"
        );
        Ok(())
    }
}

/// Normalized session key; both registration directions map to it.
fn pair_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Forwards frames one way until disconnect, idle, a close, or the
/// byte budget runs out. Returns the stop cause.
async fn pump_direction(
    mut from: OwnedReadHalf,
    mut to: OwnedWriteHalf,
    idle: Duration,
) -> &'static str {
    let started = Instant::now();
    let mut bytes: u64 = 0;
    loop {
        let frame = match timeout(idle, read_frame(&mut from, MAX_RELAY_FRAME_SIZE)).await {
            Err(_) => return "idle",
            Ok(Err(_)) => return "disconnect",
            Ok(Ok(frame)) => frame,
        };
        match RelayFrame::from_bytes(&frame) {
            Ok(RelayFrame::Data { payload }) => {
                bytes = bytes.saturating_add(payload.len() as u64);
                let budget = RELAY_BYTES_PER_SEC.saturating_mul(started.elapsed().as_secs().max(1));
                if bytes > budget {
                    return "rate limited";
                }
                // Forwarded verbatim; the payload is never inspected.
                if write_frame(&mut to, &frame).await.is_err() {
                    return "counterpart gone";
                }
            }
            Ok(RelayFrame::Close { .. }) => {
                let _ = write_frame(&mut to, &frame).await;
                return "closed by peer";
            }
            Ok(_) | Err(_) => return "protocol error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorize::{AllowAll, DenyList};

    async fn start_relay(
        authorizer: Arc<dyn Authorizer>,
        max_sessions: usize,
    ) -> (PeerId, SocketAddr) {
        let keypair = Arc::new(NodeKeypair::generate());
        let relay_id = keypair.peer_id();
        let server = RelayServer::bind(
            keypair,
            authorizer,
            "127.0.0.1:0".parse().unwrap(),
            max_sessions,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (relay_id, addr)
    }

    /// Registers with the relay by hand and waits for pairing.
    async fn register(
        keypair: &NodeKeypair,
        relay_id: PeerId,
        relay_addr: SocketAddr,
        target: PeerId,
    ) -> Result<Channel> {
        let mut stream = TcpStream::connect(relay_addr).await?;
        exchange_hello(&mut stream, keypair, Some(&relay_id)).await?;
        let frame = RelayFrame::Register { target }.to_bytes()?;
        write_frame(&mut stream, &frame).await?;
        loop {
            let frame = read_frame(&mut stream, MAX_RELAY_FRAME_SIZE).await?;
            match RelayFrame::from_bytes(&frame)? {
                RelayFrame::Waiting => continue,
                RelayFrame::Ready { .. } => return Ok(channel_over_relay(stream, target)),
                RelayFrame::Close { reason } => {
                    return Err(NetError::Unreachable(format!("relay closed: {}", reason)))
                }
                _ => return Err(NetError::Wire("unexpected frame from relay".into())),
            }
        }
    }

    fn candidate(peer_id: PeerId, addr: SocketAddr) -> RelayCandidate {
        RelayCandidate {
            peer_id,
            addr,
            advert: None,
            rtt: None,
        }
    }

    fn advert(active: u32, max: u32) -> RelayAdvert {
        RelayAdvert {
            port: 7600,
            max_sessions: max,
            active_sessions: active,
            uptime_score: 1.0,
        }
    }

    #[tokio::test]
    async fn relay_pairs_registrants_and_forwards_both_ways() {
        let (relay_id, relay_addr) = start_relay(Arc::new(AllowAll), 4).await;
        let alice = Arc::new(NodeKeypair::generate());
        let bob = Arc::new(NodeKeypair::generate());

        let bob_side = {
            let bob = bob.clone();
            let alice_id = alice.peer_id();
            tokio::spawn(async move { register(&bob, relay_id, relay_addr, alice_id).await })
        };

        let dialer = RelayDialer::new(alice.clone());
        let mut target = DialTarget::new(bob.peer_id());
        target.relay_candidates = vec![candidate(relay_id, relay_addr)];
        assert!(dialer.applicable(&target));

        let ours = dialer.dial(target).await.unwrap();
        let theirs = bob_side.await.unwrap().unwrap();
        assert_eq!(ours.tier(), Tier::Relay);
        assert_eq!(ours.peer_id(), bob.peer_id());

        ours.send(b"through the relay".to_vec()).await.unwrap();
        assert_eq!(theirs.recv().await.unwrap(), b"through the relay".to_vec());
        theirs.send(b"and back".to_vec()).await.unwrap();
        assert_eq!(ours.recv().await.unwrap(), b"and back".to_vec());
    }

    #[tokio::test]
    async fn second_candidate_is_tried_after_the_first_fails() {
        let (relay_id, relay_addr) = start_relay(Arc::new(AllowAll), 4).await;
        let alice = Arc::new(NodeKeypair::generate());
        let bob = Arc::new(NodeKeypair::generate());

        // A dead candidate with a flattering rtt gets picked first.
        let dead_addr = {
            let sock = TcpListener::bind("127.0.0.1:0").await.unwrap();
            sock.local_addr().unwrap()
        };
        let mut dead = candidate(NodeKeypair::generate().peer_id(), dead_addr);
        dead.rtt = Some(Duration::from_millis(1));
        let mut live = candidate(relay_id, relay_addr);
        live.rtt = Some(Duration::from_millis(50));

        let bob_side = {
            let bob = bob.clone();
            let alice_id = alice.peer_id();
            tokio::spawn(async move { register(&bob, relay_id, relay_addr, alice_id).await })
        };

        let dialer = RelayDialer::new(alice);
        let mut target = DialTarget::new(bob.peer_id());
        target.relay_candidates = vec![dead, live];

        let ours = dialer.dial(target).await.unwrap();
        let theirs = bob_side.await.unwrap().unwrap();
        ours.send(b"rerouted".to_vec()).await.unwrap();
        assert_eq!(theirs.recv().await.unwrap(), b"rerouted".to_vec());
    }

    #[tokio::test]
    async fn capacity_zero_refuses_registrations() {
        let (relay_id, relay_addr) = start_relay(Arc::new(AllowAll), 0).await;
        let alice = NodeKeypair::generate();
        let target = NodeKeypair::generate().peer_id();

        let err = register(&alice, relay_id, relay_addr, target)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Unreachable(_)));
    }

    #[tokio::test]
    async fn denied_registrant_is_dropped() {
        let alice = NodeKeypair::generate();
        let (relay_id, relay_addr) =
            start_relay(Arc::new(DenyList::new([alice.peer_id()])), 4).await;
        let target = NodeKeypair::generate().peer_id();

        // The hello completes, then the relay hangs up without pairing.
        let err = register(&alice, relay_id, relay_addr, target)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Io(_) | NetError::Wire(_)));
    }

    #[test]
    fn selection_prefers_rtt_with_headroom() {
        let a = NodeKeypair::generate().peer_id();
        let b = NodeKeypair::generate().peer_id();
        let c = NodeKeypair::generate().peer_id();
        let addr: SocketAddr = "203.0.113.9:7600".parse().unwrap();

        let mut fast_but_full = candidate(a, addr);
        fast_but_full.rtt = Some(Duration::from_millis(5));
        fast_but_full.advert = Some(advert(10, 10));

        let mut slow = candidate(b, addr);
        slow.rtt = Some(Duration::from_millis(80));
        slow.advert = Some(advert(2, 10));

        let mut quick = candidate(c, addr);
        quick.rtt = Some(Duration::from_millis(20));
        quick.advert = Some(advert(9, 10));

        let candidates = [fast_but_full, slow, quick];
        let picked = select_relay(&candidates).unwrap();
        assert_eq!(picked.peer_id, c);

        // Ties on rtt break by fewest active sessions.
        let mut tied_busy = candidate(a, addr);
        tied_busy.rtt = Some(Duration::from_millis(20));
        tied_busy.advert = Some(advert(5, 10));
        let mut tied_idle = candidate(b, addr);
        tied_idle.rtt = Some(Duration::from_millis(20));
        tied_idle.advert = Some(advert(1, 10));
        let tied = [tied_busy, tied_idle];
        let picked = select_relay(&tied).unwrap();
        assert_eq!(picked.peer_id, b);

        assert!(select_relay(&[]).is_none());
    }
}
