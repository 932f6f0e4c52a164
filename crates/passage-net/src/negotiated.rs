//! Negotiated tier: offer/answer over an out-of-band signaling channel,
//! then UDP connectivity checks across the advertised candidate pairs.
//!
//! The shape loosely mirrors ICE. Each side gathers host and reflexive
//! candidates, the initiator sends an offer through the signaling
//! service, the responder answers with its own candidates, and both
//! sides probe the pairs until one address proves a round trip. The
//! winning path carries the mutual hello before it is promoted to a
//! channel, so signaling is trusted for routing only, never identity.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use passage_proto::wire::{parse_probe, probe_bytes, ProbeKind};
use passage_proto::{
    CandidateAddr, CandidateKind, NodeKeypair, RendezvousTicket, SessionId, SignalPayload, Tier,
};

use crate::authorize::{Authorizer, Decision, ACTION_CONNECTION};
use crate::config::NetConfig;
use crate::error::{NetError, Result};
use crate::handshake::exchange_hello_datagram;
use crate::transport::{channel_from_udp, BoxFuture, Channel, DialTarget, TierDialer};

/// Milliseconds between connectivity check rounds.
const CHECK_INTERVAL_MS: u64 = 150;

/// Out-of-band delivery of negotiation payloads and punch tickets.
///
/// Implementations route by the payload's recipient; a deployment
/// typically backs this with a rendezvous service both peers hold a
/// connection to. This trait uses boxed futures instead of async fn to
/// enable dynamic dispatch (dyn-compatibility).
pub trait Signaling: Send + Sync {
    /// Delivers an offer to its addressee and returns the response.
    fn exchange(&self, offer: SignalPayload) -> BoxFuture<'_, Result<SignalPayload>>;

    /// Delivers a rendezvous ticket to its responder.
    fn deliver_ticket(&self, ticket: RendezvousTicket) -> BoxFuture<'_, Result<()>>;
}

/// Dialer for [`Tier::Negotiated`].
///
/// Only applicable when a signaling service is configured; without one
/// the tier is skipped, not failed.
pub struct NegotiatedDialer {
    keypair: Arc<NodeKeypair>,
    signaling: Option<Arc<dyn Signaling>>,
    bind_ip: IpAddr,
    check_deadline: Duration,
}

impl NegotiatedDialer {
    /// New dialer; `signaling` may be absent.
    pub fn new(
        keypair: Arc<NodeKeypair>,
        signaling: Option<Arc<dyn Signaling>>,
        config: &NetConfig,
    ) -> Self {
        NegotiatedDialer {
            keypair,
            signaling,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            check_deadline: config.negotiated_timeout,
        }
    }

    /// Binds negotiation sockets to `ip` instead of the wildcard.
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }
}

impl TierDialer for NegotiatedDialer {
    fn tier(&self) -> Tier {
        Tier::Negotiated
    }

    fn applicable(&self, _target: &DialTarget) -> bool {
        self.signaling.is_some()
    }

    fn dial(&self, target: DialTarget) -> BoxFuture<'_, Result<Channel>> {
        Box::pin(async move {
            let signaling = self
                .signaling
                .as_ref()
                .ok_or(NetError::TierSkipped(Tier::Negotiated))?;

            let socket = UdpSocket::bind((self.bind_ip, 0)).await?;
            let local = socket.local_addr()?;
            let candidates = gather_candidates(local, target.local_reflexive);

            let session = SessionId::generate();
            let offer = SignalPayload::Offer {
                session,
                from: self.keypair.peer_id(),
                to: target.peer_id,
                candidates,
            };
            debug!(peer = %target.peer_id, %session, "Sending negotiation offer");

            let theirs = match signaling.exchange(offer).await? {
                SignalPayload::Answer {
                    session: answered,
                    from,
                    candidates,
                    ..
                } if answered == session && from == target.peer_id => candidates,
                SignalPayload::Reject { reason, .. } => {
                    return Err(NetError::Denied(format!("negotiation rejected: {}", reason)));
                }
                _ => {
                    return Err(NetError::Wire(
                        "signaling response did not match the offer".into(),
                    ));
                }
            };
            if theirs.is_empty() {
                return Err(NetError::Unreachable("answer carried no candidates".into()));
            }

            let chosen = run_checks(&socket, &theirs, &session, self.check_deadline).await?;
            socket.connect(chosen).await?;
            let verified =
                exchange_hello_datagram(&socket, &self.keypair, Some(&target.peer_id)).await?;
            debug!(peer = %verified, addr = %chosen, "Negotiated path established");
            Ok(channel_from_udp(socket, verified, Tier::Negotiated))
        })
    }
}

/// Answers an inbound offer.
///
/// Returns the payload to route back over signaling, plus a task that
/// resolves to the responder's channel once the initiator's checks and
/// hello land. A refused offer returns a [`SignalPayload::Reject`] and
/// no task. This function never touches the signaling service itself;
/// routing the answer is the caller's job.
pub async fn respond_to_offer(
    offer: &SignalPayload,
    keypair: Arc<NodeKeypair>,
    authorizer: Arc<dyn Authorizer>,
    bind_ip: IpAddr,
    reflexive: Option<SocketAddr>,
    deadline: Duration,
) -> Result<(SignalPayload, Option<JoinHandle<Result<Channel>>>)> {
    offer.validate()?;
    let (session, initiator, their_candidates) = match offer {
        SignalPayload::Offer {
            session,
            from,
            candidates,
            ..
        } => (*session, *from, candidates.clone()),
        _ => return Err(NetError::Wire("expected an offer".into())),
    };

    if let Decision::Deny { reason } = authorizer.authorize(&initiator, ACTION_CONNECTION).await {
        info!(peer = %initiator, %reason, "Refusing negotiation offer");
        let reject = SignalPayload::Reject {
            session,
            from: keypair.peer_id(),
            to: initiator,
            reason,
        };
        return Ok((reject, None));
    }

    let socket = UdpSocket::bind((bind_ip, 0)).await?;
    let local = socket.local_addr()?;
    let answer = SignalPayload::Answer {
        session,
        from: keypair.peer_id(),
        to: initiator,
        candidates: gather_candidates(local, reflexive),
    };

    let handle = tokio::spawn(async move {
        let chosen = run_checks(&socket, &their_candidates, &session, deadline).await?;
        socket.connect(chosen).await?;
        let verified = exchange_hello_datagram(&socket, &keypair, Some(&initiator)).await?;
        debug!(peer = %verified, addr = %chosen, "Answered negotiation established");
        Ok(channel_from_udp(socket, verified, Tier::Negotiated))
    });

    Ok((answer, Some(handle)))
}

/// Candidates for one negotiation socket, best first.
fn gather_candidates(local: SocketAddr, reflexive: Option<SocketAddr>) -> Vec<CandidateAddr> {
    let mut out = Vec::new();
    if !local.ip().is_unspecified() {
        out.push(CandidateAddr {
            addr: local,
            kind: CandidateKind::Host,
        });
    }
    if let Some(observed) = reflexive {
        // The reflexive observation names another socket's mapping, so
        // only the address part is reused; the port is this socket's.
        let guess = SocketAddr::new(observed.ip(), local.port());
        if out.iter().all(|c| c.addr != guess) {
            out.push(CandidateAddr {
                addr: guess,
                kind: CandidateKind::Reflexive,
            });
        }
    }
    out
}

/// Probes every candidate until one address proves a round trip.
///
/// Sends [`ProbeKind::Check`] rounds and answers the peer's own checks
/// while waiting. Whichever direction lands first settles the pair: a
/// check-ack proves our outbound path, an inbound check proves the
/// peer's, and a non-probe datagram means the peer already selected
/// this path and moved on to its hello.
async fn run_checks(
    socket: &UdpSocket,
    candidates: &[CandidateAddr],
    session: &SessionId,
    deadline: Duration,
) -> Result<SocketAddr> {
    let token = *session.as_bytes();
    let check = probe_bytes(ProbeKind::Check, &token);
    let ack = probe_bytes(ProbeKind::CheckAck, &token);

    let mut buf = [0u8; 64];
    let mut rounds = tokio::time::interval(Duration::from_millis(CHECK_INTERVAL_MS));
    let expired = tokio::time::sleep(deadline);
    tokio::pin!(expired);

    loop {
        tokio::select! {
            _ = rounds.tick() => {
                for candidate in candidates {
                    let _ = socket.send_to(&check, candidate.addr).await;
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (n, src) = received?;
                match parse_probe(&buf[..n]) {
                    Some((ProbeKind::CheckAck, t)) if t == token => return Ok(src),
                    Some((ProbeKind::Check, t)) if t == token => {
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
