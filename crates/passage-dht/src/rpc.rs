//! UDP datagram socket with request/response correlation.
//!
//! All DHT traffic shares one socket. Outbound requests park a oneshot
//! sender under their [`RpcId`]; the receive loop routes matching
//! responses back to the waiting caller and hands inbound requests to
//! the node for dispatch. Requests that go unanswered are retried with
//! exponential backoff under a fresh id, so late responses to an
//! earlier attempt are dropped rather than misattributed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};

use passage_proto::limits::MAX_RPC_PACKET_SIZE;
use passage_proto::rpc::{RpcId, RpcMessage, RpcPayload, RpcRequest, RpcResponse};
use passage_proto::PeerId;

use crate::error::{DhtError, Result};

/// Base delay between request retries; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// An inbound request pulled off the socket, awaiting dispatch.
#[derive(Debug)]
pub struct InboundRpc {
    /// Correlation id to echo in the response.
    pub rpc_id: RpcId,
    /// Claimed sender id.
    pub sender: PeerId,
    /// The request itself.
    pub request: RpcRequest,
    /// Source address of the datagram.
    pub from: SocketAddr,
}

/// Counters for socket traffic.
#[derive(Debug, Default)]
pub struct RpcSocketStats {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    timeouts: AtomicU64,
    stale_responses: AtomicU64,
    decode_failures: AtomicU64,
}

/// Point-in-time copy of [`RpcSocketStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcSocketStatsSnapshot {
    /// Requests sent, counting each retry attempt.
    pub requests_sent: u64,
    /// Responses matched to a waiting request.
    pub responses_received: u64,
    /// Inbound requests handed to the dispatcher.
    pub requests_received: u64,
    /// Responses sent back to remote requesters.
    pub responses_sent: u64,
    /// Attempts that expired without a response.
    pub timeouts: u64,
    /// Responses with no waiting request, typically late retries.
    pub stale_responses: u64,
    /// Datagrams that failed size or format checks.
    pub decode_failures: u64,
}

impl RpcSocketStats {
    fn snapshot(&self) -> RpcSocketStatsSnapshot {
        RpcSocketStatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            stale_responses: self.stale_responses.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

/// The shared DHT socket.
///
/// [`RpcSocket::request`] completes only while some task is driving
/// [`RpcSocket::recv`]; the node's run loop does that in production,
/// tests spawn their own.
#[derive(Debug)]
pub struct RpcSocket {
    socket: UdpSocket,
    local_id: PeerId,
    rpc_timeout: Duration,
    rpc_retries: u32,
    pending: Mutex<HashMap<RpcId, oneshot::Sender<(PeerId, RpcResponse)>>>,
    stats: RpcSocketStats,
}

impl RpcSocket {
    /// Binds the socket and fixes the retry policy.
    pub async fn bind(
        addr: SocketAddr,
        local_id: PeerId,
        rpc_timeout: Duration,
        rpc_retries: u32,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(Self {
            socket,
            local_id,
            rpc_timeout,
            rpc_retries,
            pending: Mutex::new(HashMap::new()),
            stats: RpcSocketStats::default(),
        }))
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// The id requests are sent under.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Sends `request` to `to` and waits for the matching response.
    ///
    /// Each attempt uses a fresh correlation id. After the configured
    /// retries are spent the call fails with [`DhtError::Timeout`].
    pub async fn request(&self, to: SocketAddr, request: RpcRequest) -> Result<(PeerId, RpcResponse)> {
        let attempts = self.rpc_retries + 1;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE_DELAY * (1 << (attempt - 1))).await;
            }

            let message = RpcMessage::request(self.local_id, request.clone());
            let rpc_id = message.rpc_id;
            let bytes = message.to_bytes()?;

            let (tx, rx) = oneshot::channel();
            self.pending.lock().await.insert(rpc_id, tx);

            self.socket.send_to(&bytes, to).await?;
            self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);
            trace!(%to, ?rpc_id, attempt, "rpc request sent");

            match tokio::time::timeout(self.rpc_timeout, rx).await {
                Ok(Ok(response)) => {
                    self.stats.responses_received.fetch_add(1, Ordering::Relaxed);
                    return Ok(response);
                }
                Ok(Err(_)) | Err(_) => {
                    self.pending.lock().await.remove(&rpc_id);
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!(%to, ?rpc_id, attempt, "rpc attempt timed out");
                }
            }
        }
        Err(DhtError::Timeout)
    }

    /// Receives the next inbound request.
    ///
    /// Responses and undecodable datagrams are consumed internally;
    /// only requests surface to the caller.
    pub async fn recv(&self) -> Result<InboundRpc> {
        // One byte over the cap so oversized datagrams fail the size
        // check instead of being silently truncated to a valid prefix.
        let mut buf = vec![0u8; MAX_RPC_PACKET_SIZE + 1];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            let message = match RpcMessage::from_bytes(&buf[..len]) {
                Ok(message) => message,
                Err(err) => {
                    self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(%from, %err, "dropping undecodable datagram");
                    continue;
                }
            };

            match message.payload {
                RpcPayload::Response(response) => {
                    match self.pending.lock().await.remove(&message.rpc_id) {
                        Some(tx) => {
                            // Receiver may have timed out between the map
                            // lookup and this send; that is fine.
                            let _ = tx.send((message.sender, response));
                        }
                        None => {
                            self.stats.stale_responses.fetch_add(1, Ordering::Relaxed);
                            trace!(%from, rpc_id = ?message.rpc_id, "stale response dropped");
                        }
                    }
                }
                RpcPayload::Request(request) => {
                    self.stats.requests_received.fetch_add(1, Ordering::Relaxed);
                    return Ok(InboundRpc {
                        rpc_id: message.rpc_id,
                        sender: message.sender,
                        request,
                        from,
                    });
                }
            }
        }
    }

    /// Sends a response for a previously received request.
    pub async fn respond(
        &self,
        to: SocketAddr,
        rpc_id: RpcId,
        response: RpcResponse,
    ) -> Result<()> {
        let message = RpcMessage::response(rpc_id, self.local_id, response);
        let bytes = message.to_bytes()?;
        self.socket.send_to(&bytes, to).await?;
        self.stats.responses_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Traffic counters.
    pub fn stats(&self) -> RpcSocketStatsSnapshot {
        self.stats.snapshot()
    }
}

// ==== RPC Socket Tests ====
