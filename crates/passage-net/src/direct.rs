//! Direct TCP tiers and the inbound listener.
//!
//! The two cheapest tiers simply dial the candidate addresses and run
//! the mutual hello. The listener accepts, authenticates, and consults
//! the authorizer before any session state exists.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use passage_proto::{NodeKeypair, PeerId, Tier};

use crate::authorize::{Authorizer, Decision, ACTION_CONNECTION};
use crate::error::{NetError, Result};
use crate::handshake::exchange_hello;
use crate::transport::{
    channel_from_stream, BoxFuture, Channel, ChannelRegistry, DialTarget, TierDialer,
};

/// Dialer for one of the two direct TCP tiers.
pub struct DirectDialer {
    tier: Tier,
    keypair: Arc<NodeKeypair>,
}

impl DirectDialer {
    /// Direct dialer for IPv6 candidates.
    pub fn ipv6(keypair: Arc<NodeKeypair>) -> Self {
        Self {
            tier: Tier::DirectIpv6,
            keypair,
        }
    }

    /// Direct dialer for IPv4 candidates.
    pub fn ipv4(keypair: Arc<NodeKeypair>) -> Self {
        Self {
            tier: Tier::DirectIpv4,
            keypair,
        }
    }
}

impl TierDialer for DirectDialer {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn applicable(&self, target: &DialTarget) -> bool {
        !target.endpoints_for(self.tier).is_empty()
    }

    fn dial(&self, target: DialTarget) -> BoxFuture<'_, Result<Channel>> {
        Box::pin(async move {
            let mut last_err = None;
            for endpoint in target.endpoints_for(self.tier) {
                let Some(addr) = endpoint.addr else {
                    continue;
                };
                let mut stream = match TcpStream::connect(addr).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(peer = %target.peer_id, %addr, "Direct dial failed: {}", e);
                        last_err = Some(NetError::Io(e));
                        continue;
                    }
                };
                match exchange_hello(&mut stream, &self.keypair, Some(&target.peer_id)).await {
                    Ok(verified) => {
                        debug!(peer = %verified, %addr, tier = %self.tier, "Direct channel up");
                        return Ok(channel_from_stream(stream, verified, self.tier));
                    }
                    // A failed identity proof is terminal for the peer,
                    // not a reason to try its other addresses.
                    Err(e @ NetError::Handshake(_)) => return Err(e),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err
                .unwrap_or_else(|| NetError::Unreachable("no dialable endpoints".into())))
        })
    }
}

/// Listener for inbound direct connections.
pub struct DirectListener {
    listener: TcpListener,
    keypair: Arc<NodeKeypair>,
    authorizer: Arc<dyn Authorizer>,
}

impl DirectListener {
    /// Binds the listener.
    pub async fn bind(
        addr: SocketAddr,
        keypair: Arc<NodeKeypair>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            keypair,
            authorizer,
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Each promoted inbound channel is registered and
    /// announced on `promoted_tx`; runs until the task is aborted.
    pub async fn run(
        self,
        registry: Arc<ChannelRegistry>,
        promoted_tx: mpsc::Sender<Arc<Channel>>,
    ) {
        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let keypair = Arc::clone(&self.keypair);
            let authorizer = Arc::clone(&self.authorizer);
            let registry = Arc::clone(&registry);
            let promoted_tx = promoted_tx.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    handle_inbound(stream, remote, keypair, authorizer, registry, promoted_tx)
                        .await
                {
                    debug!(%remote, "Inbound connection dropped: {}", e);
                }
            });
        }
    }
}

async fn handle_inbound(
    mut stream: TcpStream,
    remote: SocketAddr,
    keypair: Arc<NodeKeypair>,
    authorizer: Arc<dyn Authorizer>,
    registry: Arc<ChannelRegistry>,
    promoted_tx: mpsc::Sender<Arc<Channel>>,
) -> Result<PeerId> {
    let peer_id = exchange_hello(&mut stream, &keypair, None).await?;

    if let Decision::Deny { reason } = authorizer.authorize(&peer_id, ACTION_CONNECTION).await {
        info!(peer = %peer_id, %remote, "Inbound connection denied: {}", reason);
        return Err(NetError::Denied(reason));
    }

    let tier = if remote.is_ipv6() {
        Tier::DirectIpv6
    } else {
        Tier::DirectIpv4
    };
    let channel = Arc::new(channel_from_stream(stream, peer_id, tier));
    registry.register(Arc::clone(&channel)).await;
    debug!(peer = %peer_id, %remote, tier = %tier, "Inbound channel up");
    let _ = promoted_tx.send(channel).await;
    Ok(peer_id)
}
