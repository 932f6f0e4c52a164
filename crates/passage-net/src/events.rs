//! Status events emitted by the orchestrator as a request moves
//! through its states.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use passage_proto::{unix_now, PeerId, Tier};

/// Default channel buffer size for status events.
pub const EVENT_CHANNEL_SIZE: usize = 256;

/// Identifier of one connect request, unique within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    /// Allocates the next process-wide id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        RequestId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Where a connect request currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Gathering candidates from the directory and the DHT.
    Resolving,
    /// A tier attempt is in flight.
    Attempting,
    /// The tier ran and failed.
    TierFailed,
    /// The tier was skipped: inapplicable or breaker open.
    TierSkipped,
    /// A channel was promoted; the request is done.
    Connected,
    /// No live channel; the payload rests in the gossip spool.
    Queued,
    /// Every path failed, including the gossip fallback.
    Exhausted,
    /// The request future was dropped before an outcome.
    Cancelled,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::Resolving => "resolving",
            AttemptState::Attempting => "attempting",
            AttemptState::TierFailed => "tier_failed",
            AttemptState::TierSkipped => "tier_skipped",
            AttemptState::Connected => "connected",
            AttemptState::Queued => "queued",
            AttemptState::Exhausted => "exhausted",
            AttemptState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One state transition of one connect request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// The request this event belongs to.
    pub request_id: RequestId,
    /// The peer being connected to.
    pub peer_id: PeerId,
    /// The tier involved, when the state is tier-scoped.
    pub tier: Option<Tier>,
    /// The state entered.
    pub state: AttemptState,
    /// Emission time, unix seconds.
    pub timestamp: u64,
}

/// Sending half of the status channel.
///
/// Events are advisory; when the consumer falls behind the send is
/// dropped with a warning rather than blocking an attempt.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::Sender<StatusEvent>,
}

impl EventSender {
    /// Emits one transition, never blocking.
    pub fn emit(&self, request_id: RequestId, peer_id: PeerId, tier: Option<Tier>, state: AttemptState) {
        let event = StatusEvent {
            request_id,
            peer_id,
            tier,
            state,
            timestamp: unix_now(),
        };
        if let Err(e) = self.tx.try_send(event) {
            warn!(request = %request_id, "Status event dropped: {}", e);
        }
    }
}

/// Creates the bounded status channel.
pub fn event_channel() -> (EventSender, mpsc::Receiver<StatusEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    (EventSender { tx }, rx)
}
