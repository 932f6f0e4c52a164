//! Tiered connection establishment for the passage connectivity core.
//!
//! Given a peer id, this crate finds the cheapest live path to it and
//! hands back an authenticated [`Channel`]:
//!
//! - **Tier ladder**: direct IPv6/IPv4 dials, a signaling-negotiated
//!   path, coordinated UDP hole punching, and TCP relaying through a
//!   volunteer peer, tried in that order by the [`Orchestrator`].
//! - **Store-and-forward**: when no tier lands, payloads rest in the
//!   gossip spool and hop across whatever channels exist until the
//!   destination shows up ([`GossipManager`]).
//! - **Seams**: every inbound path consults one [`Authorizer`]; every
//!   request narrates itself through [`StatusEvent`]s; repeated
//!   failures open a per-peer-per-tier [`CircuitBreaker`].
//!
//! Every channel, whatever produced it, starts with the signed hello
//! exchange, so a peer's identity never depends on the path that
//! reached it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod authorize;
pub mod breaker;
pub mod config;
pub mod direct;
pub mod error;
pub mod events;
pub mod gossip;
mod handshake;
pub mod negotiated;
pub mod orchestrator;
pub mod punch;
pub mod relay;
pub mod transport;

pub use authorize::{AllowAll, Authorizer, Decision, DenyList};
pub use breaker::CircuitBreaker;
pub use config::NetConfig;
pub use direct::{DirectDialer, DirectListener};
pub use error::{ErrorClass, NetError, Result};
pub use events::{event_channel, AttemptState, EventSender, RequestId, StatusEvent};
pub use gossip::{GossipDisposition, GossipManager};
pub use negotiated::{respond_to_offer, NegotiatedDialer, Signaling};
pub use orchestrator::{ConnectOutcome, Orchestrator};
pub use punch::{answer_ticket, PunchDialer, PunchListener};
pub use relay::{RelayDialer, RelayServer, DEFAULT_RELAY_MAX_SESSIONS};
pub use transport::{BoxFuture, Channel, ChannelRegistry, DialTarget, RelayCandidate, TierDialer};
