//! # passage-dht
//!
//! Kademlia-style peer discovery for the passage connectivity core.
//!
//! Provides:
//! - XOR-metric routing table with per-bucket replacement caches
//! - Iterative node and value lookups over a single UDP socket
//! - Peer announcement storage with TTL expiry
//! - Reflexive address observation and NAT classification
//!
//! ## Lookup Model
//!
//! Lookups are iterative, not recursive: the local node queries the
//! `alpha` closest known contacts, folds their answers into a candidate
//! frontier, and repeats until the `k` closest candidates have all been
//! asked or two rounds pass without finding anyone closer. An empty
//! routing table fails lookups immediately rather than letting callers
//! hang, which keeps the connection orchestrator's tier budget honest.
//!
//! ## Table Hygiene
//!
//! Contacts enter the table only after answering us. Buckets evict
//! stale heads before healthy ones, park overflow in a replacement
//! cache, and cap how many contacts may share one subnet to blunt
//! address-space squatting.
//!
//! ## Example
//!
//! ```ignore
//! use passage_dht::{DhtConfig, DhtNode};
//!
//! let config = DhtConfig::default().with_bootstrap(seeds);
//! let node = DhtNode::bind(local_id, config).await?;
//! let run = node.start();
//! node.bootstrap().await?;
//! let announcement = node.find_peer(peer_id).await?;
//! run.abort();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod contact;
pub mod distance;
pub mod error;
pub mod limiter;
pub mod lookup;
pub mod node;
pub mod routing;
pub mod rpc;

pub use config::DhtConfig;
pub use contact::{Contact, SubnetKey};
pub use distance::{random_id_in_bucket, Distance};
pub use error::{DhtError, Result};
pub use limiter::{RateLimitConfig, RateLimitDecision, RpcRateLimiter};
pub use lookup::Lookup;
pub use node::{DhtNode, DhtStatsSnapshot};
pub use routing::{InsertOutcome, RoutingTable, RoutingTableStats};
pub use rpc::{InboundRpc, RpcSocket, RpcSocketStatsSnapshot};
