//! Error types for DHT operations.

use thiserror::Error;

/// Errors that can occur during DHT operations.
#[derive(Error, Debug)]
pub enum DhtError {
    /// The routing table holds no contacts; lookups fail fast instead
    /// of hanging.
    #[error("Routing table is empty")]
    EmptyRoutingTable,

    /// Bootstrap ran but no seed answered.
    #[error("No bootstrap seed responded")]
    NoSeedsResponded,

    /// An RPC exchange exhausted its retries.
    #[error("RPC timed out")]
    Timeout,

    /// A lookup terminated without a usable result.
    #[error("Lookup failed: {0}")]
    LookupFailed(String),

    /// No value stored under the requested key.
    #[error("Value not found")]
    NotFound,

    /// Attempted to insert the local node into its own table.
    #[error("Refusing to insert local node as contact")]
    SelfContact,

    /// A store request was refused by the remote node.
    #[error("Store rejected: {0}")]
    StoreRejected(String),

    /// The remote side rate limited us.
    #[error("Rate limited by remote node")]
    RateLimited,

    /// Wire format error.
    #[error("Protocol error: {0}")]
    Proto(#[from] passage_proto::ProtoError),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;
