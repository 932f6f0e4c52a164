//! # passage-store
//!
//! Durable local state for the passage connectivity core.
//!
//! Provides:
//! - Peer directory cache (reachability records with tier hints)
//! - DHT contact snapshot for warm restarts
//! - Gossip envelope spool with ack memory
//!
//! Everything here is advisory. The directory accelerates dialing, the
//! snapshot accelerates bootstrap, and the spool carries messages for
//! offline peers; losing any of it degrades a node to a cold start, never
//! to a wrong answer. All components share one sled database through
//! [`StoreDb`] and take the current unix time as a parameter, so callers
//! own the clock.
//!
//! ```no_run
//! use passage_store::{PeerDirectory, StoreDb};
//! use passage_proto::unix_now;
//! use std::path::Path;
//!
//! let db = StoreDb::open(Path::new("/tmp/passage-db")).unwrap();
//! let directory = PeerDirectory::open(&db, unix_now()).unwrap();
//! assert!(directory.is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod contacts;
pub mod db;
pub mod directory;
pub mod error;
pub mod spool;

pub use contacts::{ContactStore, SavedContact, DEFAULT_SNAPSHOT_MAX_AGE_SECS};
pub use db::StoreDb;
pub use directory::{DirectoryStats, PeerDirectory};
pub use error::{Result, StoreError};
pub use spool::{GossipSpool, SpoolStats, SpooledEnvelope, DEFAULT_SPOOL_CAPACITY};
