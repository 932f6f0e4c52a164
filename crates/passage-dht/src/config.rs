//! Configuration for the DHT node.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use passage_proto::limits::{DHT_ALPHA, DHT_K, DHT_RECORD_TTL_SECS};

use crate::error::{DhtError, Result};

/// Default RPC exchange timeout in seconds.
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 5;

/// Default retries after the first RPC attempt.
pub const DEFAULT_RPC_RETRIES: u32 = 2;

/// Default whole-lookup timeout in seconds.
pub const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 30;

/// Default bucket refresh interval in seconds.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60 * 60;

/// Default maintenance tick in seconds.
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 60;

/// Default cap on locally stored records.
pub const DEFAULT_MAX_RECORDS: usize = 1024;

/// Default reflexive-address cache lifetime in seconds.
pub const DEFAULT_OBSERVE_CACHE_SECS: u64 = 5 * 60;

/// Tunables for a [`crate::DhtNode`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    /// UDP bind address for the RPC endpoint.
    pub bind_addr: SocketAddr,

    /// Replication factor: bucket capacity and lookup width.
    pub k: usize,

    /// Parallel queries per lookup round.
    pub alpha: usize,

    /// Timeout for one RPC exchange (per attempt).
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// Retries after the first attempt, with exponential backoff.
    pub rpc_retries: u32,

    /// Deadline for a whole iterative lookup.
    #[serde(with = "humantime_serde")]
    pub lookup_timeout: Duration,

    /// Seed addresses contacted at startup and while the table is empty.
    pub bootstrap: Vec<SocketAddr>,

    /// Buckets unused for this long are refreshed by a random lookup.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Lifetime of locally stored records.
    #[serde(with = "humantime_serde")]
    pub record_ttl: Duration,

    /// Cap on locally stored records.
    pub max_records: usize,

    /// Maintenance loop tick.
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,

    /// How long a reflexive-address observation stays valid.
    #[serde(with = "humantime_serde")]
    pub observe_cache: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().unwrap_or_else(|_| {
                SocketAddr::from(([0, 0, 0, 0], 0))
            }),
            k: DHT_K,
            alpha: DHT_ALPHA,
            rpc_timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
            rpc_retries: DEFAULT_RPC_RETRIES,
            lookup_timeout: Duration::from_secs(DEFAULT_LOOKUP_TIMEOUT_SECS),
            bootstrap: Vec::new(),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            record_ttl: Duration::from_secs(DHT_RECORD_TTL_SECS),
            max_records: DEFAULT_MAX_RECORDS,
            maintenance_interval: Duration::from_secs(DEFAULT_MAINTENANCE_INTERVAL_SECS),
            observe_cache: Duration::from_secs(DEFAULT_OBSERVE_CACHE_SECS),
        }
    }
}

impl DhtConfig {
    /// Configuration with a specific bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Configuration with custom bootstrap seeds.
    pub fn with_bootstrap(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.bootstrap = seeds;
        self
    }

    /// Configuration with a custom RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Configuration with a custom lookup timeout.
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Configuration with custom Kademlia parameters.
    pub fn with_kademlia_params(mut self, k: usize, alpha: usize) -> Self {
        self.k = k;
        self.alpha = alpha;
        self
    }

    /// Validates parameter relationships.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DhtError::LookupFailed("k must be positive".into()));
        }
        if self.alpha == 0 || self.alpha > self.k {
            return Err(DhtError::LookupFailed(
                "alpha must be in 1..=k".into(),
            ));
        }
        if self.max_records == 0 {
            return Err(DhtError::LookupFailed(
                "max_records must be positive".into(),
            ));
        }
        if self.rpc_timeout.is_zero() || self.lookup_timeout.is_zero() {
            return Err(DhtError::LookupFailed(
                "timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        DhtConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_alpha_rejected() {
        let config = DhtConfig::default().with_kademlia_params(20, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn alpha_above_k_rejected() {
        let config = DhtConfig::default().with_kademlia_params(3, 4);
        assert!(config.validate().is_err());
    }

    #[test]
    fn builders_compose() {
        let seed: SocketAddr = "192.0.2.1:4000".parse().unwrap();
        let config = DhtConfig::default()
            .with_bootstrap(vec![seed])
            .with_rpc_timeout(Duration::from_secs(1));
        assert_eq!(config.bootstrap, vec![seed]);
        assert_eq!(config.rpc_timeout, Duration::from_secs(1));
    }
}
