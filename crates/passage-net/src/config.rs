//! Configuration for the connection orchestrator and its tiers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use passage_proto::limits::GOSSIP_FANOUT;
use passage_proto::Tier;

use crate::error::{NetError, Result};

/// Default deadline for the resolution phase in seconds.
pub const DEFAULT_RESOLUTION_DEADLINE_SECS: u64 = 3;

/// Default timeout for one direct dial attempt in seconds.
pub const DEFAULT_DIRECT_TIMEOUT_SECS: u64 = 5;

/// Default timeout for a negotiated attempt in seconds.
pub const DEFAULT_NEGOTIATED_TIMEOUT_SECS: u64 = 10;

/// Default timeout for a hole-punch attempt in seconds.
pub const DEFAULT_PUNCH_TIMEOUT_SECS: u64 = 10;

/// Default timeout for a relay attempt in seconds.
pub const DEFAULT_RELAY_TIMEOUT_SECS: u64 = 10;

/// Default whole-request deadline in seconds.
pub const DEFAULT_REQUEST_DEADLINE_SECS: u64 = 45;

/// Consecutive failures before a breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Base backoff once a breaker opens, in seconds.
pub const DEFAULT_BASE_BACKOFF_SECS: u64 = 30;

/// Backoff ceiling in seconds.
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 480;

/// Idle time after which a breaker's failure history resets, in seconds.
pub const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 10 * 60;

/// Tunables for the [`crate::Orchestrator`] and tier dialers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Deadline for the directory-plus-DHT resolution phase.
    #[serde(with = "humantime_serde")]
    pub resolution_deadline: Duration,

    /// Timeout for one direct TCP dial and handshake.
    #[serde(with = "humantime_serde")]
    pub direct_timeout: Duration,

    /// Timeout for a negotiated offer/answer attempt.
    #[serde(with = "humantime_serde")]
    pub negotiated_timeout: Duration,

    /// Timeout for a coordinated hole punch.
    #[serde(with = "humantime_serde")]
    pub punch_timeout: Duration,

    /// Timeout for relay selection plus registration.
    #[serde(with = "humantime_serde")]
    pub relay_timeout: Duration,

    /// Deadline for the whole connect request before gossip fallback.
    #[serde(with = "humantime_serde")]
    pub request_deadline: Duration,

    /// Consecutive failures before a `(peer, tier)` breaker opens.
    pub failure_threshold: u32,

    /// First suppression window once a breaker opens.
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,

    /// Ceiling on the doubled suppression window.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Idle time after which a breaker forgets its failure history.
    #[serde(with = "humantime_serde")]
    pub breaker_cooldown: Duration,

    /// Connected peers each gossip push fans out to.
    pub gossip_fanout: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            resolution_deadline: Duration::from_secs(DEFAULT_RESOLUTION_DEADLINE_SECS),
            direct_timeout: Duration::from_secs(DEFAULT_DIRECT_TIMEOUT_SECS),
            negotiated_timeout: Duration::from_secs(DEFAULT_NEGOTIATED_TIMEOUT_SECS),
            punch_timeout: Duration::from_secs(DEFAULT_PUNCH_TIMEOUT_SECS),
            relay_timeout: Duration::from_secs(DEFAULT_RELAY_TIMEOUT_SECS),
            request_deadline: Duration::from_secs(DEFAULT_REQUEST_DEADLINE_SECS),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            base_backoff: Duration::from_secs(DEFAULT_BASE_BACKOFF_SECS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            breaker_cooldown: Duration::from_secs(DEFAULT_BREAKER_COOLDOWN_SECS),
            gossip_fanout: GOSSIP_FANOUT,
        }
    }
}

impl NetConfig {
    /// Configuration with a custom resolution deadline.
    pub fn with_resolution_deadline(mut self, deadline: Duration) -> Self {
        self.resolution_deadline = deadline;
        self
    }

    /// Configuration with one timeout applied to every tier.
    pub fn with_tier_timeout(mut self, timeout: Duration) -> Self {
        self.direct_timeout = timeout;
        self.negotiated_timeout = timeout;
        self.punch_timeout = timeout;
        self.relay_timeout = timeout;
        self
    }

    /// Configuration with a custom whole-request deadline.
    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = deadline;
        self
    }

    /// Configuration with custom breaker parameters.
    pub fn with_breaker(mut self, threshold: u32, base: Duration, max: Duration) -> Self {
        self.failure_threshold = threshold;
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Configuration with a custom gossip fanout.
    pub fn with_gossip_fanout(mut self, fanout: usize) -> Self {
        self.gossip_fanout = fanout;
        self
    }

    /// The attempt timeout configured for `tier`.
    pub fn tier_timeout(&self, tier: Tier) -> Duration {
        match tier {
            Tier::DirectIpv6 | Tier::DirectIpv4 => self.direct_timeout,
            Tier::Negotiated => self.negotiated_timeout,
            Tier::HolePunch => self.punch_timeout,
            Tier::Relay => self.relay_timeout,
            Tier::Gossip => self.request_deadline,
        }
    }

    /// Validates parameter relationships.
    pub fn validate(&self) -> Result<()> {
        if self.resolution_deadline.is_zero() || self.request_deadline.is_zero() {
            return Err(NetError::InvalidConfig("deadlines must be non-zero".into()));
        }
        if self.direct_timeout.is_zero()
            || self.negotiated_timeout.is_zero()
            || self.punch_timeout.is_zero()
            || self.relay_timeout.is_zero()
        {
            return Err(NetError::InvalidConfig("tier timeouts must be non-zero".into()));
        }
        if self.failure_threshold == 0 {
            return Err(NetError::InvalidConfig("failure_threshold must be positive".into()));
        }
        if self.base_backoff > self.max_backoff {
            return Err(NetError::InvalidConfig(
                "base_backoff must not exceed max_backoff".into(),
            ));
        }
        if self.gossip_fanout == 0 {
            return Err(NetError::InvalidConfig("gossip_fanout must be positive".into()));
        }
        Ok(())
    }
}
