//! Per-IP rate limiting for the RPC endpoint.
//!
//! Token bucket per source address. Repeated violations escalate to a
//! temporary ban; bans expire on their own and state for quiet
//! addresses is swept periodically.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Rate limiter tunables.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained requests per second per address.
    pub requests_per_sec: f64,
    /// Burst capacity per address.
    pub burst: f64,
    /// Violations before an address is banned.
    pub ban_threshold: u32,
    /// Ban duration.
    pub ban_duration: Duration,
    /// Idle state older than this is swept.
    pub idle_expiry: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_sec: 10.0,
            burst: 30.0,
            ban_threshold: 10,
            ban_duration: Duration::from_secs(5 * 60),
            idle_expiry: Duration::from_secs(10 * 60),
        }
    }
}

impl RateLimitConfig {
    /// Configuration with a custom sustained rate.
    pub fn with_requests_per_sec(mut self, rate: f64) -> Self {
        self.requests_per_sec = rate;
        self
    }

    /// Configuration with a custom burst size.
    pub fn with_burst(mut self, burst: f64) -> Self {
        self.burst = burst;
        self
    }

    /// Configuration with a custom ban policy.
    pub fn with_ban(mut self, threshold: u32, duration: Duration) -> Self {
        self.ban_threshold = threshold;
        self.ban_duration = duration;
        self
    }
}

/// Decision for one inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Within budget.
    Allowed,
    /// Over budget; request dropped, violation recorded.
    Limited,
    /// Address is banned.
    Banned,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct AddrState {
    bucket: TokenBucket,
    violations: u32,
    banned_until: Option<Instant>,
    last_activity: Instant,
}

/// Per-address limiter for inbound RPC requests.
#[derive(Debug)]
pub struct RpcRateLimiter {
    config: RateLimitConfig,
    addrs: HashMap<IpAddr, AddrState>,
}

impl RpcRateLimiter {
    /// New limiter with the given policy.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            addrs: HashMap::new(),
        }
    }

    /// Checks one inbound request from `ip`.
    pub fn check(&mut self, ip: IpAddr) -> RateLimitDecision {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&mut self, ip: IpAddr, now: Instant) -> RateLimitDecision {
        let config = self.config.clone();
        let state = self.addrs.entry(ip).or_insert_with(|| AddrState {
            bucket: TokenBucket::new(config.burst, config.requests_per_sec),
            violations: 0,
            banned_until: None,
            last_activity: now,
        });
        state.last_activity = now;

        if let Some(until) = state.banned_until {
            if now < until {
                return RateLimitDecision::Banned;
            }
            state.banned_until = None;
            state.violations = 0;
        }

        if state.bucket.try_consume(now) {
            return RateLimitDecision::Allowed;
        }

        state.violations += 1;
        if state.violations >= config.ban_threshold {
            state.banned_until = Some(now + config.ban_duration);
            return RateLimitDecision::Banned;
        }
        RateLimitDecision::Limited
    }

    /// Drops state for addresses idle longer than the configured expiry.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        let idle = self.config.idle_expiry;
        self.addrs.retain(|_, state| {
            state.banned_until.map(|until| now < until).unwrap_or(false)
                || now.duration_since(state.last_activity) < idle
        });
    }

    /// Tracked address count.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Whether no addresses are tracked.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}
