//! Per-`(peer, tier)` circuit breakers.
//!
//! A tier that keeps failing against one peer is suppressed for a
//! doubling window instead of being hammered on every request. An open
//! breaker reads as a skipped attempt, never an error.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use passage_proto::{PeerId, Tier};

use crate::config::NetConfig;

#[derive(Clone, Copy, Debug)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    last_event: Instant,
}

/// Failure-driven suppression of tier attempts, keyed by peer and tier.
///
/// All methods take the observation time so tests drive the clock.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    base: Duration,
    max: Duration,
    cooldown: Duration,
    states: Mutex<HashMap<(PeerId, Tier), BreakerState>>,
}

impl CircuitBreaker {
    /// Breaker using the thresholds and windows from `config`.
    pub fn new(config: &NetConfig) -> Self {
        Self {
            threshold: config.failure_threshold,
            base: config.base_backoff,
            max: config.max_backoff,
            cooldown: config.breaker_cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an attempt on this tier may run now.
    ///
    /// A breaker idle past the cooldown forgets its history on the way.
    pub fn check(&self, peer: &PeerId, tier: Tier, now: Instant) -> bool {
        let mut states = self.lock_states();
        let Some(state) = states.get(&(*peer, tier)) else {
            return true;
        };
        if now.duration_since(state.last_event) >= self.cooldown {
            states.remove(&(*peer, tier));
            return true;
        }
        match state.open_until {
            Some(open_until) => now >= open_until,
            None => true,
        }
    }

    /// Records a failed attempt, opening the breaker once the threshold
    /// is reached. The suppression window doubles with each failure
    /// past the threshold, capped at the configured maximum.
    pub fn record_failure(&self, peer: &PeerId, tier: Tier, now: Instant) {
        let mut states = self.lock_states();
        let state = states.entry((*peer, tier)).or_insert(BreakerState {
            consecutive_failures: 0,
            open_until: None,
            last_event: now,
        });
        state.consecutive_failures += 1;
        state.last_event = now;
        if state.consecutive_failures >= self.threshold {
            let exp = state
                .consecutive_failures
                .saturating_sub(self.threshold)
                .min(10);
            let backoff = self.base.saturating_mul(1u32 << exp).min(self.max);
            state.open_until = Some(now + backoff);
        }
    }

    /// Records a successful attempt, closing the breaker and clearing
    /// its failure history.
    pub fn record_success(&self, peer: &PeerId, tier: Tier) {
        self.lock_states().remove(&(*peer, tier));
    }

    /// Drops state idle past the cooldown.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut states = self.lock_states();
        let before = states.len();
        states.retain(|_, s| now.duration_since(s.last_event) < self.cooldown);
        before - states.len()
    }

    /// Tracked `(peer, tier)` pairs.
    pub fn len(&self) -> usize {
        self.lock_states().len()
    }

    /// Whether no breaker state is held.
    pub fn is_empty(&self) -> bool {
        self.lock_states().is_empty()
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<(PeerId, Tier), BreakerState>> {
        // Updates are single map entries, so a poisoned lock cannot
        // hold partial state.
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_proto::NodeKeypair;

    fn breaker() -> CircuitBreaker {
        let config = NetConfig::default().with_breaker(
            3,
            Duration::from_secs(30),
            Duration::from_secs(480),
        );
        CircuitBreaker::new(&config)
    }

    #[test]
    fn closed_until_threshold() {
        let breaker = breaker();
        let peer = NodeKeypair::generate().peer_id();
        let t0 = Instant::now();

        breaker.record_failure(&peer, Tier::DirectIpv4, t0);
        breaker.record_failure(&peer, Tier::DirectIpv4, t0);
        assert!(breaker.check(&peer, Tier::DirectIpv4, t0));

        breaker.record_failure(&peer, Tier::DirectIpv4, t0);
        assert!(!breaker.check(&peer, Tier::DirectIpv4, t0));
    }

    #[test]
    fn reopens_after_backoff_window() {
        let breaker = breaker();
        let peer = NodeKeypair::generate().peer_id();
        let t0 = Instant::now();

        for _ in 0..3 {
            breaker.record_failure(&peer, Tier::Relay, t0);
        }
        assert!(!breaker.check(&peer, Tier::Relay, t0 + Duration::from_secs(29)));
        assert!(breaker.check(&peer, Tier::Relay, t0 + Duration::from_secs(30)));
    }

    #[test]
    fn window_doubles_and_caps() {
        let breaker = breaker();
        let peer = NodeKeypair::generate().peer_id();
        let t0 = Instant::now();

        for _ in 0..3 {
            breaker.record_failure(&peer, Tier::HolePunch, t0);
        }
        // Fourth failure: 30s * 2 = 60s window.
        breaker.record_failure(&peer, Tier::HolePunch, t0);
        assert!(!breaker.check(&peer, Tier::HolePunch, t0 + Duration::from_secs(59)));
        assert!(breaker.check(&peer, Tier::HolePunch, t0 + Duration::from_secs(60)));

        for _ in 0..10 {
            breaker.record_failure(&peer, Tier::HolePunch, t0);
        }
        assert!(!breaker.check(&peer, Tier::HolePunch, t0 + Duration::from_secs(479)));
        assert!(breaker.check(&peer, Tier::HolePunch, t0 + Duration::from_secs(480)));
    }

    #[test]
    fn success_resets_history() {
        let breaker = breaker();
        let peer = NodeKeypair::generate().peer_id();
        let t0 = Instant::now();

        for _ in 0..3 {
            breaker.record_failure(&peer, Tier::DirectIpv6, t0);
        }
        breaker.record_success(&peer, Tier::DirectIpv6);
        assert!(breaker.check(&peer, Tier::DirectIpv6, t0));
        assert!(breaker.is_empty());
    }

    #[test]
    fn tiers_are_tracked_independently() {
        let breaker = breaker();
        let peer = NodeKeypair::generate().peer_id();
        let t0 = Instant::now();

        for _ in 0..3 {
            breaker.record_failure(&peer, Tier::DirectIpv4, t0);
        }
        assert!(!breaker.check(&peer, Tier::DirectIpv4, t0));
        assert!(breaker.check(&peer, Tier::Relay, t0));
    }

    #[test]
    fn cooldown_forgets_history() {
        let breaker = breaker();
        let peer = NodeKeypair::generate().peer_id();
        let t0 = Instant::now();

        for _ in 0..3 {
            breaker.record_failure(&peer, Tier::Negotiated, t0);
        }
        let after_cooldown = t0 + Duration::from_secs(10 * 60);
        assert!(breaker.check(&peer, Tier::Negotiated, after_cooldown));
        assert_eq!(breaker.sweep(after_cooldown), 0);
        assert!(breaker.is_empty());
    }
}
