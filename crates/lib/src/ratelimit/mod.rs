//! Per-(actor, command) rate limiting.
//!
//! Two interchangeable algorithms (token bucket, fixed window) selected by
//! [`RateLimitConfig`], globally or per command. State lives behind the
//! [`RateLimitStore`] seam; the in-process store keeps one entry per key in a sharded
//! map so a key is updated atomically and different keys never wait on each other.
//! Any store failure is reported as an error and the caller must treat it as a deny.

mod fixed_window;
mod memory;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use memory::InMemoryStore;
pub use token_bucket::TokenBucket;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Limiting policy. Serialized with an `algorithm` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "camelCase")]
pub enum RateLimitConfig {
    /// `capacity` requests in a burst, refilled continuously at `refillPerSec`.
    #[serde(rename_all = "camelCase")]
    TokenBucket { capacity: u32, refill_per_sec: f64 },
    /// At most `maxRequests` per `windowMs` window.
    #[serde(rename_all = "camelCase")]
    FixedWindow { window_ms: u64, max_requests: u32 },
    /// No limit.
    Unlimited,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig::TokenBucket {
            capacity: 10,
            refill_per_sec: 1.0,
        }
    }
}

impl RateLimitConfig {
    /// Reject policies that could never admit a request or would misbehave numerically.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RateLimitConfig::TokenBucket {
                capacity,
                refill_per_sec,
            } => {
                if *capacity == 0 {
                    return Err("capacity must be greater than zero".into());
                }
                if !refill_per_sec.is_finite() || *refill_per_sec <= 0.0 {
                    return Err("refillPerSec must be a positive number".into());
                }
            }
            RateLimitConfig::FixedWindow {
                window_ms,
                max_requests,
            } => {
                if *window_ms == 0 {
                    return Err("windowMs must be greater than zero".into());
                }
                if *max_requests == 0 {
                    return Err("maxRequests must be greater than zero".into());
                }
            }
            RateLimitConfig::Unlimited => {}
        }
        Ok(())
    }
}

/// State key: one entry per actor and command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub actor: String,
    pub command: String,
}

impl RateKey {
    pub fn new(actor: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            command: command.into(),
        }
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit store unavailable: {0}")]
    Store(String),
    #[error("invalid rate limit policy: {0}")]
    Policy(String),
}

/// Where limiter state lives. Implementations must update a single key atomically.
pub trait RateLimitStore: Send + Sync {
    /// Count one attempt for `key` under `policy` at `now`.
    fn check(
        &self,
        key: &RateKey,
        policy: &RateLimitConfig,
        now: Instant,
    ) -> Result<Decision, RateLimitError>;

    /// Drop entries untouched for at least `idle`. Returns how many were removed.
    fn prune_idle(&self, now: Instant, idle: Duration) -> usize;
}

/// Applies the global policy, or a command's override, against a store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    default_policy: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, default_policy: RateLimitConfig) -> Self {
        Self {
            store,
            default_policy,
        }
    }

    /// In-process limiter with the given global policy.
    pub fn in_memory(default_policy: RateLimitConfig) -> Self {
        Self::new(Arc::new(InMemoryStore::new()), default_policy)
    }

    /// Check `actor` running `command`, using `override_policy` when the command has one.
    pub fn check(
        &self,
        actor: &str,
        command: &str,
        override_policy: Option<&RateLimitConfig>,
    ) -> Result<Decision, RateLimitError> {
        self.check_at(actor, command, override_policy, Instant::now())
    }

    pub fn check_at(
        &self,
        actor: &str,
        command: &str,
        override_policy: Option<&RateLimitConfig>,
        now: Instant,
    ) -> Result<Decision, RateLimitError> {
        let policy = override_policy.unwrap_or(&self.default_policy);
        if let RateLimitConfig::Unlimited = policy {
            return Ok(Decision::Allow);
        }
        policy.validate().map_err(RateLimitError::Policy)?;
        self.store.check(&RateKey::new(actor, command), policy, now)
    }

    pub fn prune_idle(&self, idle: Duration) -> usize {
        self.store.prune_idle(Instant::now(), idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    impl RateLimitStore for BrokenStore {
        fn check(&self, _: &RateKey, _: &RateLimitConfig, _: Instant) -> Result<Decision, RateLimitError> {
            Err(RateLimitError::Store("connection refused".into()))
        }

        fn prune_idle(&self, _: Instant, _: Duration) -> usize {
            0
        }
    }

    #[test]
    fn parses_both_algorithms() {
        let tb: RateLimitConfig =
            serde_json::from_str(r#"{ "algorithm": "tokenBucket", "capacity": 3, "refillPerSec": 1 }"#)
                .unwrap();
        assert_eq!(
            tb,
            RateLimitConfig::TokenBucket {
                capacity: 3,
                refill_per_sec: 1.0
            }
        );
        let fw: RateLimitConfig =
            serde_json::from_str(r#"{ "algorithm": "fixedWindow", "windowMs": 1000, "maxRequests": 5 }"#)
                .unwrap();
        assert_eq!(
            fw,
            RateLimitConfig::FixedWindow {
                window_ms: 1000,
                max_requests: 5
            }
        );
        let un: RateLimitConfig = serde_json::from_str(r#"{ "algorithm": "unlimited" }"#).unwrap();
        assert_eq!(un, RateLimitConfig::Unlimited);
    }

    #[test]
    fn validate_rejects_degenerate_policies() {
        assert!(RateLimitConfig::TokenBucket { capacity: 0, refill_per_sec: 1.0 }.validate().is_err());
        assert!(RateLimitConfig::TokenBucket { capacity: 1, refill_per_sec: 0.0 }.validate().is_err());
        assert!(RateLimitConfig::TokenBucket { capacity: 1, refill_per_sec: f64::NAN }.validate().is_err());
        assert!(RateLimitConfig::FixedWindow { window_ms: 0, max_requests: 1 }.validate().is_err());
        assert!(RateLimitConfig::FixedWindow { window_ms: 10, max_requests: 0 }.validate().is_err());
        assert!(RateLimitConfig::Unlimited.validate().is_ok());
    }

    #[test]
    fn accepted_slow_policy_denies_instead_of_failing() {
        let slow = RateLimitConfig::TokenBucket {
            capacity: 1,
            refill_per_sec: 1e-20,
        };
        assert!(slow.validate().is_ok());
        let limiter = RateLimiter::in_memory(slow);
        let now = Instant::now();
        assert!(limiter.check_at("u1", "c", None, now).unwrap().is_allowed());
        match limiter.check_at("u1", "c", None, now).unwrap() {
            Decision::Deny { retry_after } => assert!(retry_after > Duration::from_secs(3600)),
            Decision::Allow => panic!("second request must be denied"),
        }
    }

    #[test]
    fn store_failure_surfaces_as_error() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), RateLimitConfig::default());
        assert!(matches!(
            limiter.check("u1", "list-items", None),
            Err(RateLimitError::Store(_))
        ));
    }

    #[test]
    fn command_override_takes_precedence() {
        let limiter = RateLimiter::in_memory(RateLimitConfig::Unlimited);
        let strict = RateLimitConfig::FixedWindow {
            window_ms: 60_000,
            max_requests: 1,
        };
        let now = Instant::now();
        assert!(limiter.check_at("u1", "c", Some(&strict), now).unwrap().is_allowed());
        assert!(!limiter.check_at("u1", "c", Some(&strict), now).unwrap().is_allowed());
        assert!(limiter.check_at("u1", "other", None, now).unwrap().is_allowed());
    }
}
