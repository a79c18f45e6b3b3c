//! In-process limiter state in a sharded map. `DashMap::entry` holds the shard lock for the
//! duration of one check, so a key is never updated by two requests at once, and keys on
//! other shards proceed in parallel.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::{
    Decision, FixedWindow, RateKey, RateLimitConfig, RateLimitError, RateLimitStore, TokenBucket,
};

#[derive(Debug, Clone)]
enum LimiterState {
    Bucket(TokenBucket),
    Window(FixedWindow),
}

#[derive(Debug, Clone)]
struct Entry {
    state: LimiterState,
    last_seen: Instant,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<RateKey, Entry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn fresh_state(policy: &RateLimitConfig, now: Instant) -> Option<LimiterState> {
    match policy {
        RateLimitConfig::TokenBucket { capacity, .. } => {
            Some(LimiterState::Bucket(TokenBucket::new(*capacity, now)))
        }
        RateLimitConfig::FixedWindow { .. } => Some(LimiterState::Window(FixedWindow::new(now))),
        RateLimitConfig::Unlimited => None,
    }
}

impl RateLimitStore for InMemoryStore {
    fn check(
        &self,
        key: &RateKey,
        policy: &RateLimitConfig,
        now: Instant,
    ) -> Result<Decision, RateLimitError> {
        let Some(initial) = fresh_state(policy, now) else {
            return Ok(Decision::Allow);
        };
        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
            state: initial.clone(),
            last_seen: now,
        });
        entry.last_seen = now;

        // A policy change between restarts of the same key (e.g. config reload) starts over.
        let kind_matches = matches!(
            (&entry.state, policy),
            (LimiterState::Bucket(_), RateLimitConfig::TokenBucket { .. })
                | (LimiterState::Window(_), RateLimitConfig::FixedWindow { .. })
        );
        if !kind_matches {
            entry.state = initial;
        }

        let decision = match (&mut entry.state, policy) {
            (
                LimiterState::Bucket(bucket),
                RateLimitConfig::TokenBucket {
                    capacity,
                    refill_per_sec,
                },
            ) => bucket.try_acquire(*capacity, *refill_per_sec, now),
            (
                LimiterState::Window(window),
                RateLimitConfig::FixedWindow {
                    window_ms,
                    max_requests,
                },
            ) => window.try_acquire(Duration::from_millis(*window_ms), *max_requests, now),
            _ => {
                return Err(RateLimitError::Store(format!(
                    "state mismatch for {}/{}",
                    key.actor, key.command
                )))
            }
        };
        Ok(decision)
    }

    fn prune_idle(&self, now: Instant, idle: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_seen) < idle);
        before.saturating_sub(self.entries.len())
    }
}
