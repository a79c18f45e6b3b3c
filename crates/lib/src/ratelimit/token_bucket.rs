//! Token bucket: refill proportional to elapsed time, capped at capacity; each request takes one token.

use std::time::{Duration, Instant};

use super::Decision;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, capacity: u32, refill_per_sec: f64, now: Instant) {
        // A clock that appears to go backwards adds nothing.
        let elapsed = now.saturating_duration_since(self.last_refill);
        let added = elapsed.as_secs_f64() * refill_per_sec;
        self.tokens = (self.tokens + added).clamp(0.0, f64::from(capacity));
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    pub fn try_acquire(&mut self, capacity: u32, refill_per_sec: f64, now: Instant) -> Decision {
        self.refill(capacity, refill_per_sec, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Decision::Allow;
        }
        let missing = (1.0 - self.tokens).max(0.0);
        // Slow refill rates can need more time than a Duration holds.
        let retry_after =
            Duration::try_from_secs_f64(missing / refill_per_sec).unwrap_or(Duration::MAX);
        Decision::Deny { retry_after }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_of_capacity_then_deny() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(3, t0);
        for _ in 0..3 {
            assert_eq!(b.try_acquire(3, 1.0, t0), Decision::Allow);
        }
        match b.try_acquire(3, 1.0, t0) {
            Decision::Deny { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(1));
            }
            Decision::Allow => panic!("fourth request must be denied"),
        }
    }

    #[test]
    fn refills_over_time_and_caps_at_capacity() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(3, t0);
        for _ in 0..3 {
            b.try_acquire(3, 1.0, t0);
        }
        assert_eq!(
            b.try_acquire(3, 1.0, t0 + Duration::from_millis(1000)),
            Decision::Allow
        );
        // An hour later the bucket holds at most `capacity` tokens.
        let later = t0 + Duration::from_secs(3600);
        b.refill(3, 1.0, later);
        assert_eq!(b.tokens(), 3.0);
    }

    #[test]
    fn tokens_never_negative() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(1, t0);
        for _ in 0..100 {
            b.try_acquire(1, 0.5, t0);
            assert!(b.tokens() >= 0.0);
        }
    }

    #[test]
    fn tiny_refill_rate_denies_with_saturated_retry_after() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(1, t0);
        assert_eq!(b.try_acquire(1, 1e-20, t0), Decision::Allow);
        assert_eq!(
            b.try_acquire(1, 1e-20, t0),
            Decision::Deny {
                retry_after: Duration::MAX
            }
        );
    }

    #[test]
    fn earlier_instant_does_not_refill() {
        let t0 = Instant::now() + Duration::from_secs(10);
        let mut b = TokenBucket::new(1, t0);
        assert_eq!(b.try_acquire(1, 1.0, t0), Decision::Allow);
        assert!(!b.try_acquire(1, 1.0, t0 - Duration::from_secs(5)).is_allowed());
    }
}
