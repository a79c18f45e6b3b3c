//! Fixed window: count requests per window; deny beyond the maximum until the window rolls over.

use std::time::{Duration, Instant};

use super::Decision;

#[derive(Debug, Clone)]
pub struct FixedWindow {
    window_start: Instant,
    count: u32,
}

impl FixedWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn try_acquire(&mut self, window: Duration, max_requests: u32, now: Instant) -> Decision {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= window {
            // Align to the window grid so long gaps do not shift boundaries.
            let windows = elapsed.as_nanos() / window.as_nanos().max(1);
            let advance = window.as_nanos().saturating_mul(windows);
            self.window_start += Duration::from_nanos(u64::try_from(advance).unwrap_or(u64::MAX));
            self.count = 0;
        }
        if self.count < max_requests {
            self.count += 1;
            return Decision::Allow;
        }
        let window_end = self.window_start + window;
        Decision::Deny {
            retry_after: window_end.saturating_duration_since(now),
        }
    }
}
