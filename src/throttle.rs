//! Per-origin request spacing.
//!
//! Each origin keeps the instant its next request may start. Callers reserve
//! a slot under the lock and sleep outside it, so concurrent tasks hitting
//! the same origin queue up at `delay` intervals while other origins proceed
//! independently.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

pub struct DomainThrottle {
    delay: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl DomainThrottle {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until a request to `origin` may start. Zero delay never sleeps.
    pub async fn wait(&self, origin: &str) {
        self.wait_at_least(origin, self.delay).await
    }

    /// Like [`wait`](Self::wait), with a per-origin override such as a
    /// robots.txt `Crawl-delay`. The effective spacing is the larger value.
    pub async fn wait_at_least(&self, origin: &str, delay: Duration) {
        let delay = delay.max(self.delay);
        if delay.is_zero() {
            return;
        }

        let start = self.reserve(origin, delay);
        let now = Instant::now();
        if start > now {
            tracing::debug!(origin, wait_ms = (start - now).as_millis() as u64, "throttling");
            tokio::time::sleep_until(start).await;
        }
    }

    /// Claim the next slot for `origin` and return when it begins.
    fn reserve(&self, origin: &str, delay: Duration) -> Instant {
        let now = Instant::now();
        let mut slots = match self.next_slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let start = match slots.get(origin) {
            Some(&next) if next > now => next,
            _ => now,
        };
        slots.insert(origin.to_string(), start + delay);
        start
    }
}
