// Clawdbot Gateway — Rate Limiter
//
// Fixed-window counter per key with an optional block period once the
// window is exhausted. State lives in a process-local map; `cleanup()`
// drops entries whose window and block have both expired.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_ms: u64,
    /// When set, exhausting the window blocks the key for this long.
    pub block_duration_ms: Option<u64>,
}

struct Entry {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

pub struct RateLimiter {
    policy: RateLimitPolicy,
    entries: Mutex<HashMap<String, Entry>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        RateLimiter { policy, entries: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` if the request is allowed and counts it;
    /// `false` if the key is over its window or currently blocked.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let window = Duration::from_millis(self.policy.window_ms);
        let mut map = self.entries.lock();
        let entry = map
            .entry(key.to_string())
            .or_insert(Entry { count: 0, window_start: now, blocked_until: None });

        if let Some(until) = entry.blocked_until {
            if now < until {
                return false;
            }
            entry.blocked_until = None;
            entry.count = 0;
            entry.window_start = now;
        }

        if now.duration_since(entry.window_start) >= window {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= self.policy.max_requests {
            if let Some(block_ms) = self.policy.block_duration_ms {
                entry.blocked_until = Some(now + Duration::from_millis(block_ms));
            }
            return false;
        }

        entry.count += 1;
        true
    }

    /// Drop entries whose window and block have both expired.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = Duration::from_millis(self.policy.window_ms);
        let mut map = self.entries.lock();
        map.retain(|_, e| {
            let window_live = now.duration_since(e.window_start) < window;
            let block_live = e.blocked_until.map(|u| now < u).unwrap_or(false);
            window_live || block_live
        });
    }

    /// Number of tracked keys (for tests and introspection).
    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64, block_ms: Option<u64>) -> RateLimiter {
        RateLimiter::new(RateLimitPolicy {
            max_requests: max,
            window_ms,
            block_duration_ms: block_ms,
        })
    }

    #[test]
    fn allows_up_to_max_then_denies() {
        let rl = limiter(3, 60_000, None);
        assert!(rl.check("k"));
        assert!(rl.check("k"));
        assert!(rl.check("k"));
        assert!(!rl.check("k"));
        assert!(!rl.check("k"));
    }

    #[test]
    fn keys_are_independent() {
        let rl = limiter(1, 60_000, None);
        assert!(rl.check("a"));
        assert!(!rl.check("a"));
        assert!(rl.check("b"));
    }

    #[test]
    fn window_expiry_resets_count() {
        let rl = limiter(2, 60_000, None);
        let t0 = Instant::now();
        assert!(rl.check_at("k", t0));
        assert!(rl.check_at("k", t0));
        assert!(!rl.check_at("k", t0));
        // One window later the counter starts over.
        let t1 = t0 + Duration::from_millis(60_001);
        assert!(rl.check_at("k", t1));
    }

    #[test]
    fn block_duration_outlasts_window() {
        let rl = limiter(1, 1_000, Some(120_000));
        let t0 = Instant::now();
        assert!(rl.check_at("k", t0));
        assert!(!rl.check_at("k", t0)); // exhausted → blocked
        // Window has passed but the block is still active.
        let t1 = t0 + Duration::from_millis(5_000);
        assert!(!rl.check_at("k", t1));
        // After the block, allowed again.
        let t2 = t0 + Duration::from_millis(120_001);
        assert!(rl.check_at("k", t2));
    }

    #[test]
    fn never_exceeds_max_in_a_window() {
        let rl = limiter(5, 60_000, None);
        let t0 = Instant::now();
        let allowed = (0..20).filter(|_| rl.check_at("k", t0)).count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn cleanup_drops_expired_entries() {
        let rl = limiter(1, 1, None);
        assert!(rl.check("gone"));
        std::thread::sleep(Duration::from_millis(5));
        rl.cleanup();
        assert_eq!(rl.tracked_keys(), 0);
    }
}
