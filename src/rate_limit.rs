use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, warn};

// Rate limit entry - tracks attempts per user+address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub attempts: u32,
    pub last_attempt_at: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateLimitEntry {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            attempts: 1,
            last_attempt_at: now,
            blocked_until: None,
        }
    }
}

/// Sliding window policy: `max_attempts` inside `window` earns a block of
/// `block_duration`, measured from the attempt that reached the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max_attempts: u32,
    pub block_duration: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window: Duration::minutes(15),
            max_attempts: 3,
            block_duration: Duration::minutes(60),
        }
    }
}

// Outcome of a pure read against the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStatus {
    Allowed,
    Blocked { blocked_until: DateTime<Utc> },
}

impl RateLimitStatus {
    pub fn is_blocked(&self) -> bool {
        matches!(self, RateLimitStatus::Blocked { .. })
    }
}

// Composite key "<userId>:<ip>"
pub fn rate_limit_key(user_id: &str, ip: &str) -> String {
    format!("{}:{}", user_id, ip)
}

/// Storage port for rate limit entries.
///
/// The limiter never owns its map; callers decide how long state lives and
/// whether two limiters share it.
pub trait RateLimitStore: Send + Sync + Debug {
    fn get(&self, key: &str) -> Option<RateLimitEntry>;

    fn set(&self, key: String, entry: RateLimitEntry);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Keep entries for which the predicate returns true
    fn retain(&self, keep: &dyn Fn(&str, &RateLimitEntry) -> bool);
}

// In-process store backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, RateLimitEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for MemoryStore {
    fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    fn set(&self, key: String, entry: RateLimitEntry) {
        self.entries.insert(key, entry);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn retain(&self, keep: &dyn Fn(&str, &RateLimitEntry) -> bool) {
        self.entries.retain(|key, entry| keep(key, entry));
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        policy: RateLimitPolicy,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { policy, store, clock }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    fn within_window(&self, entry: &RateLimitEntry, now: DateTime<Utc>) -> bool {
        now - entry.last_attempt_at < self.policy.window
    }

    /// Reports whether `user_id` at `ip` is currently blocked. Never writes.
    ///
    /// A block only holds while the last attempt is still inside the window;
    /// once the window lapses the key is treated as fresh.
    pub fn check(&self, user_id: &str, ip: &str) -> RateLimitStatus {
        let key = rate_limit_key(user_id, ip);
        let now = self.clock.now();

        let Some(entry) = self.store.get(&key) else {
            return RateLimitStatus::Allowed;
        };

        if self.within_window(&entry, now) && entry.attempts >= self.policy.max_attempts {
            if let Some(blocked_until) = entry.blocked_until {
                if now < blocked_until {
                    warn!(
                        key = %key,
                        attempts = entry.attempts,
                        %blocked_until,
                        "Key is rate limited"
                    );
                    return RateLimitStatus::Blocked { blocked_until };
                }
            }
        }

        RateLimitStatus::Allowed
    }

    /// Records one attempt and returns the entry as stored.
    ///
    /// Inside the window the counter grows and reaching `max_attempts` sets a
    /// block from now; outside it (or for an unseen key) the entry restarts at 1.
    pub fn record_attempt(&self, user_id: &str, ip: &str) -> RateLimitEntry {
        let key = rate_limit_key(user_id, ip);
        let now = self.clock.now();

        let next = match self.store.get(&key) {
            Some(existing) if self.within_window(&existing, now) => {
                let attempts = existing.attempts.saturating_add(1);
                let blocked_until = if attempts >= self.policy.max_attempts {
                    // clamps to the latest representable instant
                    Some(
                        now.checked_add_signed(self.policy.block_duration)
                            .unwrap_or(DateTime::<Utc>::MAX_UTC),
                    )
                } else {
                    None
                };
                RateLimitEntry {
                    attempts,
                    last_attempt_at: now,
                    blocked_until,
                }
            }
            // window expired..? reset it
            _ => RateLimitEntry::fresh(now),
        };

        debug!(
            key = %key,
            attempts = next.attempts,
            blocked_until = ?next.blocked_until,
            "Recorded attempt"
        );
        self.store.set(key, next);
        next
    }

    /// Drops entries that can no longer influence a decision: last attempt
    /// outside the window and no block still running. Returns how many went.
    pub fn purge_stale(&self) -> usize {
        let now = self.clock.now();
        let window = self.policy.window;
        let before = self.store.len();

        self.store.retain(&|_: &str, entry: &RateLimitEntry| {
            let in_window = now - entry.last_attempt_at < window;
            let still_blocked = entry.blocked_until.is_some_and(|until| now < until);
            in_window || still_blocked
        });

        let removed = before.saturating_sub(self.store.len());
        if removed > 0 {
            debug!(
                removed,
                remaining = self.store.len(),
                "Purged stale rate limit entries"
            );
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn limiter() -> (RateLimiter, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(
            RateLimitPolicy::default(),
            store.clone(),
            Arc::new(clock.clone()),
        );
        (limiter, clock, store)
    }

    #[test]
    fn unseen_key_is_allowed() {
        let (limiter, _, store) = limiter();
        assert_eq!(limiter.check("alice", "1.2.3.4"), RateLimitStatus::Allowed);
        assert!(store.is_empty());
    }

    #[test]
    fn third_attempt_blocks_for_an_hour() {
        let (limiter, clock, _) = limiter();

        limiter.record_attempt("alice", "1.2.3.4");
        clock.advance(Duration::minutes(2));
        limiter.record_attempt("alice", "1.2.3.4");
        clock.advance(Duration::minutes(2));
        let third_at = clock.now();
        let entry = limiter.record_attempt("alice", "1.2.3.4");

        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.blocked_until, Some(third_at + Duration::minutes(60)));

        clock.advance(Duration::minutes(10));
        assert_eq!(
            limiter.check("alice", "1.2.3.4"),
            RateLimitStatus::Blocked {
                blocked_until: third_at + Duration::minutes(60)
            }
        );
    }

    #[test]
    fn two_attempts_do_not_block() {
        let (limiter, _, _) = limiter();
        limiter.record_attempt("alice", "1.2.3.4");
        let entry = limiter.record_attempt("alice", "1.2.3.4");

        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.blocked_until, None);
        assert!(!limiter.check("alice", "1.2.3.4").is_blocked());
    }

    #[test]
    fn attempt_after_window_resets_and_clears_block() {
        let (limiter, clock, _) = limiter();
        for _ in 0..3 {
            limiter.record_attempt("alice", "1.2.3.4");
        }
        assert!(limiter.check("alice", "1.2.3.4").is_blocked());

        clock.advance(Duration::minutes(16));
        assert!(!limiter.check("alice", "1.2.3.4").is_blocked());

        let entry = limiter.record_attempt("alice", "1.2.3.4");
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.blocked_until, None);
    }

    #[test]
    fn window_boundary_is_exclusive() {
        let (limiter, clock, _) = limiter();
        limiter.record_attempt("alice", "1.2.3.4");
        clock.advance(Duration::minutes(15));

        let entry = limiter.record_attempt("alice", "1.2.3.4");
        assert_eq!(entry.attempts, 1);
    }

    #[test]
    fn check_never_mutates() {
        let (limiter, clock, store) = limiter();
        limiter.record_attempt("alice", "1.2.3.4");
        let before = store.get(&rate_limit_key("alice", "1.2.3.4"));

        clock.advance(Duration::minutes(20));
        for _ in 0..5 {
            limiter.check("alice", "1.2.3.4");
        }

        assert_eq!(store.get(&rate_limit_key("alice", "1.2.3.4")), before);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn attempts_never_decrease_inside_window() {
        let (limiter, clock, _) = limiter();
        let mut last = 0;
        for _ in 0..6 {
            let entry = limiter.record_attempt("alice", "1.2.3.4");
            assert!(entry.attempts > last);
            last = entry.attempts;
            clock.advance(Duration::minutes(1));
        }
    }

    #[test]
    fn huge_block_duration_saturates() {
        let clock = ManualClock::new(start());
        let policy = RateLimitPolicy {
            block_duration: Duration::MAX,
            ..RateLimitPolicy::default()
        };
        let limiter =
            RateLimiter::new(policy, Arc::new(MemoryStore::new()), Arc::new(clock.clone()));

        for _ in 0..2 {
            limiter.record_attempt("alice", "1.2.3.4");
        }
        let entry = limiter.record_attempt("alice", "1.2.3.4");

        assert_eq!(entry.blocked_until, Some(DateTime::<Utc>::MAX_UTC));
        assert!(limiter.check("alice", "1.2.3.4").is_blocked());
    }

    #[test]
    fn keys_are_independent() {
        let (limiter, _, store) = limiter();
        for _ in 0..3 {
            limiter.record_attempt("alice", "1.2.3.4");
        }

        assert!(limiter.check("alice", "1.2.3.4").is_blocked());
        assert!(!limiter.check("alice", "5.6.7.8").is_blocked());
        assert!(!limiter.check("bob", "1.2.3.4").is_blocked());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn purge_keeps_active_blocks() {
        let (limiter, clock, store) = limiter();
        limiter.record_attempt("idle", "unknown");
        for _ in 0..3 {
            limiter.record_attempt("blocked", "unknown");
        }

        clock.advance(Duration::minutes(30));
        assert_eq!(limiter.purge_stale(), 1);
        assert!(store.get(&rate_limit_key("blocked", "unknown")).is_some());

        clock.advance(Duration::minutes(31));
        assert_eq!(limiter.purge_stale(), 1);
        assert!(store.is_empty());
    }
}
