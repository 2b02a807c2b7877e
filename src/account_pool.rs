//! Account Pool: selects an `Account` for a (venue, pair) tuple and owns a
//! per-account token-bucket rate limiter.
//!
//! The limiter shape is adapted from a sliding-window
//! `middleware::rate_limit` (`Arc<Mutex<HashMap<K, Entry>>>` guarded by
//! `parking_lot::Mutex`) into a token bucket, since this needs a
//! consumable rate-limit *budget* rather than a request-counting window.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::{Account, MarketPair};

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: std::time::Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self { tokens: capacity, capacity, refill_per_sec, last_refill: std::time::Instant::now() }
    }

    fn try_consume(&mut self, cost: f64) -> bool {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

/// Thread-safe, one instance shared across every caller touching a given
/// account (spec §5 "Shared resources: the per-account rate limiter is a
/// token-bucket, thread-safe; one instance per account").
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { buckets: Mutex::new(HashMap::new()) })
    }

    pub fn register(&self, account: &Account) {
        self.buckets
            .lock()
            .entry(account.id.clone())
            .or_insert_with(|| Bucket::new(account.rate_limit_burst as f64, account.rate_limit_per_sec));
    }

    /// Consumes one unit of budget for `account_id`. Returns `false` when
    /// the bucket is exhausted; the caller (Order Manager) surfaces this
    /// as a transient error feeding the retry path.
    pub fn try_acquire(&self, account_id: &str) -> bool {
        match self.buckets.lock().get_mut(account_id) {
            Some(bucket) => bucket.try_consume(1.0),
            None => true,
        }
    }
}

pub struct AccountPool {
    accounts: HashMap<String, Account>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AccountPool {
    pub fn new(accounts: Vec<Account>) -> Self {
        let rate_limiter = RateLimiter::new();
        let mut by_id = HashMap::with_capacity(accounts.len());
        for account in accounts {
            rate_limiter.register(&account);
            by_id.insert(account.id.clone(), account);
        }
        Self { accounts: by_id, rate_limiter }
    }

    pub fn account_for_venue(&self, pair: &MarketPair, venue: &str) -> Option<&Account> {
        self.accounts.get(pair.account_for(venue))
    }

    pub fn get(&self, account_id: &str) -> Option<&Account> {
        self.accounts.get(account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str) -> Account {
        Account {
            id: id.into(),
            venue: "venue-a".into(),
            credentials: "opaque".into(),
            proxy: None,
            rate_limit_per_sec: 5.0,
            rate_limit_burst: 2,
        }
    }

    #[test]
    fn rate_limiter_exhausts_then_refills() {
        let limiter = RateLimiter::new();
        limiter.register(&account("a1"));

        assert!(limiter.try_acquire("a1"));
        assert!(limiter.try_acquire("a1"));
        assert!(!limiter.try_acquire("a1"));

        std::thread::sleep(std::time::Duration::from_millis(250));
        assert!(limiter.try_acquire("a1"));
    }

    #[test]
    fn unregistered_account_is_not_rate_limited() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            assert!(limiter.try_acquire("unknown"));
        }
    }
}
