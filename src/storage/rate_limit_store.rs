//! Rate & Allow-List Store (C2): per-key token-bucket limiters plus
//! per-proxy IP allow-lists with deadline-based expiry. No global lock on
//! the request path — each key's bucket lives behind its own `DashMap`
//! shard, matching the teacher's `storage/memory.rs` concurrency style.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    /// Refreshed on every use; the reaper deletes buckets whose deadline
    /// has passed (§4.2).
    deadline: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64, cleanup_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: now,
            deadline: now + cleanup_interval,
        }
    }

    fn allow(&mut self, cleanup_interval: Duration) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        self.deadline = now + cleanup_interval;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimitStore {
    buckets: DashMap<String, Mutex<TokenBucket>>,
    allow_list: DashMap<(IpAddr, String), Instant>,
}

impl RateLimitStore {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            allow_list: DashMap::new(),
        }
    }

    /// Admits a request against `key`'s bucket, creating it with `rate`
    /// tokens/sec and `burst` capacity on first use. Returns `false` when
    /// the bucket is empty; callers must respond with 429.
    pub fn allow(&self, key: &str, rate: f64, burst: f64, cleanup_interval: Duration) -> bool {
        let entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(burst, rate, cleanup_interval)));
        let mut bucket = entry.lock().expect("token bucket mutex poisoned");
        bucket.allow(cleanup_interval)
    }

    /// Removes buckets whose refreshed deadline has passed.
    pub fn reap_expired_buckets(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket
                .lock()
                .map(|b| b.deadline > now)
                .unwrap_or(false)
        });
        before - self.buckets.len()
    }

    /// Admits `ip` to `proxy_id`'s private-mode gate for `ttl` (§4.6:
    /// granted after a valid lure landed).
    pub fn allow_list_add(&self, ip: IpAddr, proxy_id: &str, ttl: Duration) {
        self.allow_list
            .insert((ip, proxy_id.to_string()), Instant::now() + ttl);
    }

    pub fn allow_list_is_allowed(&self, ip: IpAddr, proxy_id: &str) -> bool {
        match self.allow_list.get(&(ip, proxy_id.to_string())) {
            Some(expires_at) => *expires_at > Instant::now(),
            None => false,
        }
    }

    pub fn allow_list_clear_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.allow_list.len();
        self.allow_list.retain(|_, expires_at| *expires_at > now);
        before - self.allow_list.len()
    }
}

impl Default for RateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_exhausts_and_refills() {
        let store = RateLimitStore::new();
        let interval = Duration::from_secs(60);
        assert!(store.allow("k", 1000.0, 2.0, interval));
        assert!(store.allow("k", 1000.0, 2.0, interval));
        assert!(!store.allow("k", 1000.0, 2.0, interval), "burst of 2 exhausted");
    }

    #[test]
    fn allow_list_respects_ttl() {
        let store = RateLimitStore::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!store.allow_list_is_allowed(ip, "p1"));
        store.allow_list_add(ip, "p1", Duration::from_secs(600));
        assert!(store.allow_list_is_allowed(ip, "p1"));
        assert!(!store.allow_list_is_allowed(ip, "p2"));
    }
}
