//! Per-IP connection rate limiting.
//!
//! Each remote IP gets a token bucket with a configurable rate and burst.
//! A request that finds the bucket empty is denied and arms a cooldown:
//! until the cooldown expires, every further request from that IP is denied
//! regardless of refill. Buckets are held in a map sharded by IP hash, one
//! lock per shard, so concurrent connections from different IPs do not
//! contend.

use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SHARD_COUNT: usize = 16;

/// Default refill rate, in tokens per second.
pub const DEFAULT_RATE: u32 = 10;

/// Default bucket capacity.
pub const DEFAULT_BURST: u32 = 10;

/// Default cooldown penalty after a deny.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Per-IP bucket state. `last_seen` drives eviction; `cooldown_until`
/// blankets all requests after a deny.
#[derive(Debug)]
struct ClientBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
    cooldown_until: Option<Instant>,
}

impl ClientBucket {
    fn new(burst: u32, now: Instant) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: now,
            last_seen: now,
            cooldown_until: None,
        }
    }

    fn refill(&mut self, rate: u32, burst: u32, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate as f64).min(burst as f64);
        self.last_refill = now;
    }
}

/// A concurrent per-IP token-bucket limiter with cooldown.
#[derive(Debug)]
pub struct RateLimiter {
    rate: u32,
    burst: u32,
    cooldown: Duration,
    hasher: RandomState,
    shards: Vec<Mutex<HashMap<IpAddr, ClientBucket>>>,
}

impl RateLimiter {
    /// Creates a limiter with the given rate (tokens per second), burst
    /// (bucket capacity), and cooldown penalty.
    pub fn new(rate: u32, burst: u32, cooldown: Duration) -> Self {
        Self {
            rate,
            burst,
            cooldown,
            hasher: RandomState::new(),
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    /// Creates a limiter with the documented defaults (10 rps, burst 10,
    /// 5 minute cooldown).
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_BURST, DEFAULT_COOLDOWN)
    }

    /// Checks whether a request from `addr` should be allowed.
    pub fn allow_addr(&self, addr: SocketAddr) -> bool {
        self.allow(addr.ip())
    }

    /// Checks whether a request from `ip` should be allowed.
    ///
    /// A limiter with rate 0 or burst 0 is disabled and always allows.
    pub fn allow(&self, ip: IpAddr) -> bool {
        if self.rate == 0 || self.burst == 0 {
            return true;
        }

        let now = Instant::now();
        let mut shard = self.shard(ip).lock().expect("limiter shard poisoned");
        let bucket = shard
            .entry(ip)
            .or_insert_with(|| ClientBucket::new(self.burst, now));

        if let Some(until) = bucket.cooldown_until {
            if now < until {
                return false;
            }
            bucket.cooldown_until = None;
        }

        bucket.refill(self.rate, self.burst, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.last_seen = now;
            true
        } else {
            bucket.cooldown_until = Some(now + self.cooldown);
            false
        }
    }

    /// Evicts buckets whose last allowed request predates `now - max_age`.
    pub fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        for shard in &self.shards {
            let mut shard = shard.lock().expect("limiter shard poisoned");
            shard.retain(|_, bucket| now.duration_since(bucket.last_seen) < max_age);
        }
    }

    /// Number of tracked client buckets.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("limiter shard poisoned").len())
            .sum()
    }

    /// Returns true if no client buckets are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, ip: IpAddr) -> &Mutex<HashMap<IpAddr, ClientBucket>> {
        let index = self.hasher.hash_one(ip) as usize % SHARD_COUNT;
        &self.shards[index]
    }
}

/// Extracts the client IP for rate limiting: the peer TCP address when
/// available, otherwise the host portion of the remote address string.
pub fn client_ip(peer: Option<SocketAddr>, remote: &str) -> Option<IpAddr> {
    if let Some(addr) = peer {
        return Some(addr.ip());
    }

    if let Ok(addr) = remote.parse::<SocketAddr>() {
        return Some(addr.ip());
    }
    remote.rsplit_once(':').map_or_else(
        || remote.parse().ok(),
        |(host, _)| host.trim_matches(['[', ']']).parse().ok(),
    )
}
