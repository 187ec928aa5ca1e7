//! # Rate Limiter
//!
//! Per-source-IP token bucket consulted by the handshake pump while the
//! device is under load. Buckets refill continuously in nanosecond tokens;
//! short bursts up to the bucket capacity pass, sustained rates above the
//! ceiling are denied in steady state.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Sustained handshakes per second allowed per source IP
const PACKETS_PER_SECOND: u64 = 20;

/// Burst capacity per source IP
const PACKETS_BURSTABLE: u64 = 5;

const NANOS_PER_PACKET: u64 = 1_000_000_000 / PACKETS_PER_SECOND;
const MAX_TOKENS: u64 = NANOS_PER_PACKET * PACKETS_BURSTABLE;

/// Idle buckets are collected after this long
const GC_AFTER: Duration = Duration::from_secs(3);

struct Bucket {
    tokens: u64,
    last: Instant,
}

/// Per-source-IP token bucket limiter
pub struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Charge one packet against `ip`. Returns false when the source has
    /// exhausted its bucket.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        let bucket = buckets.entry(ip).or_insert(Bucket {
            tokens: MAX_TOKENS,
            last: now,
        });

        let elapsed = now.duration_since(bucket.last).as_nanos() as u64;
        bucket.tokens = bucket.tokens.saturating_add(elapsed).min(MAX_TOKENS);
        bucket.last = now;

        if bucket.tokens >= NANOS_PER_PACKET {
            bucket.tokens -= NANOS_PER_PACKET;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle long enough to have refilled completely
    pub fn gc(&self) {
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, bucket| now.duration_since(bucket.last) < GC_AFTER);
    }

    /// Number of tracked sources (tests and diagnostics)
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
