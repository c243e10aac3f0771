//! Sliding-window rate limiting keyed by remote address.
//!
//! Per-action windows (session creates, joins, inbound messages) plus a
//! gauge of concurrent connections per address. State lives behind its own
//! mutex at the server level, independent of the registry lock.

use crate::config::Config;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A rate limiter with configurable per-key limits and window duration.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum attempts allowed within the window.
    max_attempts: u32,
    /// Duration of the sliding window.
    window: Duration,
    /// Per-key tracking: key → attempt timestamps.
    entries: HashMap<IpAddr, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Record an attempt if the key is under its limit.
    ///
    /// Returns `Err(retry_after)` when rate-limited: the time until the
    /// oldest counted attempt leaves the window.
    pub fn check_and_record(&mut self, key: IpAddr) -> Result<(), Duration> {
        let now = Instant::now();
        let cutoff = now - self.window;

        let attempts = self.entries.entry(key).or_default();
        attempts.retain(|t| *t > cutoff);

        if attempts.len() as u32 >= self.max_attempts {
            let oldest = attempts.iter().min().copied().unwrap_or(now);
            return Err(self.window.saturating_sub(now - oldest));
        }

        attempts.push(now);
        Ok(())
    }

    /// Garbage-collect expired entries to bound memory.
    pub fn gc(&mut self) {
        let cutoff = Instant::now() - self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| *t > cutoff);
            !attempts.is_empty()
        });
    }
}

/// Pre-configured limits for the signaling server.
#[derive(Debug)]
pub struct ServerRateLimits {
    /// Session creations per address.
    creates: RateLimiter,
    /// Joins per address.
    joins: RateLimiter,
    /// Inbound messages per address.
    messages: RateLimiter,
    /// Live connections per address.
    connections: HashMap<IpAddr, u32>,
    max_connections_per_ip: u32,
}

impl ServerRateLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            creates: RateLimiter::new(config.session_creates_per_hour, Duration::from_secs(3600)),
            joins: RateLimiter::new(config.joins_per_hour, Duration::from_secs(3600)),
            messages: RateLimiter::new(config.messages_per_minute, Duration::from_secs(60)),
            connections: HashMap::new(),
            max_connections_per_ip: config.connections_per_ip,
        }
    }

    pub fn check_create(&mut self, ip: IpAddr) -> Result<(), Duration> {
        self.creates.check_and_record(ip)
    }

    pub fn check_join(&mut self, ip: IpAddr) -> Result<(), Duration> {
        self.joins.check_and_record(ip)
    }

    pub fn check_message(&mut self, ip: IpAddr) -> Result<(), Duration> {
        self.messages.check_and_record(ip)
    }

    /// Claim a connection slot for an address. Callers must pair this with
    /// [`release_connection`](Self::release_connection).
    pub fn try_acquire_connection(&mut self, ip: IpAddr) -> bool {
        let count = self.connections.entry(ip).or_insert(0);
        if *count >= self.max_connections_per_ip {
            return false;
        }
        *count += 1;
        true
    }

    pub fn release_connection(&mut self, ip: IpAddr) {
        if let Some(count) = self.connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.connections.remove(&ip);
            }
        }
    }

    /// Run garbage collection on all windows.
    pub fn gc(&mut self) {
        self.creates.gc();
        self.joins.gc();
        self.messages.gc();
    }
}
