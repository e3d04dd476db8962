//! Per-IP rate limiting, a global pre-filter ahead of route matching.
//! Fixed one-minute windows; entries are swept periodically.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub per_ip_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            per_ip_per_minute: 100,
        }
    }
}

struct RateLimitEntry {
    count: u32,
    window_start: Instant,
    last_request: Instant,
}

impl RateLimitEntry {
    fn new() -> Self {
        let now = Instant::now();
        RateLimitEntry {
            count: 0,
            window_start: now,
            last_request: now,
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    ip_limits: RwLock<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            config,
            ip_limits: RwLock::new(HashMap::new()),
        }
    }

    /// Check and count one request from `ip`. `Err` means over the limit.
    pub fn check(&self, ip: &str) -> Result<(), RateLimitExceeded> {
        let mut limits = self.ip_limits.write().unwrap();
        let entry = limits
            .entry(ip.to_string())
            .or_insert_with(RateLimitEntry::new);

        let now = Instant::now();
        if now.duration_since(entry.window_start) >= Duration::from_secs(60) {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= self.config.per_ip_per_minute {
            return Err(RateLimitExceeded {
                limit: self.config.per_ip_per_minute,
            });
        }

        entry.count += 1;
        entry.last_request = now;
        Ok(())
    }

    /// Drop entries idle for more than an hour; run from a background task.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.ip_limits
            .write()
            .unwrap()
            .retain(|_, entry| now.duration_since(entry.last_request) < Duration::from_secs(3600));
    }

    pub fn status(&self, ip: &str) -> Option<RateLimitStatus> {
        let limits = self.ip_limits.read().unwrap();
        limits.get(ip).map(|entry| RateLimitStatus {
            count: entry.count,
            window_elapsed: Instant::now().duration_since(entry.window_start),
            limit_per_minute: self.config.per_ip_per_minute,
        })
    }
}

#[derive(Debug)]
pub struct RateLimitExceeded {
    pub limit: u32,
}

impl std::fmt::Display for RateLimitExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rate limit exceeded ({} per minute)", self.limit)
    }
}

impl std::error::Error for RateLimitExceeded {}

#[derive(Debug)]
pub struct RateLimitStatus {
    pub count: u32,
    pub window_elapsed: Duration,
    pub limit_per_minute: u32,
}
