// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-principal rate limiting for background chats.
//!
//! Alert floods must not spawn dozens of expensive RCA investigations.
//! The semantics are counter-with-window (INCR plus expiry): up to N
//! requests per window, counted from the first request in the window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record one request and return whether it is allowed.
    async fn check(&self, user_id: &str) -> bool;
}

pub struct InMemoryRateLimiter {
    max_requests: u32,
    window: Duration,
    counters: Mutex<HashMap<String, (Instant, u32)>>,
}

impl InMemoryRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            counters: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check(&self, user_id: &str) -> bool {
        let mut counters = self.counters.lock().unwrap();
        let now = Instant::now();
        let entry = counters.entry(user_id.to_string()).or_insert((now, 0));
        // Window expired: reset to a fresh window starting now.
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        if entry.1 > self.max_requests {
            warn!(
                user_id,
                count = entry.1,
                max = self.max_requests,
                "background chat rate limited"
            );
            false
        } else {
            debug!(user_id, count = entry.1, max = self.max_requests, "background chat allowed");
            true
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_the_limit_then_blocks() {
        let limiter = InMemoryRateLimiter::new(5, Duration::from_secs(300));
        for _ in 0..5 {
            assert!(limiter.check("u1").await);
        }
        assert!(!limiter.check("u1").await);
        assert!(!limiter.check("u1").await);
    }

    #[tokio::test]
    async fn users_have_independent_windows() {
        let limiter = InMemoryRateLimiter::new(1, Duration::from_secs(300));
        assert!(limiter.check("u1").await);
        assert!(!limiter.check("u1").await);
        assert!(limiter.check("u2").await);
    }

    #[tokio::test]
    async fn window_expiry_resets_the_counter() {
        let limiter = InMemoryRateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check("u1").await);
        assert!(!limiter.check("u1").await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.check("u1").await);
    }
}
