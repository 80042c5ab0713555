// =============================================================================
// Webhook secrets and admin tokens — constant-time checks, rate limiting
// =============================================================================
//
// Both the per-user webhook secret and the operator admin token are compared
// in constant time: the comparison examines every byte even after a mismatch
// so response timing reveals nothing about the expected value.
//
// The rate limiter is per-process and intentionally simple: an atomic counter
// over a fixed one-minute window. It protects the gateway itself, not any
// per-user quota (those live in the risk engine).
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

// ---------------------------------------------------------------------------
// Constant-time comparison
// ---------------------------------------------------------------------------

/// Compare two byte slices in constant time. The comparison examines every
/// byte of equal-length inputs even when a mismatch is found early. A length
/// difference is observable, which is acceptable here: the attacker does not
/// control the expected secret's length.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Validate a presented admin token against the configured one.
pub fn admin_token_valid(presented: Option<&str>, expected: &str) -> bool {
    if expected.is_empty() {
        warn!("admin token is not configured — rejecting all authenticated probes");
        return false;
    }
    match presented {
        Some(token) => constant_time_eq(token.as_bytes(), expected.as_bytes()),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Per-process rate limiter
// ---------------------------------------------------------------------------

/// Fixed-window request limiter backed by atomic counters.
pub struct WebhookRateLimiter {
    max_per_window: u32,
    window_secs: u64,
    window_start: AtomicU64,
    count: AtomicU32,
}

impl WebhookRateLimiter {
    pub fn new(max_per_window: u32) -> Self {
        Self {
            max_per_window,
            window_secs: 60,
            window_start: AtomicU64::new(Self::now_secs()),
            count: AtomicU32::new(0),
        }
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_secs()
    }

    /// Register one request; `false` means the caller should answer 429.
    pub fn try_acquire(&self) -> bool {
        let now = Self::now_secs();
        let started = self.window_start.load(Ordering::Relaxed);
        if now.saturating_sub(started) >= self.window_secs {
            // New window; last writer wins, which is close enough for a
            // process-local guard.
            self.window_start.store(now, Ordering::Relaxed);
            self.count.store(0, Ordering::Relaxed);
        }

        let current = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if current > self.max_per_window {
            warn!(
                current,
                limit = self.max_per_window,
                "per-process webhook rate limit exceeded"
            );
            return false;
        }
        true
    }
}

impl std::fmt::Debug for WebhookRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookRateLimiter")
            .field("max_per_window", &self.max_per_window)
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish()
    }
}
