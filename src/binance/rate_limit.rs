// =============================================================================
// Rate-Limit Tracker — request weight against Binance's 1-minute budget
// =============================================================================
//
// Binance allows 1200 request weight per minute per IP; we hard-cap ourselves
// at 1000 so a burst of cold-symbol backfills cannot get the relay banned.
//
// The tracker reads the `X-MBX-USED-WEIGHT-1M` response header after every
// request.  The reading belongs to the minute it was taken in; once that
// minute has passed the budget is considered fresh again.
// =============================================================================

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tracing::{debug, warn};

use crate::types::now_ms;

const WEIGHT_HEADER: &str = "X-MBX-USED-WEIGHT-1M";
/// Hard ceiling at which we refuse to send additional requests.
pub const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

const MINUTE_MS: i64 = 60_000;

/// Thread-safe weight tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    /// Minute (epoch ms / 60 000) in which `used_weight_1m` was observed.
    observed_minute: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub hard_limit: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            observed_minute: AtomicI64::new(0),
        }
    }

    /// Update the weight counter from the headers of a Binance response.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let weight = headers
            .get(WEIGHT_HEADER)
            .and_then(|val| val.to_str().ok())
            .and_then(|s| s.trim().parse::<u32>().ok());

        if let Some(w) = weight {
            self.record_weight(w, now_ms());
        }
    }

    fn record_weight(&self, weight: u32, at_ms: i64) {
        let prev = self.used_weight_at(at_ms);
        self.used_weight_1m.store(weight, Ordering::Relaxed);
        self.observed_minute.store(at_ms / MINUTE_MS, Ordering::Relaxed);

        if weight >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = weight, "rate-limit weight updated from header");
    }

    fn used_weight_at(&self, at_ms: i64) -> u32 {
        if self.observed_minute.load(Ordering::Relaxed) != at_ms / MINUTE_MS {
            return 0;
        }
        self.used_weight_1m.load(Ordering::Relaxed)
    }

    /// Return `true` if we can afford to spend `weight` more request weight
    /// without exceeding the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        self.can_send_at(weight, now_ms())
    }

    fn can_send_at(&self, weight: u32, at_ms: i64) -> bool {
        let current = self.used_weight_at(at_ms);
        let allowed = current.saturating_add(weight) <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked, would exceed rate limit"
            );
        }
        allowed
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_at(now_ms()),
            hard_limit: WEIGHT_HARD_LIMIT,
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("observed_minute", &self.observed_minute.load(Ordering::Relaxed))
            .finish()
    }
}
