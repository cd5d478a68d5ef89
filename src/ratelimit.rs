//! Distributed sliding-window rate limiter for outbound WhatsApp traffic.
//!
//! Three independent windows per identifier (1s / 60s / 3600s), each an
//! ordered set in the shared store scored by timestamp. `check_limit` evicts
//! entries older than the window and reads cardinality; `increment` appends
//! one entry per window and refreshes a just-over-window TTL.
//!
//! Infrastructure errors fail OPEN: a limiter outage must not block all
//! outbound traffic. Every allow-on-error is logged at error level.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::RateLimitSettings;
use crate::error::CoreResult;
use crate::store::KvStore;

// ─── Windows ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Window {
    suffix: &'static str,
    length_ms: i64,
}

const WINDOWS: [Window; 3] = [
    Window {
        suffix: "1s",
        length_ms: 1_000,
    },
    Window {
        suffix: "1m",
        length_ms: 60_000,
    },
    Window {
        suffix: "1h",
        length_ms: 3_600_000,
    },
];

fn window_key(id: &str, window: &Window) -> String {
    format!("whatsapp:ratelimit:{id}:{}", window.suffix)
}

// ─── Decision ───────────────────────────────────────────────────────────────

/// Result of a limiter check, reported from the most restrictive window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_in_ms: u64,
    pub limit: u32,
}

// ─── Limiter ────────────────────────────────────────────────────────────────

/// Sliding-window limiter over the shared store.
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, settings: RateLimitSettings) -> Self {
        RateLimiter { store, settings }
    }

    fn ceiling(&self, window: &Window) -> u32 {
        match window.suffix {
            "1s" => self.settings.max_per_second,
            "1m" => self.settings.max_per_minute,
            _ => self.settings.max_per_hour,
        }
    }

    /// Check all three windows; the most restrictive failing window decides.
    ///
    /// Store errors yield `allowed = true` (fail-open) with an error log.
    pub async fn check_limit(&self, id: &str) -> LimitDecision {
        match self.try_check(id).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(id, error = %e, "rate limiter store error, failing open");
                LimitDecision {
                    allowed: true,
                    remaining: 0,
                    reset_in_ms: 0,
                    limit: 0,
                }
            }
        }
    }

    async fn try_check(&self, id: &str) -> CoreResult<LimitDecision> {
        let now = Utc::now().timestamp_millis();
        let mut tightest: Option<LimitDecision> = None;

        for window in &WINDOWS {
            let key = window_key(id, window);
            let cutoff = (now - window.length_ms) as f64;
            self.store.zrembyscore(&key, 0.0, cutoff).await?;
            let count = self.store.zcard(&key).await?;
            let limit = self.ceiling(window);

            let decision = LimitDecision {
                allowed: count < limit as u64,
                remaining: (limit as u64).saturating_sub(count),
                reset_in_ms: window.length_ms as u64,
                limit,
            };

            tightest = Some(match tightest {
                None => decision,
                Some(best) => {
                    // A failing window beats an allowing one; among failing
                    // windows the longer reset is the harder constraint,
                    // among allowing ones the fewest remaining sends.
                    if !decision.allowed && (best.allowed || decision.reset_in_ms > best.reset_in_ms)
                    {
                        decision
                    } else if best.allowed && decision.remaining < best.remaining {
                        decision
                    } else {
                        best
                    }
                }
            });
        }

        Ok(tightest.unwrap_or(LimitDecision {
            allowed: true,
            remaining: 0,
            reset_in_ms: 0,
            limit: 0,
        }))
    }

    /// Record one send in every window, refreshing the just-over-window TTL.
    ///
    /// Errors are logged and swallowed; the message was already allowed.
    pub async fn increment(&self, id: &str) {
        let now = Utc::now().timestamp_millis();
        for window in &WINDOWS {
            let key = window_key(id, window);
            let member = format!("{now}:{}", Uuid::new_v4());
            let result = async {
                self.store.zadd(&key, &member, now as f64).await?;
                self.store
                    .expire(&key, Duration::from_millis(window.length_ms as u64 + 1_000))
                    .await
            }
            .await;
            if let Err(e) = result {
                tracing::error!(id, window = window.suffix, error = %e, "rate limiter increment failed");
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
