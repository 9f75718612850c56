//! Per-key fixed-window rate limiting with a burst cap.
//!
//! Each key (canonically `consumer:server`) gets its own 60-second window,
//! created lazily on first access and recreated once expired. Stale windows
//! are swept by a background task; correctness never depends on the sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::RateLimitConfig;

/// Window length for admission accounting.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Admissions left in the current window (0 when rejected).
    pub remaining: u32,
    /// When the current window resets.
    pub reset_at: Instant,
}

struct Window {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window rate limiter with per-key isolation.
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    default_per_minute: u32,
    burst_multiplier: f64,
}

impl RateLimiter {
    /// Create a limiter from the `rate_limit` configuration section.
    pub fn new(config: &RateLimitConfig) -> Self {
        info!(
            per_minute = config.per_minute,
            burst_multiplier = config.burst_multiplier,
            "rate limiter configured"
        );
        Self {
            windows: DashMap::new(),
            default_per_minute: config.per_minute,
            burst_multiplier: config.burst_multiplier,
        }
    }

    /// Admit or reject one request on `key`.
    ///
    /// The effective limit is the caller override when present, otherwise the
    /// configured default; the admission cap is `ceil(limit × burst)`.
    pub fn check(&self, key: &str, override_per_minute: Option<u32>) -> RateDecision {
        let limit = override_per_minute.unwrap_or(self.default_per_minute);
        let cap = cap_for(limit, self.burst_multiplier);
        let now = Instant::now();

        let mut window = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            count: 0,
            reset_at: now + WINDOW,
        });
        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + WINDOW;
        }

        if window.count >= cap {
            debug!(key, cap, "rate limit exceeded");
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_at: window.reset_at,
            };
        }

        window.count += 1;
        RateDecision {
            allowed: true,
            remaining: cap - window.count,
            reset_at: window.reset_at,
        }
    }

    /// Drop expired windows. Returns the number removed.
    pub fn cleanup_stale(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| now < window.reset_at);
        let removed = before - self.windows.len();
        if removed > 0 {
            debug!(removed, remaining = self.windows.len(), "swept expired rate windows");
        }
        removed
    }

    /// Number of live windows.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Spawn a background sweep that runs every window length and stops when
    /// the token is cancelled.
    pub fn spawn_cleanup_task(self: &Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WINDOW);
            tick.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        limiter.cleanup_stale();
                    }
                    _ = shutdown.cancelled() => {
                        debug!("rate limiter sweep task shutting down");
                        break;
                    }
                }
            }
        });
    }
}

fn cap_for(limit: u32, burst_multiplier: f64) -> u32 {
    (f64::from(limit) * burst_multiplier).ceil() as u32
}
