//! Per-subject sliding-window rate limiting.
//!
//! Each subject keeps a deque of request instants inside a fixed 60-second
//! window. The effective cap is the subject's override (if any) or the
//! global requests-per-minute, plus a global burst allowance. State is
//! process-local and in-memory.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Fixed window length.
const WINDOW: Duration = Duration::from_secs(60);

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateCheck {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests counted in the window (including this one when allowed).
    pub used: u32,
    /// Effective cap for this subject (0 means unlimited).
    pub limit: u32,
    /// Seconds until the oldest windowed request expires; 0 when allowed.
    pub retry_after_secs: u64,
}

/// In-memory sliding-window limiter.
pub struct RateLimiter {
    /// Global requests-per-minute; `None` disables limiting entirely.
    global_rpm: Option<u32>,
    /// Extra requests tolerated above the per-minute cap.
    burst: u32,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(global_rpm: Option<u32>, burst: u32) -> Self {
        Self {
            global_rpm,
            burst,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// A limiter that allows everything.
    pub fn unlimited() -> Self {
        Self::new(None, 0)
    }

    /// Check (and consume a slot from) the window for `subject`.
    ///
    /// `override_rpm` is the per-subject cap carried by an API key, taking
    /// precedence over the global setting.
    pub async fn check(&self, subject: &str, override_rpm: Option<u32>) -> RateCheck {
        let rpm = match override_rpm.or(self.global_rpm) {
            Some(rpm) => rpm,
            None => {
                return RateCheck {
                    allowed: true,
                    used: 0,
                    limit: 0,
                    retry_after_secs: 0,
                }
            }
        };
        let cap = rpm.saturating_add(self.burst);

        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(subject.to_string()).or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) >= WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if (window.len() as u32) < cap {
            window.push_back(now);
            let used = window.len() as u32;
            debug!(subject, used, limit = cap, "Rate limit check: allowed");
            RateCheck {
                allowed: true,
                used,
                limit: cap,
                retry_after_secs: 0,
            }
        } else {
            let oldest = *window.front().expect("full window has a front");
            let elapsed = now.duration_since(oldest);
            let remaining = WINDOW.saturating_sub(elapsed);
            let retry_after = remaining.as_secs_f64().ceil() as u64;
            let retry_after = retry_after.max(1);
            debug!(
                subject,
                limit = cap,
                retry_after_secs = retry_after,
                "Rate limit check: exceeded"
            );
            RateCheck {
                allowed: false,
                used: window.len() as u32,
                limit: cap,
                retry_after_secs: retry_after,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
