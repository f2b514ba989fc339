//! Adaptive rate limiter for the generation endpoint.
//!
//! Epistemic foundation:
//! - K_i: OpenAI-compatible endpoints return `x-ratelimit-*` headers
//! - K_i: 429 responses require a wait before the next attempt
//! - I^B: Exact limits are unknowable until headers are received
//!
//! Reads `x-ratelimit-*` headers after every response and waits out an
//! exhausted window before the next request. A 429 waits for its
//! `retry-after` when given; otherwise consecutive 429s back off
//! exponentially, capped at 60s.
//!
//! This is the only place a 429 wait happens. The client reports it and
//! sleeps nothing extra.

use dashmap::DashMap;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest server-requested wait honored.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Throttle state for one model.
#[derive(Debug, Default)]
pub struct ThrottleState {
    /// Remaining requests in current window
    pub remaining_requests: Option<u64>,
    /// Remaining tokens in current window
    pub remaining_tokens: Option<u64>,
    /// When the request window resets
    pub reset_requests_at: Option<Instant>,
    /// When the token window resets
    pub reset_tokens_at: Option<Instant>,
    /// Consecutive 429 responses
    pub consecutive_429s: u32,
    /// Backoff until this time
    pub backoff_until: Option<Instant>,
}

impl ThrottleState {
    /// Time to wait before the next request.
    pub fn wait_time(&self, now: Instant) -> Duration {
        let until = |at: Option<Instant>| at.map(|t| t.saturating_duration_since(now));

        let mut wait = until(self.backoff_until).unwrap_or_default();
        if self.remaining_requests == Some(0) {
            wait = wait.max(until(self.reset_requests_at).unwrap_or_default());
        }
        if self.remaining_tokens == Some(0) {
            wait = wait.max(until(self.reset_tokens_at).unwrap_or_default());
        }
        wait
    }

    /// Record a 429 and extend the backoff window.
    ///
    /// `retry_after` from the response wins over the exponential schedule.
    pub fn record_429(&mut self, now: Instant, retry_after: Option<Duration>) {
        self.consecutive_429s += 1;
        let backoff = retry_after.map(|d| d.min(MAX_RETRY_AFTER)).unwrap_or_else(|| {
            Duration::from_secs(2u64.saturating_pow(self.consecutive_429s).min(60))
        });
        self.backoff_until = now.checked_add(backoff);
        warn!(
            consecutive_429s = self.consecutive_429s,
            backoff_secs = backoff.as_secs_f64(),
            "Rate limited (429), backing off"
        );
    }

    /// Record a successful request.
    pub fn record_success(&mut self) {
        self.consecutive_429s = 0;
        self.backoff_until = None;
    }

    /// Update window state from response headers.
    pub fn update_from_headers(&mut self, headers: &HeaderMap, now: Instant) {
        let header = |key: &str| headers.get(key).and_then(|v| v.to_str().ok());

        if let Some(v) = header("x-ratelimit-remaining-requests") {
            self.remaining_requests = v.trim().parse().ok();
        }
        if let Some(v) = header("x-ratelimit-remaining-tokens") {
            self.remaining_tokens = v.trim().parse().ok();
        }
        if let Some(d) = header("x-ratelimit-reset-requests").and_then(parse_reset) {
            self.reset_requests_at = now.checked_add(d);
        }
        if let Some(d) = header("x-ratelimit-reset-tokens").and_then(parse_reset) {
            self.reset_tokens_at = now.checked_add(d);
        }
    }
}

/// Parse a reset header: plain seconds (`"1.5"`) or a duration like `"6m0s"`, `"20ms"`, `"1h2m"`.
pub fn parse_reset(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }

    let mut total = 0.0;
    let mut rest = value;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(split);
        let number: f64 = number.parse().ok().filter(|n: &f64| n.is_finite())?;

        let (scale, tail) = if let Some(t) = tail.strip_prefix("ms") {
            (0.001, t)
        } else if let Some(t) = tail.strip_prefix('h') {
            (3600.0, t)
        } else if let Some(t) = tail.strip_prefix('m') {
            (60.0, t)
        } else if let Some(t) = tail.strip_prefix('s') {
            (1.0, t)
        } else {
            return None;
        };
        total += number * scale;
        rest = tail;
    }
    Duration::try_from_secs_f64(total).ok()
}

/// Per-model adaptive rate limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    states: DashMap<String, ThrottleState>,
    total_429s: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep until `model` may be called again. Returns the time waited.
    pub async fn wait_if_needed(&self, model: &str) -> Duration {
        // Guard dropped before sleeping.
        let wait = self
            .states
            .entry(model.to_string())
            .or_default()
            .wait_time(Instant::now());

        if wait > Duration::ZERO {
            debug!(model = model, wait_ms = wait.as_millis() as u64, "Waiting for rate limit");
            self.total_wait_ms
                .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Record a response status and headers.
    ///
    /// Returns the wait now required before the next request to `model`.
    pub fn record_request(&self, model: &str, status: u16, headers: &HeaderMap) -> Duration {
        let now = Instant::now();
        let mut state = self.states.entry(model.to_string()).or_default();
        state.update_from_headers(headers, now);

        if status == 429 {
            self.total_429s.fetch_add(1, Ordering::Relaxed);
            let retry_after = headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_reset);
            state.record_429(now, retry_after);
        } else if status < 400 {
            state.record_success();
        }
        state.wait_time(now)
    }

    /// Number of 429 responses seen.
    pub fn total_429s(&self) -> u64 {
        self.total_429s.load(Ordering::Relaxed)
    }

    /// Total time spent waiting, in seconds.
    pub fn total_wait_secs(&self) -> f64 {
        self.total_wait_ms.load(Ordering::Relaxed) as f64 / 1000.0
    }
}
