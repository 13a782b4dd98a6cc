use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::state::AppState;

/// Maximum API requests per sliding window.
const RATE_LIMIT: usize = 60;
/// Window duration in seconds.
const WINDOW_SECS: u64 = 60;

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Slots left in the window after this request was recorded.
    pub remaining: usize,
    /// Seconds until the oldest marker leaves the window. Zero when allowed.
    pub retry_after: u64,
}

/// Sliding-window request counter. Keys are caller-defined, commonly
/// `user:<id>:<action>` or a hashed Authorization header.
///
/// Markers older than the trailing window are purged lazily on each check.
/// The current request's marker is recorded even when the request is
/// denied, so a client hammering a denied endpoint keeps its window full.
pub struct SlidingWindowLimiter {
    windows: DashMap<String, Vec<u64>>,
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }

    /// Purge stale markers, count the rest, allow if under the limit, and
    /// unconditionally record this attempt.
    pub fn check_and_record(&self, key: &str, limit: usize, window: Duration) -> Decision {
        let now = Self::now_ms();
        let window_ms = window.as_millis() as u64;
        let cutoff = now.saturating_sub(window_ms);

        let mut entry = self.windows.entry(key.to_string()).or_default();
        let markers = entry.value_mut();
        markers.retain(|&ts| ts > cutoff);

        let count = markers.len();
        let allowed = count < limit;
        markers.push(now);

        let retry_after = if allowed {
            0
        } else {
            // Seconds until the oldest surviving marker ages out.
            markers
                .first()
                .map(|&oldest| (oldest + window_ms).saturating_sub(now).div_ceil(1000))
                .unwrap_or(1)
                .max(1)
        };

        Decision {
            allowed,
            remaining: limit.saturating_sub(count + 1),
            retry_after,
        }
    }
}

/// Sliding-window rate limiter keyed by auth header hash or a shared
/// anonymous bucket.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let key = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            let mut hasher = Sha256::new();
            hasher.update(auth.as_bytes());
            format!("auth:{:x}", hasher.finalize())
        })
        .unwrap_or_else(|| "anon".to_string());

    let decision = state.rate_limiter.check_and_record(
        &key,
        RATE_LIMIT,
        Duration::from_secs(WINDOW_SECS),
    );

    if !decision.allowed {
        return AppError::RateLimited {
            retry_after: decision.retry_after,
        }
        .into_response();
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    if let Ok(value) = RATE_LIMIT.to_string().parse() {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = decision.remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", value);
    }
    let reset = chrono::Utc::now().timestamp() + WINDOW_SECS as i64;
    if let Ok(value) = reset.to_string().parse() {
        headers.insert("X-RateLimit-Reset", value);
    }
    response
}
