use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Instant;

/// Pre-compiled classifiers for rate-limit error bodies
static CAPACITY_REGEX: LazyLock<regex_lite::Regex> = LazyLock::new(|| {
    regex_lite::Regex::new(r"(?i)capacity|overloaded|server\s+busy|service\s+unavailable")
        .expect("Invalid capacity regex")
});

static QUOTA_REGEX: LazyLock<regex_lite::Regex> = LazyLock::new(|| {
    regex_lite::Regex::new(r"(?i)quota|usage\s+limit|billing|insufficient")
        .expect("Invalid quota regex")
});

static RATE_LIMIT_REGEX: LazyLock<regex_lite::Regex> = LazyLock::new(|| {
    regex_lite::Regex::new(r"(?i)rate\s+limit|too\s+many\s+requests")
        .expect("Invalid rate limit regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    Capacity,
    Quota,
    RateLimit,
    Unknown,
}

impl RateLimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitReason::Capacity => "capacity",
            RateLimitReason::Quota => "quota",
            RateLimitReason::RateLimit => "rate-limit",
            RateLimitReason::Unknown => "unknown",
        }
    }
}

/// Classify a limited response from its status code and body text.
pub fn classify_reason(status: u16, body: &str) -> RateLimitReason {
    if status == 503 || status == 529 || CAPACITY_REGEX.is_match(body) {
        return RateLimitReason::Capacity;
    }
    if QUOTA_REGEX.is_match(body) {
        return RateLimitReason::Quota;
    }
    if RATE_LIMIT_REGEX.is_match(body) {
        return RateLimitReason::RateLimit;
    }
    RateLimitReason::Unknown
}

/// True when a non-429 response still reads as a rate limit.
pub fn body_indicates_rate_limit(status: u16, body: &str) -> bool {
    status == 503 || status == 529 || RATE_LIMIT_REGEX.is_match(body) || QUOTA_REGEX.is_match(body)
}

/// Parse `Retry-After` (seconds or HTTP-date) and `Retry-After-Ms`
/// (milliseconds) headers. The millisecond form wins when both are present.
pub fn parse_retry_after(headers: &hyper::HeaderMap) -> Option<u64> {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        && ms > 0.0
    {
        return Some(ms.ceil() as u64);
    }

    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        if secs > 0.0 {
            return Some((secs * 1000.0).ceil() as u64);
        }
        return None;
    }

    // HTTP-date form
    if let Ok(at) = chrono::DateTime::parse_from_rfc2822(raw) {
        let delta = at.signed_duration_since(chrono::Utc::now());
        if delta.num_milliseconds() > 0 {
            return Some(delta.num_milliseconds() as u64);
        }
    }
    None
}

#[derive(Debug, Clone)]
struct RateLimitState {
    attempt: u32,
    last_at: Instant,
    last_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitBackoff {
    pub attempt: u32,
    pub delay_ms: u64,
    pub is_duplicate: bool,
    pub reason: RateLimitReason,
}

#[derive(Debug, Clone)]
pub struct RateLimitTrackerConfig {
    pub dedup_window_ms: u64,
    pub reset_window_ms: u64,
    pub default_retry_after_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for RateLimitTrackerConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 2_000,
            reset_window_ms: 120_000,
            default_retry_after_ms: 60_000,
            max_backoff_ms: 120_000,
            jitter_max_ms: 1_000,
        }
    }
}

/// Per-quota-key backoff state. Deduplicates the burst of 429s that
/// concurrent in-flight requests produce when one account trips a limit.
pub struct RateLimitTracker {
    config: RateLimitTrackerConfig,
    state: RwLock<HashMap<String, RateLimitState>>,
    last_cleanup: RwLock<Instant>,
}

impl RateLimitTracker {
    pub fn new(config: RateLimitTrackerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Record an observation and compute the backoff for it.
    pub fn get_backoff(
        &self,
        key: &str,
        reason: RateLimitReason,
        retry_after_ms: Option<u64>,
    ) -> RateLimitBackoff {
        self.maybe_cleanup();
        let now = Instant::now();

        {
            let state_map = self.state.read();
            if let Some(state) = state_map.get(key) {
                let elapsed_ms = state.last_at.elapsed().as_millis() as u64;
                if elapsed_ms < self.config.dedup_window_ms {
                    tracing::debug!(
                        key = %key,
                        attempt = state.attempt,
                        delay_ms = state.last_delay_ms,
                        "rate limit within dedup window, is_duplicate=true"
                    );
                    return RateLimitBackoff {
                        attempt: state.attempt,
                        delay_ms: state.last_delay_ms,
                        is_duplicate: true,
                        reason,
                    };
                }
            }
        }

        let mut state_map = self.state.write();

        let attempt = match state_map.get(key) {
            Some(state) if (state.last_at.elapsed().as_millis() as u64) < self.config.reset_window_ms => {
                state.attempt + 1
            }
            _ => 1,
        };

        let base = retry_after_ms.unwrap_or(self.config.default_retry_after_ms);
        let delay_ms = self.calculate_backoff(base, attempt);

        state_map.insert(
            key.to_string(),
            RateLimitState {
                attempt,
                last_at: now,
                last_delay_ms: delay_ms,
            },
        );

        tracing::debug!(
            key = %key,
            attempt = attempt,
            delay_ms = delay_ms,
            reason = reason.as_str(),
            "rate limit backoff calculated"
        );

        RateLimitBackoff {
            attempt,
            delay_ms,
            is_duplicate: false,
            reason,
        }
    }

    /// Drop state after a successful request on the key.
    pub fn clear(&self, key: &str) {
        let mut state_map = self.state.write();
        if state_map.remove(key).is_some() {
            tracing::debug!(key = %key, "cleared rate limit state after success");
        }
    }

    fn calculate_backoff(&self, base: u64, attempt: u32) -> u64 {
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = base.saturating_mul(multiplier).min(self.config.max_backoff_ms);
        delay.saturating_add(jitter(self.config.jitter_max_ms))
    }

    /// Drop keys idle beyond the reset window. Runs at most once per
    /// reset window to keep the common path cheap.
    fn maybe_cleanup(&self) {
        {
            let last = self.last_cleanup.read();
            if (last.elapsed().as_millis() as u64) < self.config.reset_window_ms {
                return;
            }
        }
        let mut last = self.last_cleanup.write();
        *last = Instant::now();
        drop(last);

        let reset_window = self.config.reset_window_ms;
        let mut state_map = self.state.write();
        let before = state_map.len();
        state_map.retain(|_, s| (s.last_at.elapsed().as_millis() as u64) < reset_window);
        let dropped = before - state_map.len();
        if dropped > 0 {
            tracing::debug!(dropped = dropped, "rate limit tracker cleanup");
        }
    }
}

/// Uniform random jitter in [0, max_ms)
fn jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut bytes = [0u8; 8];
    let _ = getrandom::fill(&mut bytes);
    u64::from_le_bytes(bytes) % max_ms
}

pub fn format_duration(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    let mut result = String::new();
    if hours > 0 {
        result.push_str(&hours.to_string());
        result.push('h');
        result.push_str(&mins.to_string());
        result.push('m');
        result.push_str(&secs.to_string());
        result.push('s');
    } else if mins > 0 {
        result.push_str(&mins.to_string());
        result.push('m');
        result.push_str(&secs.to_string());
        result.push('s');
    } else {
        result.push_str(&secs.to_string());
        result.push('s');
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(dedup_ms: u64, reset_ms: u64) -> RateLimitTracker {
        RateLimitTracker::new(RateLimitTrackerConfig {
            dedup_window_ms: dedup_ms,
            reset_window_ms: reset_ms,
            default_retry_after_ms: 60_000,
            max_backoff_ms: 120_000,
            jitter_max_ms: 1_000,
        })
    }

    #[test]
    fn test_classify_reason() {
        assert_eq!(classify_reason(503, ""), RateLimitReason::Capacity);
        assert_eq!(classify_reason(529, ""), RateLimitReason::Capacity);
        assert_eq!(
            classify_reason(429, "model is overloaded"),
            RateLimitReason::Capacity
        );
        assert_eq!(
            classify_reason(429, "service unavailable"),
            RateLimitReason::Capacity
        );
        assert_eq!(
            classify_reason(429, "usage limit reached, check billing"),
            RateLimitReason::Quota
        );
        assert_eq!(
            classify_reason(429, "Rate limit exceeded"),
            RateLimitReason::RateLimit
        );
        assert_eq!(
            classify_reason(429, "Too Many Requests"),
            RateLimitReason::RateLimit
        );
        assert_eq!(classify_reason(429, "mystery"), RateLimitReason::Unknown);
    }

    #[test]
    fn test_retry_after_honored_with_jitter_ceiling() {
        let tracker = tracker(2_000, 120_000);

        // Retry-After: 30 (seconds) -> base 30000ms
        let first = tracker.get_backoff("codex", RateLimitReason::RateLimit, Some(30_000));
        assert_eq!(first.attempt, 1);
        assert!(!first.is_duplicate);
        assert!(
            (30_000..31_000).contains(&first.delay_ms),
            "delay {} outside [30000, 31000)",
            first.delay_ms
        );

        // Second observation within the dedup window: previous values back
        let second = tracker.get_backoff("codex", RateLimitReason::RateLimit, Some(30_000));
        assert!(second.is_duplicate);
        assert_eq!(second.attempt, 1);
        assert_eq!(second.delay_ms, first.delay_ms);
    }

    #[test]
    fn test_attempt_increments_past_dedup_window() {
        let tracker = tracker(50, 120_000);

        let first = tracker.get_backoff("codex", RateLimitReason::RateLimit, Some(30_000));
        assert_eq!(first.attempt, 1);

        std::thread::sleep(std::time::Duration::from_millis(80));

        // Past dedup, within reset: doubled base, jittered
        let third = tracker.get_backoff("codex", RateLimitReason::RateLimit, Some(30_000));
        assert_eq!(third.attempt, 2);
        assert!(!third.is_duplicate);
        assert!(
            (60_000..61_000).contains(&third.delay_ms),
            "delay {} outside [60000, 61000)",
            third.delay_ms
        );
    }

    #[test]
    fn test_attempt_resets_after_reset_window() {
        let tracker = tracker(10, 60);

        assert_eq!(
            tracker
                .get_backoff("k", RateLimitReason::Unknown, Some(1_000))
                .attempt,
            1
        );
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(
            tracker
                .get_backoff("k", RateLimitReason::Unknown, Some(1_000))
                .attempt,
            1
        );
    }

    #[test]
    fn test_backoff_clamped_to_max() {
        let tracker = RateLimitTracker::new(RateLimitTrackerConfig {
            dedup_window_ms: 0,
            reset_window_ms: 120_000,
            default_retry_after_ms: 60_000,
            max_backoff_ms: 120_000,
            jitter_max_ms: 0,
        });

        for expected_attempt in 1..=6 {
            let backoff = tracker.get_backoff("k", RateLimitReason::Unknown, Some(60_000));
            assert_eq!(backoff.attempt, expected_attempt);
            assert!(backoff.delay_ms <= 120_000);
        }
    }

    #[test]
    fn test_default_retry_after_used_when_absent() {
        let tracker = RateLimitTracker::new(RateLimitTrackerConfig {
            jitter_max_ms: 0,
            ..Default::default()
        });
        let backoff = tracker.get_backoff("k", RateLimitReason::Unknown, None);
        assert_eq!(backoff.delay_ms, 60_000);
    }

    #[test]
    fn test_clear_resets_attempt() {
        let tracker = tracker(0, 120_000);
        tracker.get_backoff("k", RateLimitReason::Unknown, Some(1_000));
        tracker.get_backoff("k", RateLimitReason::Unknown, Some(1_000));
        tracker.clear("k");
        assert_eq!(
            tracker
                .get_backoff("k", RateLimitReason::Unknown, Some(1_000))
                .attempt,
            1
        );
    }

    #[test]
    fn test_parse_retry_after_seconds_and_ms() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("retry-after", "30".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(30_000));

        headers.insert("retry-after-ms", "1500".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(1_500));

        let empty = hyper::HeaderMap::new();
        assert_eq!(parse_retry_after(&empty), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5000), "5s");
        assert_eq!(format_duration(65000), "1m5s");
        assert_eq!(format_duration(3665000), "1h1m5s");
    }
}
