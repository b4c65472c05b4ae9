use parking_lot::RwLock;
use std::collections::HashMap;

use crate::auth::now_ms;

/// Entries idle longer than this are dropped by the lazy cleanup
const STALE_WINDOW_MS: u64 = 30 * 60 * 1000;
const CLEANUP_CHECK_INTERVAL_MS: u64 = 60 * 1000;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub initial_score: f64,
    pub success_reward: f64,
    /// Negative: applied on 429
    pub rate_limit_penalty: f64,
    /// Negative: applied on other errors
    pub failure_penalty: f64,
    pub recovery_rate_per_hour: f64,
    pub min_usable: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            initial_score: 70.0,
            success_reward: 5.0,
            rate_limit_penalty: -20.0,
            failure_penalty: -10.0,
            recovery_rate_per_hour: 10.0,
            min_usable: 50.0,
        }
    }
}

#[derive(Debug, Clone)]
struct HealthState {
    score: f64,
    last_update: u64,
}

/// Soft per-account health score (0..100) feeding hybrid selection.
/// Scores recover passively over time so a briefly-broken account is not
/// penalized forever.
pub struct HealthTracker {
    config: HealthConfig,
    state: RwLock<HashMap<String, HealthState>>,
    last_cleanup: RwLock<u64>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            last_cleanup: RwLock::new(now_ms()),
        }
    }

    pub fn record_success(&self, key: &str) {
        self.adjust(key, self.config.success_reward, now_ms());
    }

    pub fn record_rate_limited(&self, key: &str) {
        self.adjust(key, self.config.rate_limit_penalty, now_ms());
    }

    pub fn record_failure(&self, key: &str) {
        self.adjust(key, self.config.failure_penalty, now_ms());
    }

    pub fn score(&self, key: &str) -> f64 {
        self.score_at(key, now_ms())
    }

    pub fn is_usable(&self, key: &str) -> bool {
        self.score(key) >= self.config.min_usable
    }

    fn adjust(&self, key: &str, delta: f64, now: u64) {
        self.maybe_cleanup(now);
        let mut state_map = self.state.write();
        let current = match state_map.get(key) {
            Some(state) => recovered_score(state, &self.config, now),
            None => self.config.initial_score,
        };
        let score = (current + delta).clamp(0.0, 100.0);
        state_map.insert(
            key.to_string(),
            HealthState {
                score,
                last_update: now,
            },
        );
    }

    fn score_at(&self, key: &str, now: u64) -> f64 {
        self.maybe_cleanup(now);
        let state_map = self.state.read();
        match state_map.get(key) {
            Some(state) => recovered_score(state, &self.config, now),
            None => self.config.initial_score,
        }
    }

    /// Lazy cleanup behind a per-minute check
    fn maybe_cleanup(&self, now: u64) {
        {
            let last = self.last_cleanup.read();
            if now.saturating_sub(*last) < CLEANUP_CHECK_INTERVAL_MS {
                return;
            }
        }
        *self.last_cleanup.write() = now;
        self.state
            .write()
            .retain(|_, s| now.saturating_sub(s.last_update) < STALE_WINDOW_MS);
    }

    #[cfg(test)]
    fn backdate(&self, key: &str, ms: u64) {
        let mut state_map = self.state.write();
        if let Some(state) = state_map.get_mut(key) {
            state.last_update = state.last_update.saturating_sub(ms);
        }
    }
}

fn recovered_score(state: &HealthState, config: &HealthConfig, now: u64) -> f64 {
    let hours = now.saturating_sub(state.last_update) as f64 / 3_600_000.0;
    (state.score + hours * config.recovery_rate_per_hour).clamp(0.0, 100.0)
}

#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    pub max_tokens: f64,
    pub regen_per_minute: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            max_tokens: 50.0,
            regen_per_minute: 6.0,
        }
    }
}

#[derive(Debug, Clone)]
struct BucketState {
    tokens: f64,
    last_update: u64,
}

/// Per-account token bucket bounding burst dispatch under hybrid selection.
pub struct TokenBucketTracker {
    config: TokenBucketConfig,
    state: RwLock<HashMap<String, BucketState>>,
    last_cleanup: RwLock<u64>,
}

impl TokenBucketTracker {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            last_cleanup: RwLock::new(now_ms()),
        }
    }

    /// Take `cost` tokens; false when the bucket cannot cover it.
    pub fn consume(&self, key: &str, cost: f64) -> bool {
        let now = now_ms();
        self.maybe_cleanup(now);
        let mut state_map = self.state.write();
        let mut tokens = match state_map.get(key) {
            Some(state) => regenerated(state, &self.config, now),
            None => self.config.max_tokens,
        };

        if tokens < cost {
            state_map.insert(
                key.to_string(),
                BucketState {
                    tokens,
                    last_update: now,
                },
            );
            return false;
        }

        tokens -= cost;
        state_map.insert(
            key.to_string(),
            BucketState {
                tokens,
                last_update: now,
            },
        );
        true
    }

    /// Return tokens to the bucket, clamped to the maximum.
    pub fn refund(&self, key: &str, amount: f64) {
        let now = now_ms();
        let mut state_map = self.state.write();
        let tokens = match state_map.get(key) {
            Some(state) => regenerated(state, &self.config, now),
            None => self.config.max_tokens,
        };
        state_map.insert(
            key.to_string(),
            BucketState {
                tokens: (tokens + amount).min(self.config.max_tokens),
                last_update: now,
            },
        );
    }

    pub fn available(&self, key: &str) -> f64 {
        let now = now_ms();
        let state_map = self.state.read();
        match state_map.get(key) {
            Some(state) => regenerated(state, &self.config, now),
            None => self.config.max_tokens,
        }
    }

    pub fn has_tokens(&self, key: &str) -> bool {
        self.available(key) >= 1.0
    }

    /// Fraction of the bucket remaining, 0..1
    pub fn ratio(&self, key: &str) -> f64 {
        if self.config.max_tokens <= 0.0 {
            return 0.0;
        }
        self.available(key) / self.config.max_tokens
    }

    fn maybe_cleanup(&self, now: u64) {
        {
            let last = self.last_cleanup.read();
            if now.saturating_sub(*last) < CLEANUP_CHECK_INTERVAL_MS {
                return;
            }
        }
        *self.last_cleanup.write() = now;
        self.state
            .write()
            .retain(|_, s| now.saturating_sub(s.last_update) < STALE_WINDOW_MS);
    }

    #[cfg(test)]
    fn backdate(&self, key: &str, ms: u64) {
        let mut state_map = self.state.write();
        if let Some(state) = state_map.get_mut(key) {
            state.last_update = state.last_update.saturating_sub(ms);
        }
    }
}

fn regenerated(state: &BucketState, config: &TokenBucketConfig, now: u64) -> f64 {
    let minutes = now.saturating_sub(state.last_update) as f64 / 60_000.0;
    (state.tokens + minutes * config.regen_per_minute).min(config.max_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_score_is_70() {
        let tracker = HealthTracker::new(HealthConfig::default());
        assert_eq!(tracker.score("fresh"), 70.0);
        assert!(tracker.is_usable("fresh"));
    }

    #[test]
    fn test_success_and_penalties() {
        let tracker = HealthTracker::new(HealthConfig::default());

        tracker.record_success("a");
        assert_eq!(tracker.score("a"), 75.0);

        tracker.record_rate_limited("a");
        assert_eq!(tracker.score("a"), 55.0);

        tracker.record_failure("a");
        assert_eq!(tracker.score("a"), 45.0);
        assert!(!tracker.is_usable("a"));
    }

    #[test]
    fn test_score_clamped_to_bounds() {
        let tracker = HealthTracker::new(HealthConfig::default());
        for _ in 0..20 {
            tracker.record_success("hi");
        }
        assert_eq!(tracker.score("hi"), 100.0);

        for _ in 0..20 {
            tracker.record_rate_limited("lo");
        }
        assert_eq!(tracker.score("lo"), 0.0);
    }

    #[test]
    fn test_passive_recovery_per_hour() {
        let tracker = HealthTracker::new(HealthConfig::default());
        for _ in 0..3 {
            tracker.record_rate_limited("a");
        }
        let before = tracker.score("a");

        // Two hours idle: +20 points at the default recovery rate
        tracker.backdate("a", 2 * 3_600_000);
        let after = tracker.score("a");
        assert!((after - before - 20.0).abs() < 0.01, "got {after} from {before}");
    }

    #[test]
    fn test_bucket_consume_and_refund() {
        let bucket = TokenBucketTracker::new(TokenBucketConfig::default());

        assert!(bucket.consume("a", 1.0));
        assert!((bucket.available("a") - 49.0).abs() < 0.01);

        bucket.refund("a", 1.0);
        assert!((bucket.available("a") - 50.0).abs() < 0.01);

        // Refund never exceeds max
        bucket.refund("a", 100.0);
        assert!((bucket.available("a") - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_bucket_refuses_when_empty() {
        let bucket = TokenBucketTracker::new(TokenBucketConfig {
            max_tokens: 2.0,
            regen_per_minute: 0.0,
        });

        assert!(bucket.consume("a", 1.0));
        assert!(bucket.consume("a", 1.0));
        assert!(!bucket.consume("a", 1.0));
        assert!(!bucket.has_tokens("a"));
    }

    #[test]
    fn test_bucket_regenerates_over_time() {
        let bucket = TokenBucketTracker::new(TokenBucketConfig::default());
        for _ in 0..50 {
            assert!(bucket.consume("a", 1.0));
        }
        assert!(!bucket.consume("a", 1.0));

        // 10 minutes at 6/min regenerates 60, clamped to 50
        bucket.backdate("a", 10 * 60_000);
        assert!((bucket.available("a") - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_bucket_ratio() {
        let bucket = TokenBucketTracker::new(TokenBucketConfig {
            max_tokens: 50.0,
            regen_per_minute: 0.0,
        });
        assert!((bucket.ratio("a") - 1.0).abs() < f64::EPSILON);
        for _ in 0..25 {
            bucket.consume("a", 1.0);
        }
        assert!((bucket.ratio("a") - 0.5).abs() < 0.01);
    }
}
