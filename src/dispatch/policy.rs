use crate::config::SchedulingMode;

use super::rate_limit::RateLimitBackoff;

/// Waits shorter than this are absorbed in `balance` mode
pub const SHORT_RETRY_THRESHOLD_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Sleep out the backoff on the same account
    Wait { delay_ms: u64 },
    /// Move to the next candidate account
    Switch,
}

#[derive(Debug, Clone)]
pub struct DecisionInputs {
    pub scheduling_mode: SchedulingMode,
    pub account_count: usize,
    pub max_cache_first_wait_ms: u64,
    pub switch_on_first_rate_limit: bool,
}

/// Decide whether a rate-limited call waits on the current account or
/// rotates. Waiting preserves the server-side prompt cache; switching
/// trades it for latency.
pub fn decide(inputs: &DecisionInputs, backoff: &RateLimitBackoff) -> RateLimitDecision {
    if inputs.account_count <= 1 {
        return RateLimitDecision::Wait {
            delay_ms: backoff.delay_ms,
        };
    }

    if inputs.switch_on_first_rate_limit && backoff.attempt <= 1 {
        return RateLimitDecision::Switch;
    }

    match inputs.scheduling_mode {
        SchedulingMode::PerformanceFirst => RateLimitDecision::Switch,
        SchedulingMode::CacheFirst => {
            if backoff.delay_ms <= inputs.max_cache_first_wait_ms {
                RateLimitDecision::Wait {
                    delay_ms: backoff.delay_ms,
                }
            } else {
                RateLimitDecision::Switch
            }
        }
        SchedulingMode::Balance => {
            if backoff.delay_ms <= SHORT_RETRY_THRESHOLD_MS {
                RateLimitDecision::Wait {
                    delay_ms: backoff.delay_ms,
                }
            } else {
                RateLimitDecision::Switch
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::rate_limit::RateLimitReason;

    fn backoff(attempt: u32, delay_ms: u64) -> RateLimitBackoff {
        RateLimitBackoff {
            attempt,
            delay_ms,
            is_duplicate: false,
            reason: RateLimitReason::RateLimit,
        }
    }

    fn inputs(mode: SchedulingMode, count: usize, switch_first: bool) -> DecisionInputs {
        DecisionInputs {
            scheduling_mode: mode,
            account_count: count,
            max_cache_first_wait_ms: 60_000,
            switch_on_first_rate_limit: switch_first,
        }
    }

    #[test]
    fn test_single_account_always_waits() {
        let decision = decide(
            &inputs(SchedulingMode::PerformanceFirst, 1, true),
            &backoff(1, 30_000),
        );
        assert_eq!(decision, RateLimitDecision::Wait { delay_ms: 30_000 });
    }

    #[test]
    fn test_switch_on_first_rate_limit() {
        let decision = decide(
            &inputs(SchedulingMode::CacheFirst, 2, true),
            &backoff(1, 1_000),
        );
        assert_eq!(decision, RateLimitDecision::Switch);

        // Disabled: falls through to the mode policy
        let decision = decide(
            &inputs(SchedulingMode::CacheFirst, 2, false),
            &backoff(1, 1_000),
        );
        assert_eq!(decision, RateLimitDecision::Wait { delay_ms: 1_000 });
    }

    #[test]
    fn test_performance_first_always_switches() {
        let decision = decide(
            &inputs(SchedulingMode::PerformanceFirst, 2, false),
            &backoff(3, 100),
        );
        assert_eq!(decision, RateLimitDecision::Switch);
    }

    #[test]
    fn test_cache_first_waits_under_ceiling() {
        let decision = decide(
            &inputs(SchedulingMode::CacheFirst, 2, false),
            &backoff(2, 59_000),
        );
        assert_eq!(decision, RateLimitDecision::Wait { delay_ms: 59_000 });

        let decision = decide(
            &inputs(SchedulingMode::CacheFirst, 2, false),
            &backoff(2, 61_000),
        );
        assert_eq!(decision, RateLimitDecision::Switch);
    }

    #[test]
    fn test_balance_uses_short_retry_threshold() {
        let decision = decide(
            &inputs(SchedulingMode::Balance, 2, false),
            &backoff(2, 4_000),
        );
        assert_eq!(decision, RateLimitDecision::Wait { delay_ms: 4_000 });

        let decision = decide(
            &inputs(SchedulingMode::Balance, 2, false),
            &backoff(2, 6_000),
        );
        assert_eq!(decision, RateLimitDecision::Switch);
    }
}
