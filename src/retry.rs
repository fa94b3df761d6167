// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Redelivery Delay Computation
//!
//! Pure computation of the delay to apply before a message is redelivered,
//! given the subscriber's retry settings and the attempt number about to be
//! made. No side effects, no I/O.

use crate::settings::{RetryPolicy, RetrySettings};
use std::time::Duration;

/// Computes the redelivery delay for the given attempt number.
///
/// Attempt numbers start at 1. All policies clamp to
/// `settings.max_delay`; arithmetic that would overflow also clamps to
/// `max_delay` rather than wrapping.
///
/// - `Constant`: always `base_delay`.
/// - `Linear`: `min(base_delay * attempt, max_delay)`.
/// - `Exponential`: `min(2^attempt seconds, max_delay)`.
pub fn compute_delay(settings: &RetrySettings, attempt: u32) -> Duration {
    match settings.policy {
        RetryPolicy::Constant => settings.base_delay,

        RetryPolicy::Linear => settings
            .base_delay
            .checked_mul(attempt)
            .map_or(settings.max_delay, |delay| delay.min(settings.max_delay)),

        RetryPolicy::Exponential => 1u64
            .checked_shl(attempt)
            .map_or(settings.max_delay, |secs| {
                Duration::from_secs(secs).min(settings.max_delay)
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(policy: RetryPolicy, base: Duration, max: Duration) -> RetrySettings {
        RetrySettings {
            enabled: true,
            policy,
            base_delay: base,
            max_delay: max,
            max_attempts: None,
        }
    }

    #[test]
    fn constant_ignores_attempt_number() {
        let cfg = settings(
            RetryPolicy::Constant,
            Duration::from_secs(7),
            Duration::from_secs(60),
        );

        for attempt in 1..=10 {
            assert_eq!(compute_delay(&cfg, attempt), Duration::from_secs(7));
        }
    }

    #[test]
    fn linear_scales_with_attempt_and_caps() {
        let cfg = settings(
            RetryPolicy::Linear,
            Duration::from_secs(5),
            Duration::from_secs(11),
        );

        assert_eq!(compute_delay(&cfg, 1), Duration::from_secs(5));
        assert_eq!(compute_delay(&cfg, 2), Duration::from_secs(10));
        assert_eq!(compute_delay(&cfg, 3), Duration::from_secs(11));
        assert_eq!(compute_delay(&cfg, 100), Duration::from_secs(11));
    }

    #[test]
    fn linear_overflow_clamps_to_max() {
        let cfg = settings(
            RetryPolicy::Linear,
            Duration::from_secs(u64::MAX / 2),
            Duration::from_secs(30),
        );

        assert_eq!(compute_delay(&cfg, u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let cfg = settings(
            RetryPolicy::Exponential,
            Duration::from_secs(1),
            Duration::from_secs(15),
        );

        assert_eq!(compute_delay(&cfg, 1), Duration::from_secs(2));
        assert_eq!(compute_delay(&cfg, 2), Duration::from_secs(4));
        assert_eq!(compute_delay(&cfg, 3), Duration::from_secs(8));
        assert_eq!(compute_delay(&cfg, 4), Duration::from_secs(15));
    }

    #[test]
    fn exponential_is_uncapped_below_max() {
        let cfg = settings(
            RetryPolicy::Exponential,
            Duration::from_secs(1),
            Duration::from_secs(1500),
        );

        assert_eq!(compute_delay(&cfg, 10), Duration::from_secs(1024));
    }

    #[test]
    fn exponential_shift_overflow_clamps_to_max() {
        let cfg = settings(
            RetryPolicy::Exponential,
            Duration::from_secs(1),
            Duration::from_secs(900),
        );

        assert_eq!(compute_delay(&cfg, 64), Duration::from_secs(900));
        assert_eq!(compute_delay(&cfg, u32::MAX), Duration::from_secs(900));
    }
}
