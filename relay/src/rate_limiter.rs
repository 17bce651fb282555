//! Token-bucket-style submission caps: per-block, per-minute, per-hour (§4.9).
//!
//! Grounded on the teacher's `bounded_cache` module's eviction-at-capacity
//! style of plain, dependency-free bookkeeping; this is new relative to the
//! teacher (the reference operator had no rate limiter), built in the same
//! idiom — small struct, `std::time` for windows, unit-tested in isolation.

use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Outcome of a rate-limit check. A denial breaks the current pass
/// (backpressure) and does not advance cursors (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Denied(RateLimitWindow),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitWindow {
    Block,
    Minute,
    Hour,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    current_block: Option<u64>,
    block_count: u32,
    minute_window_start: Instant,
    minute_count: u32,
    hour_window_start: Instant,
    hour_count: u32,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            current_block: None,
            block_count: 0,
            minute_window_start: now,
            minute_count: 0,
            hour_window_start: now,
            hour_count: 0,
        }
    }

    /// Check whether one more submission is allowed right now, for the given
    /// observed block number. Does not itself record the submission — call
    /// [`RateLimiter::record_submission`] only after the submission actually
    /// happens (so a denied/deferred attestation is not counted).
    pub fn check(&mut self, observed_block: u64) -> RateLimitDecision {
        self.roll_windows(observed_block);

        if self.block_count >= self.config.max_tx_per_block {
            return RateLimitDecision::Denied(RateLimitWindow::Block);
        }
        if self.minute_count >= self.config.max_tx_per_minute {
            return RateLimitDecision::Denied(RateLimitWindow::Minute);
        }
        if self.hour_count >= self.config.max_tx_per_hour {
            return RateLimitDecision::Denied(RateLimitWindow::Hour);
        }
        RateLimitDecision::Allowed
    }

    pub fn record_submission(&mut self, observed_block: u64) {
        self.roll_windows(observed_block);
        self.block_count += 1;
        self.minute_count += 1;
        self.hour_count += 1;
    }

    /// Per-block resets on observed block-number change; minute/hour windows
    /// reset on elapsed time (§4.9).
    fn roll_windows(&mut self, observed_block: u64) {
        if self.current_block != Some(observed_block) {
            self.current_block = Some(observed_block);
            self.block_count = 0;
        }
        let now = Instant::now();
        if now.duration_since(self.minute_window_start) >= Duration::from_secs(60) {
            self.minute_window_start = now;
            self.minute_count = 0;
        }
        if now.duration_since(self.hour_window_start) >= Duration::from_secs(3600) {
            self.hour_window_start = now;
            self.hour_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(block: u32, minute: u32, hour: u32) -> RateLimitConfig {
        RateLimitConfig {
            max_tx_per_block: block,
            max_tx_per_minute: minute,
            max_tx_per_hour: hour,
        }
    }

    #[test]
    fn allows_up_to_per_minute_cap_then_denies() {
        let mut limiter = RateLimiter::new(config(100, 10, 100));
        for i in 0..10 {
            assert_eq!(limiter.check(1), RateLimitDecision::Allowed);
            limiter.record_submission(1 + i as u64 / 100);
        }
        assert_eq!(
            limiter.check(1),
            RateLimitDecision::Denied(RateLimitWindow::Minute)
        );
    }

    #[test]
    fn per_block_cap_resets_on_new_block() {
        let mut limiter = RateLimiter::new(config(1, 100, 100));
        assert_eq!(limiter.check(5), RateLimitDecision::Allowed);
        limiter.record_submission(5);
        assert_eq!(
            limiter.check(5),
            RateLimitDecision::Denied(RateLimitWindow::Block)
        );
        // New block number resets the per-block counter.
        assert_eq!(limiter.check(6), RateLimitDecision::Allowed);
    }

    #[test]
    fn eleven_ready_attestations_defer_the_eleventh() {
        // Scenario 5 (§8): maxTxPerMinute=10, 11 ready attestations.
        let mut limiter = RateLimiter::new(config(100, 10, 100));
        let mut submitted = 0;
        for _ in 0..11 {
            if limiter.check(1) == RateLimitDecision::Allowed {
                limiter.record_submission(1);
                submitted += 1;
            }
        }
        assert_eq!(submitted, 10);
    }
}
