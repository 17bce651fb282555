//! Anomaly detector that may invoke emergency pause on the Chain bridge (§4.10).
//!
//! New relative to the teacher (the reference operator had no analogous
//! guardian), built in the same small-struct-plus-unit-tests idiom as
//! [`crate::rate_limiter`].

use alloy::primitives::Address;
use eyre::Result;

use crate::chain_client::EvmProvider;
use crate::config::PauseGuardianConfig;
use crate::contracts::IBridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardianDecision {
    Ok,
    /// Proportional change in `attestedCantonAssets` exceeded the configured
    /// threshold.
    TripCapChange { change_bps: u64 },
    /// Consecutive Chain reverts exceeded the configured threshold.
    TripConsecutiveReverts { count: u32 },
}

pub struct PauseGuardian {
    config: PauseGuardianConfig,
    last_known_supply_cap: Option<u128>,
    consecutive_reverts: u32,
    /// Once tripped, no further Chain submissions are issued until the
    /// process is restarted (§4.10, §8 pause-safety invariant).
    tripped: bool,
}

impl PauseGuardian {
    pub fn new(config: PauseGuardianConfig) -> Self {
        Self {
            config,
            last_known_supply_cap: None,
            consecutive_reverts: 0,
            tripped: false,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    /// Initialize the baseline lazily from the Chain, if not already set.
    pub fn ensure_baseline(&mut self, current_supply_cap: u128) {
        if self.last_known_supply_cap.is_none() {
            self.last_known_supply_cap = Some(current_supply_cap);
        }
    }

    /// Evaluate a proposed `attestedCantonAssets` value against the tracked
    /// baseline (§4.10: "compute the proportional change ... in basis
    /// points"). Refreshing the baseline on success is the caller's
    /// responsibility, via [`PauseGuardian::refresh_baseline`] (§4.1 step 14:
    /// "refresh the guardian's cap baseline").
    pub fn evaluate_cap_change(&mut self, attested_canton_assets: u128) -> GuardianDecision {
        if self.tripped {
            return GuardianDecision::TripCapChange { change_bps: 0 };
        }
        let baseline = match self.last_known_supply_cap {
            Some(b) if b > 0 => b,
            _ => {
                self.last_known_supply_cap = Some(attested_canton_assets);
                return GuardianDecision::Ok;
            }
        };

        let diff = attested_canton_assets.abs_diff(baseline);
        let change_bps = ((diff as u128 * 10_000) / baseline) as u64;
        let threshold_bps = (self.config.max_cap_change_pct as u64) * 100;

        if change_bps > threshold_bps {
            self.tripped = true;
            GuardianDecision::TripCapChange { change_bps }
        } else {
            GuardianDecision::Ok
        }
    }

    pub fn refresh_baseline(&mut self, new_baseline: u128) {
        self.last_known_supply_cap = Some(new_baseline);
    }

    pub fn record_chain_revert(&mut self) -> GuardianDecision {
        if self.tripped {
            return GuardianDecision::TripConsecutiveReverts { count: self.consecutive_reverts };
        }
        self.consecutive_reverts += 1;
        if self.consecutive_reverts >= self.config.max_consecutive_reverts {
            self.tripped = true;
            return GuardianDecision::TripConsecutiveReverts { count: self.consecutive_reverts };
        }
        GuardianDecision::Ok
    }

    pub fn record_chain_success(&mut self) {
        self.consecutive_reverts = 0;
    }
}

/// Invoke `pause()` once on the bridge contract. Failure to acquire the
/// emergency role leaves the relay stopped as a safe fallback (§4.10): the
/// caller should treat any error from this function as fatal to further
/// submissions for the remainder of the process lifetime, not retry it.
pub async fn invoke_pause<P: PauseInvoker>(invoker: &P) -> Result<()> {
    invoker.pause().await
}

/// Narrow seam over the Chain bridge's `pause()` call, so the guardian's
/// trip logic is unit-testable without a live provider. A native `async fn`
/// in a trait, not `async-trait` (§2A: the crate is dropped from the stack).
pub trait PauseInvoker {
    fn pause(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// The one production [`PauseInvoker`]: calls `pause()` on the Chain bridge
/// and waits for confirmation. Shared by every trip path (cap-change in
/// `d1_attestation.rs`, consecutive-reverts in `scheduler.rs`) so there is a
/// single place that knows how to submit the bridge's `pause()` transaction.
pub struct BridgePauseInvoker<'a> {
    pub provider: &'a EvmProvider,
    pub bridge_address: Address,
}

impl<'a> PauseInvoker for BridgePauseInvoker<'a> {
    async fn pause(&self) -> Result<()> {
        let bridge = IBridge::new(self.bridge_address, self.provider);
        bridge
            .pause()
            .send()
            .await
            .map_err(|e| eyre::eyre!("pause() submission failed: {e}"))?
            .get_receipt()
            .await
            .map_err(|e| eyre::eyre!("pause() confirmation failed: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pct: u32, reverts: u32) -> PauseGuardianConfig {
        PauseGuardianConfig {
            max_cap_change_pct: pct,
            max_consecutive_reverts: reverts,
        }
    }

    #[test]
    fn thirty_percent_swing_trips_twenty_percent_threshold() {
        // Scenario 6 (§8): 1,000,000e18 -> 1,300,000e18 is a 30% change.
        let mut guardian = PauseGuardian::new(config(20, 5));
        guardian.ensure_baseline(1_000_000);
        let decision = guardian.evaluate_cap_change(1_300_000);
        assert!(matches!(decision, GuardianDecision::TripCapChange { .. }));
        assert!(guardian.is_tripped());
    }

    #[test]
    fn small_change_does_not_trip() {
        let mut guardian = PauseGuardian::new(config(20, 5));
        guardian.ensure_baseline(1_000_000);
        let decision = guardian.evaluate_cap_change(1_050_000);
        assert_eq!(decision, GuardianDecision::Ok);
        assert!(!guardian.is_tripped());
    }

    #[test]
    fn consecutive_reverts_trip_after_threshold() {
        let mut guardian = PauseGuardian::new(config(20, 3));
        assert_eq!(guardian.record_chain_revert(), GuardianDecision::Ok);
        assert_eq!(guardian.record_chain_revert(), GuardianDecision::Ok);
        let third = guardian.record_chain_revert();
        assert!(matches!(third, GuardianDecision::TripConsecutiveReverts { count: 3 }));
        assert!(guardian.is_tripped());
    }

    #[test]
    fn success_resets_consecutive_reverts() {
        let mut guardian = PauseGuardian::new(config(20, 3));
        guardian.record_chain_revert();
        guardian.record_chain_revert();
        guardian.record_chain_success();
        assert_eq!(guardian.record_chain_revert(), GuardianDecision::Ok);
    }

    #[test]
    fn once_tripped_stays_tripped() {
        let mut guardian = PauseGuardian::new(config(1, 100));
        guardian.ensure_baseline(1_000);
        guardian.evaluate_cap_change(2_000);
        assert!(guardian.is_tripped());
        let decision = guardian.evaluate_cap_change(1_000);
        assert!(matches!(decision, GuardianDecision::TripCapChange { .. }));
    }
}
