//! Cycle Scheduler (§2, §5): drives the six directional handlers on a fixed
//! poll interval, isolates failures per direction, demotes/promotes polling
//! cadence, hands off to RPC failover, and persists state.
//!
//! Grounded on the teacher's top-level run loop (a `loop { tick().await;
//! sleep(interval).await }` cooperative scheduler with a signal-driven drain
//! phase) generalized from "one loop per chain" to "one loop over six fixed-
//! order directions plus orphan recovery every sixth cycle."

use std::collections::HashMap;
use std::time::Duration;

use eyre::Result;

use crate::chain_client::{EvmProvider, RpcFailover};
use crate::config::Config;
use crate::errors::{ErrorClass, RelayError};
use crate::ledger_client::LedgerApi;
use crate::pause_guardian::{BridgePauseInvoker, GuardianDecision, PauseGuardian};
use crate::rate_limiter::RateLimiter;
use crate::signer::Signer;
use crate::state::DurableState;
use crate::types::{Direction, HealthStatus};
use crate::watchers::d3_bridge_out::D3Throttle;
use crate::watchers::{d1_attestation, d2_bridge_in, d2b_redemption, d3_bridge_out, d4_yield, orphan_recovery, InFlightTracker};

/// Orphan recovery runs on every cycle number that is a multiple of this (§4.6).
const ORPHAN_RECOVERY_EVERY: u64 = 6;
/// Demote one health level after this many consecutive counted failures (§5).
const DEMOTION_THRESHOLD: u32 = 5;
/// How long to wait, draining, for in-flight attestations to clear on shutdown (§5).
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Rotate RPC providers when at least this many directions failed in one cycle (§4.8).
const ROTATE_ON_FAILED_DIRECTIONS: usize = 3;

struct DirectionState {
    health: HealthStatus,
    consecutive_failures: u32,
}

impl Default for DirectionState {
    fn default() -> Self {
        Self {
            health: HealthStatus::Healthy,
            consecutive_failures: 0,
        }
    }
}

pub struct Scheduler<L: LedgerApi> {
    ledger: L,
    signer: Signer,
    config: Config,
    state: DurableState,
    failover: RpcFailover,
    rate_limiter: RateLimiter,
    guardian: PauseGuardian,
    in_flight: InFlightTracker,
    d3_throttle: D3Throttle,
    direction_state: HashMap<Direction, DirectionState>,
    cycle_number: u64,
}

impl<L: LedgerApi> Scheduler<L> {
    pub fn new(ledger: L, signer: Signer, config: Config, state: DurableState, failover: RpcFailover) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limits.clone());
        let guardian = PauseGuardian::new(config.pause_guardian.clone());
        let mut direction_state = HashMap::new();
        for direction in Direction::CYCLE_ORDER {
            direction_state.insert(direction, DirectionState::default());
        }
        direction_state.insert(Direction::OrphanRecovery, DirectionState::default());

        Self {
            ledger,
            signer,
            config,
            state,
            failover,
            rate_limiter,
            guardian,
            in_flight: InFlightTracker::new(),
            d3_throttle: D3Throttle::new(),
            direction_state,
            cycle_number: 0,
        }
    }

    /// Run cycles until a shutdown signal arrives, then drain (§5).
    pub async fn run_until_shutdown(&mut self) -> Result<()> {
        let mut sigterm = unix_sigterm()?;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.scheduling.poll_interval_ms)) => {
                    self.run_one_cycle().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, entering drain phase");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, entering drain phase");
                    break;
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while !self.in_flight.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        if !self.in_flight.is_empty() {
            tracing::warn!(
                count = self.in_flight.len(),
                "drain timeout elapsed with attestations still in flight"
            );
        }
    }

    async fn run_one_cycle(&mut self) {
        self.cycle_number += 1;
        crate::metrics::set_in_flight_attestations(self.in_flight.len());

        if self.guardian.is_tripped() {
            tracing::warn!("pause guardian is tripped; no further Chain submissions until restart (§8 pause-safety)");
            return;
        }

        let provider = match self.failover.active_provider_with_wallet(&self.signer) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to build Chain provider, skipping cycle");
                return;
            }
        };

        let mut directions_failed = 0usize;

        for direction in Direction::CYCLE_ORDER {
            if !self.should_run(direction) {
                continue;
            }
            if self.guardian.is_tripped() {
                break;
            }
            let started = tokio::time::Instant::now();
            let result = self.dispatch(direction, &provider).await;
            crate::metrics::record_latency(direction.label(), started.elapsed().as_secs_f64());
            self.record_outcome(direction, result, &provider, &mut directions_failed).await;
        }

        if !self.guardian.is_tripped()
            && self.cycle_number % ORPHAN_RECOVERY_EVERY == 0
            && self.should_run(Direction::OrphanRecovery)
        {
            let started = tokio::time::Instant::now();
            let result = orphan_recovery::run(&self.ledger, &provider, &self.config).await;
            crate::metrics::record_latency(Direction::OrphanRecovery.label(), started.elapsed().as_secs_f64());
            self.record_outcome(Direction::OrphanRecovery, result, &provider, &mut directions_failed).await;
        }

        if self.failover.record_cycle(directions_failed) {
            crate::metrics::record_rpc_rotation("consecutive_bad_cycles");
        }
    }

    fn should_run(&self, direction: Direction) -> bool {
        let cadence = self.direction_state[&direction].health.cadence_divisor();
        self.cycle_number % cadence == 0
    }

    async fn dispatch(&mut self, direction: Direction, provider: &EvmProvider) -> Result<(), RelayError> {
        let signer_address = self
            .signer
            .address()
            .map_err(|e| RelayError::Permanent(format!("failed to resolve signer address: {e}")))?;

        match direction {
            Direction::D1AttestationRelay => {
                d1_attestation::run(
                    &self.ledger,
                    provider,
                    &self.signer,
                    &self.config,
                    &mut self.state,
                    &mut self.rate_limiter,
                    &mut self.guardian,
                    &mut self.in_flight,
                )
                .await
            }
            Direction::D2BridgeInWatcher => d2_bridge_in::run(&self.ledger, provider, &self.config, &mut self.state).await,
            Direction::D2bRedemptionSettler => {
                d2b_redemption::run(&self.ledger, provider, signer_address, &self.config, &mut self.state).await
            }
            Direction::D3BridgeOutBacker => {
                d3_bridge_out::run(
                    &self.ledger,
                    provider,
                    signer_address,
                    &self.config,
                    &mut self.state,
                    &mut self.d3_throttle,
                )
                .await
            }
            Direction::D4YieldBridgeIn => d4_yield::run(&self.ledger, provider, &self.config, &mut self.state).await,
            Direction::D4bEthPoolYieldBridgeIn => d4_yield::run_eth_pool(&self.ledger, provider, &self.config, &mut self.state).await,
            Direction::OrphanRecovery => unreachable!("orphan recovery is dispatched separately"),
        }
    }

    async fn record_outcome(
        &mut self,
        direction: Direction,
        result: Result<(), RelayError>,
        provider: &EvmProvider,
        directions_failed: &mut usize,
    ) {
        let label = direction.label();
        match result {
            Ok(()) => {
                crate::metrics::record_successful_cycle(label);
                self.guardian.record_chain_success();
                let entry = self.direction_state.get_mut(&direction).unwrap();
                entry.health = HealthStatus::Healthy;
                entry.consecutive_failures = 0;
            }
            Err(e) => {
                tracing::warn!(direction = label, error = %e, "direction cycle failed");
                *directions_failed += 1;
                if is_chain_revert(&e) {
                    let decision = self.guardian.record_chain_revert();
                    if let GuardianDecision::TripConsecutiveReverts { count } = decision {
                        tracing::error!(count, "consecutive Chain reverts tripped the pause guardian");
                        crate::metrics::record_pause_triggered();
                        match self.config.chain.bridge_address.parse() {
                            Ok(bridge_address) => {
                                if let Err(pause_err) =
                                    crate::pause_guardian::invoke_pause(&BridgePauseInvoker { provider, bridge_address })
                                        .await
                                {
                                    tracing::error!(error = %pause_err, "pause() invocation failed after consecutive-revert trip");
                                }
                            }
                            Err(parse_err) => {
                                tracing::error!(error = %parse_err, "cannot parse BRIDGE address to invoke pause() after trip");
                            }
                        }
                    }
                }
                let entry = self.direction_state.get_mut(&direction).unwrap();
                if jumps_straight_to_failed(e.class()) {
                    entry.health = HealthStatus::Failed;
                    entry.consecutive_failures = 0;
                } else {
                    entry.consecutive_failures += 1;
                    if entry.consecutive_failures >= DEMOTION_THRESHOLD {
                        entry.health = demote(entry.health);
                        entry.consecutive_failures = 0;
                    }
                }
            }
        }

        let entry = &self.direction_state[&direction];
        crate::metrics::set_direction_health(label, health_level(entry.health));
        crate::metrics::set_consecutive_failures(label, entry.consecutive_failures);
    }
}

/// A genuine on-chain transaction revert, as opposed to a config, network, or
/// validation failure that also happens to classify `Permanent` (§4.10: pause
/// "after `maxConsecutiveReverts` consecutive Chain reverts", not after any
/// permanent error).
fn is_chain_revert(err: &RelayError) -> bool {
    matches!(err, RelayError::Permanent(msg) if msg.contains("reverted on-chain"))
}

fn jumps_straight_to_failed(class: ErrorClass) -> bool {
    matches!(class, ErrorClass::Permanent | ErrorClass::Security | ErrorClass::Anomaly)
}

fn demote(current: HealthStatus) -> HealthStatus {
    match current {
        HealthStatus::Healthy => HealthStatus::Degraded,
        HealthStatus::Degraded | HealthStatus::Failed => HealthStatus::Failed,
    }
}

fn health_level(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Failed => 2,
    }
}

#[cfg(unix)]
fn unix_sigterm() -> Result<tokio::signal::unix::Signal> {
    use tokio::signal::unix::{signal, SignalKind};
    Ok(signal(SignalKind::terminate())?)
}

#[cfg(not(unix))]
fn unix_sigterm() -> Result<NeverFires> {
    Ok(NeverFires)
}

#[cfg(not(unix))]
struct NeverFires;

#[cfg(not(unix))]
impl NeverFires {
    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demotion_steps_healthy_to_degraded_to_failed() {
        assert_eq!(demote(HealthStatus::Healthy), HealthStatus::Degraded);
        assert_eq!(demote(HealthStatus::Degraded), HealthStatus::Failed);
        assert_eq!(demote(HealthStatus::Failed), HealthStatus::Failed);
    }

    #[test]
    fn permanent_security_and_anomaly_jump_straight_to_failed() {
        assert!(jumps_straight_to_failed(ErrorClass::Permanent));
        assert!(jumps_straight_to_failed(ErrorClass::Security));
        assert!(jumps_straight_to_failed(ErrorClass::Anomaly));
        assert!(!jumps_straight_to_failed(ErrorClass::Transient));
    }
}
