//! Yield Bridge-In, staking pool and ETH pool (D4, D4b, §4.5).
//!
//! Grounded on `d2_bridge_in`'s scan-then-create-holding shape, generalized
//! from "one bridge contract" to "two near-identical distributor contracts"
//! by parameterizing the shared `scan_and_credit` helper on pool name,
//! distributor address, event signature, and Ledger choice name — the same
//! way the teacher's `writers/evm.rs` and `writers/terra.rs` share a single
//! `submit_with_retry` helper parameterized on chain.

use alloy::primitives::Address;
use alloy::providers::Provider;
use alloy::rpc::types::Filter;
use alloy::sol_types::SolEvent;
use serde_json::{json, Value};

use crate::chain_client::EvmProvider;
use crate::config::Config;
use crate::contracts::{IEthPoolYieldDistributor, IYieldDistributor};
use crate::errors::RelayError;
use crate::hash::yield_epoch_agreement_hash;
use crate::ledger_client::LedgerApi;
use crate::state::DurableState;
use crate::types::{CantonYieldBridgedEvent, EthPoolYieldBridgedEvent};

const MAX_BLOCK_RANGE: u64 = 10_000;
const WRAPPED_HOLDING_TEMPLATE: &str = "WrappedHolding:WrappedHolding";
const YIELD_SERVICE_TEMPLATE: &str = "YieldDistributionService:YieldDistributionService";
const ETH_POOL_YIELD_SERVICE_TEMPLATE: &str = "EthPoolYieldDistributionService:EthPoolYieldDistributionService";

/// D4: staking-pool yield (§4.5, `CantonYieldBridged`).
pub async fn run<L: LedgerApi>(
    ledger: &L,
    provider: &EvmProvider,
    config: &Config,
    state: &mut DurableState,
) -> Result<(), RelayError> {
    let current_block = provider
        .get_block_number()
        .await
        .map_err(|e| RelayError::Transient(format!("failed to fetch current block: {e}")))?;
    let confirmed_block = current_block.saturating_sub(config.scheduling.confirmations);
    if confirmed_block <= state.last_yield_scanned_block {
        return Ok(());
    }

    let distributor: Address = config
        .chain
        .yield_distributor_address
        .parse()
        .map_err(|e| RelayError::Permanent(format!("invalid yield distributor address: {e}")))?;

    let from_block = state.last_yield_scanned_block + 1;
    let events = scan_staking(provider, distributor, from_block, confirmed_block).await?;

    let mut highest_processed = state.last_yield_scanned_block;
    let mut dirty = false;

    for event in events {
        let epoch_key = format!("staking-epoch-{}", event.epoch);
        if state.processed_yield_epochs.contains(&epoch_key) {
            highest_processed = highest_processed.max(event.block_number);
            continue;
        }

        match credit_one(
            ledger,
            config,
            "staking",
            event.epoch,
            event.musd_amount,
            &event.canton_recipient,
            YIELD_SERVICE_TEMPLATE,
            "ReceiveYield",
        )
        .await
        {
            Ok(()) => {
                state.processed_yield_epochs.insert(&epoch_key);
                dirty = true;
                highest_processed = highest_processed.max(event.block_number);
                crate::metrics::record_direction_outcome(
                    crate::types::Direction::D4YieldBridgeIn.label(),
                    "submitted",
                );
                crate::metrics::record_volume(
                    crate::types::Direction::D4YieldBridgeIn.label(),
                    "musd",
                    super::wei_to_decimal_string(event.musd_amount).parse().unwrap_or(0.0),
                );
            }
            Err(e) => {
                if dirty {
                    state.last_yield_scanned_block = crate::state::advance_cursor(state.last_yield_scanned_block, highest_processed);
                    state
                        .persist()
                        .map_err(|e| RelayError::Transient(format!("failed to persist state: {e}")))?;
                }
                return Err(e);
            }
        }
    }

    if dirty {
        state.last_yield_scanned_block = crate::state::advance_cursor(state.last_yield_scanned_block, highest_processed);
        crate::metrics::record_cursor_advance(crate::types::Direction::D4YieldBridgeIn.label(), state.last_yield_scanned_block);
        state
            .persist()
            .map_err(|e| RelayError::Transient(format!("failed to persist state: {e}")))?;
    }

    Ok(())
}

/// D4b: ETH-pool yield (§4.5, `ETHPoolYieldBridged`). The ETH pool epoch
/// key carries its own `musdBridged` amount rather than reusing the field
/// name `musdAmount` that the staking-pool event uses.
pub async fn run_eth_pool<L: LedgerApi>(
    ledger: &L,
    provider: &EvmProvider,
    config: &Config,
    state: &mut DurableState,
) -> Result<(), RelayError> {
    let current_block = provider
        .get_block_number()
        .await
        .map_err(|e| RelayError::Transient(format!("failed to fetch current block: {e}")))?;
    let confirmed_block = current_block.saturating_sub(config.scheduling.confirmations);
    if confirmed_block <= state.last_eth_pool_yield_scanned_block {
        return Ok(());
    }

    let distributor: Address = config
        .chain
        .eth_pool_yield_distributor_address
        .parse()
        .map_err(|e| RelayError::Permanent(format!("invalid eth pool yield distributor address: {e}")))?;

    let from_block = state.last_eth_pool_yield_scanned_block + 1;
    let events = scan_eth_pool(provider, distributor, from_block, confirmed_block).await?;

    let mut highest_processed = state.last_eth_pool_yield_scanned_block;
    let mut dirty = false;

    for event in events {
        let epoch_key = format!("ethpool-epoch-{}", event.epoch);
        if state.processed_eth_pool_yield_epochs.contains(&epoch_key) {
            highest_processed = highest_processed.max(event.block_number);
            continue;
        }

        match credit_one(
            ledger,
            config,
            "ethpool",
            event.epoch,
            event.musd_bridged,
            &event.eth_pool_recipient,
            ETH_POOL_YIELD_SERVICE_TEMPLATE,
            "ETHPool_ReceiveYield",
        )
        .await
        {
            Ok(()) => {
                state.processed_eth_pool_yield_epochs.insert(&epoch_key);
                dirty = true;
                highest_processed = highest_processed.max(event.block_number);
                crate::metrics::record_direction_outcome(
                    crate::types::Direction::D4bEthPoolYieldBridgeIn.label(),
                    "submitted",
                );
                crate::metrics::record_volume(
                    crate::types::Direction::D4bEthPoolYieldBridgeIn.label(),
                    "musd",
                    super::wei_to_decimal_string(event.musd_bridged).parse().unwrap_or(0.0),
                );
            }
            Err(e) => {
                if dirty {
                    state.last_eth_pool_yield_scanned_block =
                        crate::state::advance_cursor(state.last_eth_pool_yield_scanned_block, highest_processed);
                    state
                        .persist()
                        .map_err(|e| RelayError::Transient(format!("failed to persist state: {e}")))?;
                }
                return Err(e);
            }
        }
    }

    if dirty {
        state.last_eth_pool_yield_scanned_block =
            crate::state::advance_cursor(state.last_eth_pool_yield_scanned_block, highest_processed);
        crate::metrics::record_cursor_advance(
            crate::types::Direction::D4bEthPoolYieldBridgeIn.label(),
            state.last_eth_pool_yield_scanned_block,
        );
        state
            .persist()
            .map_err(|e| RelayError::Transient(format!("failed to persist state: {e}")))?;
    }

    Ok(())
}

async fn scan_staking(
    provider: &EvmProvider,
    distributor: Address,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<CantonYieldBridgedEvent>, RelayError> {
    let mut events = Vec::new();
    let mut current_from = from_block;
    while current_from <= to_block {
        let current_to = std::cmp::min(current_from + MAX_BLOCK_RANGE - 1, to_block);
        let filter = Filter::new()
            .address(distributor)
            .event_signature(IYieldDistributor::CantonYieldBridged::SIGNATURE_HASH)
            .from_block(current_from)
            .to_block(current_to);
        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| RelayError::Transient(format!("failed to fetch CantonYieldBridged logs: {e}")))?;
        for log in logs {
            let block_number = log.block_number.unwrap_or(current_to);
            match log.log_decode::<IYieldDistributor::CantonYieldBridged>() {
                Ok(decoded) => {
                    let inner = decoded.inner.data;
                    events.push(CantonYieldBridgedEvent {
                        epoch: inner.epoch.to::<u64>(),
                        musd_amount: inner.musdAmount.to::<u128>(),
                        canton_recipient: inner.cantonRecipient,
                        block_number,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, block = block_number, "failed to decode CantonYieldBridged log");
                }
            }
        }
        current_from = current_to + 1;
    }
    events.sort_by_key(|e| e.epoch);
    Ok(events)
}

async fn scan_eth_pool(
    provider: &EvmProvider,
    distributor: Address,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<EthPoolYieldBridgedEvent>, RelayError> {
    let mut events = Vec::new();
    let mut current_from = from_block;
    while current_from <= to_block {
        let current_to = std::cmp::min(current_from + MAX_BLOCK_RANGE - 1, to_block);
        let filter = Filter::new()
            .address(distributor)
            .event_signature(IEthPoolYieldDistributor::ETHPoolYieldBridged::SIGNATURE_HASH)
            .from_block(current_from)
            .to_block(current_to);
        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| RelayError::Transient(format!("failed to fetch ETHPoolYieldBridged logs: {e}")))?;
        for log in logs {
            let block_number = log.block_number.unwrap_or(current_to);
            match log.log_decode::<IEthPoolYieldDistributor::ETHPoolYieldBridged>() {
                Ok(decoded) => {
                    let inner = decoded.inner.data;
                    events.push(EthPoolYieldBridgedEvent {
                        epoch: inner.epoch.to::<u64>(),
                        yield_usdc: inner.yieldUsdc.to::<u128>(),
                        musd_bridged: inner.musdBridged.to::<u128>(),
                        eth_pool_recipient: inner.ethPoolRecipient,
                        block_number,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, block = block_number, "failed to decode ETHPoolYieldBridged log");
                }
            }
        }
        current_from = current_to + 1;
    }
    events.sort_by_key(|e| e.epoch);
    Ok(events)
}

/// Shared steps 1-4 of §4.5 for one epoch, either pool.
#[allow(clippy::too_many_arguments)]
async fn credit_one<L: LedgerApi>(
    ledger: &L,
    config: &Config,
    pool: &str,
    epoch: u64,
    musd_amount: u128,
    recipient_party: &str,
    service_template: &str,
    receive_choice: &str,
) -> Result<(), RelayError> {
    let (padded_hash, legacy_hash) = yield_epoch_agreement_hash(pool, epoch);

    // Step 1: existing operator-owned holding with either hash variant.
    if holding_exists(ledger, &padded_hash, &legacy_hash).await? {
        return Ok(());
    }

    let amount_decimal = super::wei_to_decimal_string(musd_amount);
    let agreement_uri = format!("ethereum:{pool}-yield:epoch:{epoch}");

    // Step 2: create the wrapped holding.
    let holding_cid = ledger
        .create(
            WRAPPED_HOLDING_TEMPLATE,
            json!({
                "issuer": config.ledger.operator_party,
                "owner": config.ledger.operator_party,
                "amount": amount_decimal,
                "agreementHash": padded_hash,
                "agreementUri": agreement_uri,
                "observers": Value::Array(vec![]),
            }),
        )
        .await
        .map_err(|e| RelayError::Permanent(format!("failed to create yield wrapped holding: {e}")))?;

    // Step 3: find the distributor service and exercise the receive choice,
    // adding the governance party to the actor set when configured.
    let services = ledger
        .query_active(service_template, Value::Null)
        .await
        .map_err(|e| RelayError::Transient(format!("failed to query {service_template}: {e}")))?;
    let Some(service) = services.first() else {
        tracing::warn!(pool, epoch, "no active {service_template} contract found, leaving holding for orphan recovery");
        return Ok(());
    };

    let mut actors = vec![config.ledger.operator_party.clone()];
    if let Some(governance) = &config.ledger.governance_party {
        actors.push(governance.clone());
    }

    ledger
        .exercise(
            service_template,
            &service.contract_id,
            receive_choice,
            json!({ "holdingCid": holding_cid, "cantonRecipient": recipient_party }),
            actors,
        )
        .await
        .map_err(|e| RelayError::Permanent(format!("{receive_choice} exercise failed: {e}")))?;

    Ok(())
}

async fn holding_exists<L: LedgerApi>(ledger: &L, padded_hash: &str, legacy_hash: &str) -> Result<bool, RelayError> {
    let existing = ledger
        .query_active(WRAPPED_HOLDING_TEMPLATE, Value::Null)
        .await
        .map_err(|e| RelayError::Transient(format!("failed to query wrapped holdings: {e}")))?;
    Ok(existing.iter().any(|c| {
        let hash = c.payload.get("agreementHash").and_then(|v| v.as_str());
        hash == Some(padded_hash) || hash == Some(legacy_hash)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staking_and_ethpool_epoch_keys_do_not_collide() {
        assert_ne!(format!("staking-epoch-{}", 3), format!("ethpool-epoch-{}", 3));
    }
}
