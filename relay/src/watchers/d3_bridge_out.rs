//! Ledger Bridge-Out Backing (D3, §4.4).
//!
//! Grounded on `d2b_redemption`'s role-check/mint shape, generalized from
//! "mint on the token" to "approve-then-deposit into the treasury vault";
//! the asset-with-fallback resolution (`asset()` falling back to `usdc()`)
//! follows the same "try the preferred call, fall back to the legacy one"
//! idiom `d2_bridge_in::deliver_holding` uses for CIP-56 vs. the legacy
//! transfer path.

use alloy::primitives::{Address, U256};
use alloy::providers::Provider;
use serde_json::Value;

use crate::chain_client::EvmProvider;
use crate::config::Config;
use crate::contracts::{role_id, IERC20, ITreasury};
use crate::errors::RelayError;
use crate::ledger_client::LedgerApi;
use crate::state::DurableState;

const BRIDGE_OUT_REQUEST_TEMPLATE: &str = "BridgeOutRequest:BridgeOutRequest";
const TREASURY_VAULT_ROLE: &str = "TREASURY_VAULT_ROLE";
/// 18-decimal Ledger amount -> the backing asset's 6-decimal units (§4.4 step 3).
const DECIMAL_SHIFT: u128 = 1_000_000_000_000;
/// Throttle repeated warnings to once every this many encounters, so a
/// persistently-missing role or a persistently-reverting access check
/// doesn't flood the log (§4.4 step 1, step 5).
const WARN_THROTTLE_EVERY: u32 = 10;

/// In-process counters for the two throttled warning paths (§4.4): missing
/// treasury-vault role, and access-control reverts on `BridgeOut_Complete`.
/// Crash-losable like [`super::InFlightTracker`] — losing a throttle counter
/// on restart just means the next occurrence logs once more than strictly
/// necessary, which is harmless.
#[derive(Debug, Default)]
pub struct D3Throttle {
    missing_role_hits: u32,
    access_control_revert_hits: u32,
}

impl D3Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    fn should_warn_missing_role(&mut self) -> bool {
        self.missing_role_hits += 1;
        self.missing_role_hits % WARN_THROTTLE_EVERY == 1
    }

    fn should_warn_access_control(&mut self) -> bool {
        self.access_control_revert_hits += 1;
        self.access_control_revert_hits % WARN_THROTTLE_EVERY == 1
    }
}

pub async fn run<L: LedgerApi>(
    ledger: &L,
    provider: &EvmProvider,
    signer_address: Address,
    config: &Config,
    state: &mut DurableState,
    throttle: &mut D3Throttle,
) -> Result<(), RelayError> {
    let treasury_address: Address = config
        .chain
        .treasury_address
        .parse()
        .map_err(|e| RelayError::Permanent(format!("invalid treasury address: {e}")))?;
    let treasury = ITreasury::new(treasury_address, provider);

    // Step 1: verify the relay holds the treasury vault role (warn-throttled).
    let has_role = treasury
        .hasRole(role_id(TREASURY_VAULT_ROLE).into(), signer_address)
        .call()
        .await
        .map_err(|e| RelayError::Transient(format!("failed to check treasury vault role: {e}")))?
        ._0;
    if !has_role {
        if throttle.should_warn_missing_role() {
            tracing::warn!("relay lacks TREASURY_VAULT_ROLE, skipping bridge-out backing this cycle");
        }
        return Ok(());
    }

    // Step 2: resolve the backing asset, `asset()` with fallback `usdc()`.
    let asset_address = resolve_backing_asset(&treasury).await?;
    let asset = IERC20::new(asset_address, provider);

    let mut requests = ledger
        .query_active(BRIDGE_OUT_REQUEST_TEMPLATE, Value::Null)
        .await
        .map_err(|e| RelayError::Transient(format!("failed to query bridge-out requests: {e}")))?;
    requests.retain(|c| {
        let source = c.payload.get("source").and_then(|v| v.as_str()).unwrap_or("");
        let pending = c.payload.get("status").and_then(|v| v.as_str()).unwrap_or("pending") == "pending";
        pending && matches!(source, "directmint" | "ethpool")
    });
    requests.sort_by_key(|c| c.payload.get("createdAt").and_then(|v| v.as_i64()).unwrap_or(i64::MAX));

    for contract in requests {
        let contract_id = contract.contract_id.clone();
        if state.processed_bridge_outs.contains(&contract_id) {
            continue;
        }

        let Some(amount_str) = contract.payload.get("amount").and_then(|v| v.as_str()) else {
            continue;
        };
        let Ok(amount_wei) = parse_18dec(amount_str) else {
            tracing::warn!(contract_id = %contract_id, "malformed bridge-out amount, skipping");
            continue;
        };
        let source = contract.payload.get("source").and_then(|v| v.as_str()).unwrap_or("directmint").to_string();

        // Step 3: convert 18-dec to the asset's 6-dec units.
        let amount_asset_units = amount_wei / DECIMAL_SHIFT;
        if amount_asset_units == 0 {
            continue;
        }
        let amount_u256 = U256::from(amount_asset_units);

        // Step 4: balance check; skip (await off-chain arrival) if short.
        let balance: U256 = asset
            .balanceOf(signer_address)
            .call()
            .await
            .map_err(|e| RelayError::Transient(format!("failed to read asset balance: {e}")))?
            ._0;
        if balance < amount_u256 {
            tracing::info!(contract_id = %contract_id, "insufficient treasury-asset balance, awaiting off-chain arrival");
            continue;
        }

        match back_one(
            ledger,
            &treasury,
            &asset,
            config,
            treasury_address,
            &contract_id,
            &source,
            amount_u256,
            signer_address,
            throttle,
        )
        .await
        {
            Ok(()) => {
                state.processed_bridge_outs.insert(&contract_id);
                crate::metrics::record_direction_outcome(crate::types::Direction::D3BridgeOutBacker.label(), "submitted");
                crate::metrics::record_volume(
                    crate::types::Direction::D3BridgeOutBacker.label(),
                    "usdc",
                    amount_asset_units as f64 / 1_000_000.0,
                );
                state
                    .persist()
                    .map_err(|e| RelayError::Transient(format!("failed to persist state: {e}")))?;
            }
            Err(RelayError::Permanent(reason)) if is_access_control_revert(&reason) => {
                // Non-fatal, throttled (§4.4 step 5).
                if throttle.should_warn_access_control() {
                    tracing::warn!(contract_id = %contract_id, reason, "bridge-out backing hit an access-control revert, will retry");
                }
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

async fn resolve_backing_asset(treasury: &ITreasury::ITreasuryInstance<(), &EvmProvider>) -> Result<Address, RelayError> {
    match treasury.asset().call().await {
        Ok(r) => Ok(r._0),
        Err(_) => treasury
            .usdc()
            .call()
            .await
            .map(|r| r._0)
            .map_err(|e| RelayError::Transient(format!("both asset() and usdc() failed: {e}"))),
    }
}

#[allow(clippy::too_many_arguments)]
async fn back_one<L: LedgerApi>(
    ledger: &L,
    treasury: &ITreasury::ITreasuryInstance<(), &EvmProvider>,
    asset: &IERC20::IERC20Instance<(), &EvmProvider>,
    config: &Config,
    treasury_address: Address,
    contract_id: &str,
    source: &str,
    amount_u256: U256,
    signer_address: Address,
    _throttle: &mut D3Throttle,
) -> Result<(), RelayError> {
    asset
        .approve(treasury_address, amount_u256)
        .send()
        .await
        .map_err(|e| RelayError::Permanent(format!("approve failed: {e}")))?
        .get_receipt()
        .await
        .map_err(|e| RelayError::Transient(format!("approve confirmation failed: {e}")))?;

    let deposit_result = if source == "ethpool" {
        let meta_vault3: Address = config
            .chain
            .meta_vault3_address
            .as_deref()
            .ok_or_else(|| RelayError::Permanent("META_VAULT3 not configured for ethpool source".into()))?
            .parse()
            .map_err(|e| RelayError::Permanent(format!("invalid META_VAULT3 address: {e}")))?;
        treasury.depositToStrategy(meta_vault3, amount_u256).send().await
    } else {
        treasury.deposit(signer_address, amount_u256).send().await
    };

    let pending = deposit_result.map_err(|e| RelayError::Permanent(format!("deposit submission failed: {e}")))?;
    let receipt = pending
        .get_receipt()
        .await
        .map_err(|e| RelayError::Transient(format!("deposit confirmation failed: {e}")))?;
    if !receipt.status() {
        return Err(RelayError::Permanent("treasury deposit reverted on-chain".into()));
    }

    let _ = ledger
        .exercise(BRIDGE_OUT_REQUEST_TEMPLATE, contract_id, "BridgeOut_Complete", Value::Null, vec![])
        .await
        .map_err(|e| tracing::warn!(error = %e, contract_id, "BridgeOut_Complete failed (non-fatal)"));

    Ok(())
}

fn is_access_control_revert(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("access control") || lower.contains("accesscontrol") || lower.contains("missing role")
}

fn parse_18dec(s: &str) -> Result<u128, ()> {
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    let whole: u128 = whole.parse().map_err(|_| ())?;
    let mut frac_digits = frac.to_string();
    frac_digits.truncate(18);
    while frac_digits.len() < 18 {
        frac_digits.push('0');
    }
    let frac: u128 = if frac_digits.is_empty() { 0 } else { frac_digits.parse().map_err(|_| ())? };
    Ok(whole * 1_000_000_000_000_000_000 + frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_eighteen_dec_to_six_dec_units() {
        let amount = parse_18dec("1000.0").unwrap();
        assert_eq!(amount / DECIMAL_SHIFT, 1_000_000_000); // 1000 * 1e6
    }

    #[test]
    fn access_control_revert_is_recognized() {
        assert!(is_access_control_revert("execution reverted: AccessControl: missing role"));
        assert!(!is_access_control_revert("execution reverted: insufficient balance"));
    }

    #[test]
    fn throttle_warns_on_first_and_every_nth_hit() {
        let mut throttle = D3Throttle::new();
        assert!(throttle.should_warn_missing_role());
        for _ in 0..8 {
            assert!(!throttle.should_warn_missing_role());
        }
        assert!(throttle.should_warn_missing_role());
    }
}
