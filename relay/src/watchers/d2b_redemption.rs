//! Redemption Settlement (D2b, §4.3).
//!
//! Grounded on `d1_attestation`'s submit-then-confirm shape for the Chain
//! `mint` call, and on the teacher's `contracts/evm_bridge.rs` role-check
//! pattern (`hasRole`/`grantRole`) for the bridge-mint-role auto-grant.

use alloy::primitives::{Address, U256};
use alloy::providers::Provider;
use serde_json::{json, Value};

use crate::chain_client::EvmProvider;
use crate::config::Config;
use crate::contracts::{role_id, EXCEEDS_LOCAL_CAP_SELECTOR, IMusdToken};
use crate::errors::RelayError;
use crate::ledger_client::LedgerApi;
use crate::state::DurableState;

use super::{resolve_recipient, wei_to_decimal_string};

const REDEMPTION_REQUEST_TEMPLATE: &str = "RedemptionRequest:RedemptionRequest";
const REDEMPTION_SETTLEMENT_TEMPLATE: &str = "RedemptionEthereumSettlement:RedemptionEthereumSettlement";
const BRIDGE_MINT_ROLE: &str = "BRIDGE_MINT_ROLE";
const DEFAULT_ADMIN_ROLE: [u8; 32] = [0u8; 32];

pub async fn run<L: LedgerApi>(
    ledger: &L,
    provider: &EvmProvider,
    signer_address: Address,
    config: &Config,
    state: &mut DurableState,
) -> Result<(), RelayError> {
    let token_address: Address = config
        .chain
        .musd_token_address
        .parse()
        .map_err(|e| RelayError::Permanent(format!("invalid musd token address: {e}")))?;
    let token = IMusdToken::new(token_address, provider);

    let mut requests = ledger
        .query_active(REDEMPTION_REQUEST_TEMPLATE, Value::Null)
        .await
        .map_err(|e| RelayError::Transient(format!("failed to query redemption requests: {e}")))?;
    requests.retain(|c| c.payload.get("fulfilled").and_then(|v| v.as_bool()) == Some(false));
    requests.sort_by_key(|c| c.payload.get("createdAt").and_then(|v| v.as_i64()).unwrap_or(i64::MAX));

    let total_supply: U256 = token
        .totalSupply()
        .call()
        .await
        .map_err(|e| RelayError::Transient(format!("failed to read totalSupply: {e}")))?
        ._0;
    let supply_cap: U256 = token
        .supplyCap()
        .call()
        .await
        .map_err(|e| RelayError::Transient(format!("failed to read supplyCap: {e}")))?
        ._0;
    let local_cap_bps: U256 = token
        .localCapBps()
        .call()
        .await
        .map_err(|e| RelayError::Transient(format!("failed to read localCapBps: {e}")))?
        ._0;
    let effective_local_cap = supply_cap.saturating_mul(local_cap_bps) / U256::from(10_000u64);
    let mut projected_supply = total_supply;

    ensure_bridge_mint_role(&token, signer_address, config).await?;

    for contract in requests {
        let contract_id = contract.contract_id.clone();
        if state.processed_redemption_requests.contains(&contract_id) {
            continue;
        }

        let Some(usdc_owed_str) = contract.payload.get("usdcOwed").and_then(|v| v.as_str()) else {
            state.processed_redemption_requests.insert(&contract_id);
            continue;
        };
        let Ok(amount) = parse_wei_decimal(usdc_owed_str) else {
            state.processed_redemption_requests.insert(&contract_id);
            continue;
        };

        // Step 1: reject non-positive or over the per-request cap.
        if amount == 0 || amount > config.redemption.max_payout_wei {
            tracing::warn!(contract_id = %contract_id, amount, "redemption amount out of bounds, skipping");
            state.processed_redemption_requests.insert(&contract_id);
            state
                .persist()
                .map_err(|e| RelayError::Transient(format!("failed to persist state: {e}")))?;
            continue;
        }

        // Step 2: recipient resolution.
        let Some(user) = contract.payload.get("user").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(recipient) = resolve_recipient(&config.routing, user) else {
            tracing::warn!(contract_id = %contract_id, user, "unable to resolve Chain recipient for redemption, deferring");
            continue;
        };

        // Step 3: pre-flight cap check against a running projected supply.
        let amount_u256 = U256::from(amount);
        let candidate_supply = projected_supply + amount_u256;
        if candidate_supply > effective_local_cap {
            tracing::warn!(contract_id = %contract_id, "redemption would exceed effective local cap, skipping this cycle");
            continue;
        }

        match mint_and_settle(ledger, &token, config, &contract_id, user, recipient.address, amount, amount_u256).await {
            Ok(true) => {
                projected_supply = candidate_supply;
                state.processed_redemption_requests.insert(&contract_id);
                crate::metrics::record_direction_outcome(
                    crate::types::Direction::D2bRedemptionSettler.label(),
                    "submitted",
                );
                crate::metrics::record_volume(
                    crate::types::Direction::D2bRedemptionSettler.label(),
                    "musd",
                    super::wei_to_decimal_string(amount).parse().unwrap_or(0.0),
                );
            }
            Ok(false) => {
                // ExceedsLocalCap soft skip: mark processed, do not retry-storm.
                state.processed_redemption_requests.insert(&contract_id);
                crate::metrics::record_direction_outcome(
                    crate::types::Direction::D2bRedemptionSettler.label(),
                    "soft_skip",
                );
            }
            Err(e) => {
                state
                    .persist()
                    .map_err(|e| RelayError::Transient(format!("failed to persist state: {e}")))?;
                return Err(e);
            }
        }

        state
            .persist()
            .map_err(|e| RelayError::Transient(format!("failed to persist state: {e}")))?;
    }

    Ok(())
}

async fn ensure_bridge_mint_role(
    token: &IMusdToken::IMusdTokenInstance<(), &EvmProvider>,
    signer_address: Address,
    config: &Config,
) -> Result<(), RelayError> {
    let role = role_id(BRIDGE_MINT_ROLE);
    let has_role = token
        .hasRole(role.into(), signer_address)
        .call()
        .await
        .map_err(|e| RelayError::Transient(format!("failed to check bridge-mint role: {e}")))?
        ._0;
    if has_role {
        return Ok(());
    }

    if !config.behavior.auto_grant_bridge_role_for_redemptions {
        return Err(RelayError::Permanent(
            "relay lacks BRIDGE_MINT_ROLE and auto-grant is disabled".to_string(),
        ));
    }

    let has_admin = token
        .hasRole(DEFAULT_ADMIN_ROLE.into(), signer_address)
        .call()
        .await
        .map_err(|e| RelayError::Transient(format!("failed to check admin role: {e}")))?
        ._0;
    if !has_admin {
        return Err(RelayError::Permanent(
            "relay lacks BRIDGE_MINT_ROLE and has no admin role to self-grant it".to_string(),
        ));
    }

    token
        .grantRole(role.into(), signer_address)
        .send()
        .await
        .map_err(|e| RelayError::Permanent(format!("failed to grant bridge-mint role: {e}")))?
        .get_receipt()
        .await
        .map_err(|e| RelayError::Permanent(format!("bridge-mint role grant not confirmed: {e}")))?;
    Ok(())
}

/// Returns `Ok(true)` on a confirmed settlement, `Ok(false)` on a known soft
/// skip (`ExceedsLocalCap`), `Err` otherwise.
async fn mint_and_settle<L: LedgerApi>(
    ledger: &L,
    token: &IMusdToken::IMusdTokenInstance<(), &EvmProvider>,
    config: &Config,
    redemption_cid: &str,
    user: &str,
    recipient: Address,
    amount: u128,
    amount_u256: U256,
) -> Result<bool, RelayError> {
    let pending = match token.mint(recipient, amount_u256).send().await {
        Ok(pending) => pending,
        Err(e) => {
            if is_exceeds_local_cap(&e) {
                return Ok(false);
            }
            return Err(RelayError::Permanent(format!("mint submission failed: {e}")));
        }
    };

    let receipt = pending
        .get_receipt()
        .await
        .map_err(|e| RelayError::Transient(format!("mint confirmation failed: {e}")))?;

    let settled_at = crate::state::now_unix();
    let settlement = json!({
        "operator": config.ledger.operator_party,
        "user": user,
        "redemptionCid": redemption_cid,
        "recipientEth": format!("{recipient:#x}"),
        "amountPaid": wei_to_decimal_string(amount),
        "ethTxHash": format!("{:#x}", receipt.transaction_hash),
        "settledAt": settled_at,
    });

    if let Err(e) = ledger.create(REDEMPTION_SETTLEMENT_TEMPLATE, settlement).await {
        // Template not yet vetted on this participant: fall back to local
        // state only, the mint itself is already confirmed (§4.3 step 5).
        tracing::warn!(error = %e, redemption_cid, "failed to record RedemptionEthereumSettlement on Ledger, relying on local state");
    }

    let _ = ledger
        .exercise(REDEMPTION_REQUEST_TEMPLATE, redemption_cid, "Redemption_Fulfill", Value::Null, vec![])
        .await;

    Ok(true)
}

fn is_exceeds_local_cap(err: &impl std::fmt::Display) -> bool {
    let msg = err.to_string();
    msg.contains(&hex::encode(EXCEEDS_LOCAL_CAP_SELECTOR)) || msg.to_lowercase().contains("exceedslocalcap")
}

fn parse_wei_decimal(s: &str) -> Result<u128, ()> {
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
    fn parses_whole_and_fractional_wei() {
        assert_eq!(parse_wei_decimal("1.5").unwrap(), 1_500_000_000_000_000_000);
        assert_eq!(parse_wei_decimal("0").unwrap(), 0);
    }

    #[test]
    fn rejects_garbage_decimal() {
        assert!(parse_wei_decimal("not-a-number").is_err());
    }
}
