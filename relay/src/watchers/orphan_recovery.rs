//! Orphan Recovery (§4.6), run every sixth cycle.
//!
//! Grounded on `d2_bridge_in`'s two delivery paths (CIP-56 factory transfer
//! vs. legacy owned-holding `Transfer`): a bridge-in orphan is exactly a
//! wrapped holding that `d2_bridge_in::deliver_via_cip56`'s "leave the
//! stranded holding for orphan recovery" comment anticipates, so this module
//! re-exercises the same two transfer shapes against an *existing* holding
//! instead of creating a new one.

use alloy::primitives::Address;
use alloy::providers::Provider;
use serde_json::{json, Value};

use crate::chain_client::EvmProvider;
use crate::config::Config;
use crate::errors::RelayError;
use crate::ledger_client::LedgerApi;

use super::d2_bridge_in::{BRIDGE_IN_REQUEST_TEMPLATE, TRANSFER_PROPOSAL_TEMPLATE, WRAPPED_HOLDING_TEMPLATE};

const ORPHAN_URI_PREFIX: &str = "ethereum:bridge-in:";
/// Block window consulted for the chain-event re-scan fallback (§4.6 step 1c).
const RESCAN_WINDOW_BLOCKS: u64 = 50_000;

pub async fn run<L: LedgerApi>(ledger: &L, provider: &EvmProvider, config: &Config) -> Result<(), RelayError> {
    let holdings = ledger
        .query_active(WRAPPED_HOLDING_TEMPLATE, Value::Null)
        .await
        .map_err(|e| RelayError::Transient(format!("failed to query wrapped holdings: {e}")))?;

    let orphans: Vec<_> = holdings
        .into_iter()
        .filter(|c| {
            let owner = c.payload.get("owner").and_then(|v| v.as_str());
            let uri = c.payload.get("agreementUri").and_then(|v| v.as_str()).unwrap_or("");
            owner == Some(config.ledger.operator_party.as_str()) && uri.starts_with(ORPHAN_URI_PREFIX)
        })
        .collect();

    if orphans.is_empty() {
        return Ok(());
    }

    let nonce_to_user = load_nonce_to_user_map(ledger).await?;
    let mut recovered = 0u32;

    for holding in orphans {
        let uri = holding.payload.get("agreementUri").and_then(|v| v.as_str()).unwrap_or("");
        let Some(nonce) = parse_nonce_from_uri(uri) else {
            tracing::warn!(contract_id = %holding.contract_id, uri, "orphan holding has unparsable agreementUri, skipping");
            continue;
        };

        let recipient_party = resolve_orphan_recipient(provider, config, &nonce_to_user, uri, nonce).await?;
        let Some(recipient_party) = recipient_party else {
            tracing::info!(contract_id = %holding.contract_id, nonce, "unable to resolve recipient for orphan, deferring");
            continue;
        };
        if recipient_party == config.ledger.operator_party {
            continue;
        }

        let amount_decimal = holding.payload.get("amount").and_then(|v| v.as_str()).unwrap_or("0").to_string();

        let confirmed = match &config.ledger.cip56_package_id {
            Some(package_id) => {
                recover_via_cip56(ledger, config, package_id, &holding.contract_id, &recipient_party, &amount_decimal).await?
            }
            None => recover_via_legacy(ledger, config, &holding.contract_id, &recipient_party).await?,
        };

        if confirmed {
            recovered += 1;
            crate::metrics::record_direction_outcome(crate::types::Direction::OrphanRecovery.label(), "recovered");
        }
    }

    tracing::info!(recovered, "orphan recovery pass complete");
    Ok(())
}

async fn load_nonce_to_user_map<L: LedgerApi>(ledger: &L) -> Result<std::collections::HashMap<u64, String>, RelayError> {
    let requests = ledger
        .query_active(BRIDGE_IN_REQUEST_TEMPLATE, Value::Null)
        .await
        .map_err(|e| RelayError::Transient(format!("failed to query bridge-in requests: {e}")))?;
    let mut map = std::collections::HashMap::new();
    for c in requests {
        let nonce = c.payload.get("nonce").and_then(|v| v.as_str()).and_then(|s| s.parse::<u64>().ok());
        let user = c.payload.get("user").and_then(|v| v.as_str()).map(str::to_string);
        if let (Some(nonce), Some(user)) = (nonce, user) {
            map.insert(nonce, user);
        }
    }
    Ok(map)
}

/// `ethereum:bridge-in:{bridgeAddr}:nonce:{n}:recipient:{encoded}` (§4.2 step 2, §4.6 step 1).
fn parse_nonce_from_uri(uri: &str) -> Option<u64> {
    let (_, rest) = uri.split_once(":nonce:")?;
    let (nonce_str, _) = rest.split_once(":recipient:")?;
    nonce_str.parse().ok()
}

fn parse_recipient_suffix_from_uri(uri: &str) -> Option<String> {
    let (_, rest) = uri.split_once(":recipient:")?;
    Some(urlencoding::decode(rest).ok()?.into_owned())
}

async fn resolve_orphan_recipient(
    provider: &EvmProvider,
    config: &Config,
    nonce_to_user: &std::collections::HashMap<u64, String>,
    uri: &str,
    nonce: u64,
) -> Result<Option<String>, RelayError> {
    // (a) nonce -> user map from the BridgeInRequest table.
    if let Some(user) = nonce_to_user.get(&nonce) {
        return Ok(Some(user.clone()));
    }

    // (b) URL-decoded URI suffix.
    if let Some(recipient) = parse_recipient_suffix_from_uri(uri) {
        if !recipient.is_empty() {
            return Ok(Some(recipient));
        }
    }

    // (c) Chain-event re-scan for that nonce.
    let bridge_address: Address = config
        .chain
        .bridge_address
        .parse()
        .map_err(|e| RelayError::Permanent(format!("invalid bridge address: {e}")))?;
    let current_block = provider
        .get_block_number()
        .await
        .map_err(|e| RelayError::Transient(format!("failed to fetch current block: {e}")))?;
    let from_block = current_block.saturating_sub(RESCAN_WINDOW_BLOCKS);

    let events = super::d2_bridge_in::scan(provider, bridge_address, from_block, current_block).await?;
    Ok(events.into_iter().find(|e| e.nonce == nonce).map(|e| e.canton_recipient))
}

/// Returns `true` once the CIP-56 `TransferInstruction` has been accepted (§4.6 step 3).
async fn recover_via_cip56<L: LedgerApi>(
    ledger: &L,
    config: &Config,
    package_id: &str,
    holding_cid: &str,
    recipient_party: &str,
    amount_decimal: &str,
) -> Result<bool, RelayError> {
    let now = crate::state::now_unix();
    let result = ledger
        .exercise(
            &format!("{package_id}:TransferFactory:TransferFactory"),
            holding_cid,
            "Transfer",
            json!({
                "transfer": {
                    "sender": config.ledger.operator_party,
                    "receiver": recipient_party,
                    "amount": amount_decimal,
                    "instrumentId": "mUSD",
                    "requestedAt": now,
                    "executeBefore": now + 3600,
                },
                "holdingCids": [holding_cid],
            }),
            vec![],
        )
        .await
        .map_err(|e| RelayError::Transient(format!("orphan CIP-56 transfer failed: {e}")))?;

    if !config.behavior.auto_accept_musd_transfer_proposals {
        return Ok(false);
    }
    let Some(instruction_cid) = result.get("transferInstructionCid").and_then(|v| v.as_str()) else {
        return Ok(false);
    };

    let accepted = ledger
        .exercise(
            &format!("{package_id}:TransferInstruction:TransferInstruction"),
            instruction_cid,
            "Accept",
            Value::Null,
            vec![recipient_party.to_string()],
        )
        .await;
    Ok(accepted.is_ok())
}

/// Returns `true` once the legacy transfer proposal has been accepted (§4.6 step 3).
async fn recover_via_legacy<L: LedgerApi>(
    ledger: &L,
    config: &Config,
    holding_cid: &str,
    recipient_party: &str,
) -> Result<bool, RelayError> {
    let compliance_registry_cid = format!("compliance-registry:orphan-recovery:{holding_cid}");
    let proposal = ledger
        .exercise(
            WRAPPED_HOLDING_TEMPLATE,
            holding_cid,
            "Transfer",
            json!({
                "newOwner": recipient_party,
                "complianceRegistryCid": compliance_registry_cid,
            }),
            vec![],
        )
        .await
        .map_err(|e| RelayError::Transient(format!("orphan legacy transfer failed: {e}")))?;

    if !config.behavior.auto_accept_musd_transfer_proposals {
        return Ok(false);
    }
    let Some(proposal_cid) = proposal.get("proposalCid").and_then(|v| v.as_str()) else {
        return Ok(false);
    };

    let accepted = ledger
        .exercise(
            TRANSFER_PROPOSAL_TEMPLATE,
            proposal_cid,
            "Accept",
            Value::Null,
            vec![recipient_party.to_string()],
        )
        .await;
    Ok(accepted.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nonce_out_of_agreement_uri() {
        let uri = "ethereum:bridge-in:0xabc:nonce:42:recipient:Alice%3A%3A1220abcd";
        assert_eq!(parse_nonce_from_uri(uri), Some(42));
    }

    #[test]
    fn decodes_recipient_suffix_from_uri() {
        let uri = "ethereum:bridge-in:0xabc:nonce:42:recipient:Alice%3A%3A1220abcd";
        assert_eq!(parse_recipient_suffix_from_uri(uri).as_deref(), Some("Alice::1220abcd"));
    }

    #[test]
    fn rejects_uri_without_nonce_marker() {
        assert_eq!(parse_nonce_from_uri("ethereum:bridge-in:0xabc:recipient:Alice"), None);
    }
}
