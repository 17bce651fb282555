//! Chain→Ledger Bridge-In Watcher and Completion (D2, §4.2).
//!
//! Grounded on the teacher's `multichain-rs/src/evm/watcher.rs`
//! (`Filter::new().address(..).from_block(..).to_block(..)`, chunked at
//! `max_block_range` to stay under RPC per-call caps) for the scan half, and
//! on `writers/evm.rs`'s submit-then-confirm shape for the completion half.
//! `cantonRecipient` is a dynamic `string` field, so logs are decoded with
//! alloy's `sol!`-generated event type rather than the teacher's manual
//! fixed-width byte offsets, which only ever covered fixed-size ABI words.

use std::collections::HashMap;

use alloy::primitives::Address;
use alloy::providers::Provider;
use alloy::rpc::types::Filter;
use alloy::sol_types::SolEvent;
use serde_json::{json, Value};

use crate::chain_client::EvmProvider;
use crate::config::Config;
use crate::contracts::IBridge;
use crate::errors::RelayError;
use crate::hash::{bridge_in_agreement_hash, bridge_in_agreement_uri};
use crate::ledger_client::LedgerApi;
use crate::state::DurableState;
use crate::types::BridgeToCantonRequestedEvent;

use super::wei_to_decimal_string;

const MAX_BLOCK_RANGE: u64 = 10_000;
pub(super) const BRIDGE_IN_REQUEST_TEMPLATE: &str = "BridgeInRequest:BridgeInRequest";
pub(super) const WRAPPED_HOLDING_TEMPLATE: &str = "WrappedHolding:WrappedHolding";
pub(super) const TRANSFER_PROPOSAL_TEMPLATE: &str = "TransferProposal:TransferProposal";
const BRIDGE_IN_ATTESTATION_REQUEST_TEMPLATE: &str = "AttestationRequest:AttestationRequest";
const SIGNED_ATTESTATION_TEMPLATE: &str = "AttestationRequest:SignedAttestation";
const VALIDATOR_SELF_ATTESTATION_TEMPLATE: &str = "ValidatorSelfAttestation:ValidatorSelfAttestation";

/// `(nonce, amountWei, eventTimestampSec, recipient)` fingerprint for
/// pre-existing requests, mapped to their contract id so a restart never
/// double-creates and a request stuck mid-completion is retried against the
/// same contract rather than skipped (§4.2 "Create BridgeInRequest").
type Fingerprint = (u64, u128, i64, String);

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

    if confirmed_block <= state.last_scanned_block {
        return Ok(());
    }

    let bridge_address: Address = config
        .chain
        .bridge_address
        .parse()
        .map_err(|e| RelayError::Permanent(format!("invalid bridge address: {e}")))?;
    let yield_distributor: Address = config
        .chain
        .yield_distributor_address
        .parse()
        .map_err(|e| RelayError::Permanent(format!("invalid yield distributor address: {e}")))?;
    let eth_pool_yield_distributor: Address = config
        .chain
        .eth_pool_yield_distributor_address
        .parse()
        .map_err(|e| RelayError::Permanent(format!("invalid eth pool yield distributor address: {e}")))?;

    let from_block = state.last_scanned_block + 1;
    let events = scan(provider, bridge_address, from_block, confirmed_block).await?;

    let fingerprints = load_fingerprints(ledger).await?;

    let mut highest_processed = state.last_scanned_block;
    let mut dirty = false;

    for event in events {
        let id_hex = crate::hash::bytes32_to_hex(&event.request_id);

        if state.processed_bridge_outs.contains(&id_hex) {
            highest_processed = highest_processed.max(event.block_number);
            continue;
        }

        // Step 3: events from the yield distributors belong to D4/D4b.
        if event.sender == yield_distributor || event.sender == eth_pool_yield_distributor {
            state.processed_bridge_outs.insert(&id_hex);
            dirty = true;
            highest_processed = highest_processed.max(event.block_number);
            continue;
        }

        // Step 4: party-id grammar validation; failures are unrecoverable.
        if !is_valid_party_id(&event.canton_recipient) {
            tracing::warn!(nonce = event.nonce, recipient = %event.canton_recipient, "invalid cantonRecipient, marking processed");
            state.processed_bridge_outs.insert(&id_hex);
            dirty = true;
            highest_processed = highest_processed.max(event.block_number);
            continue;
        }

        match process_one(ledger, config, &event, &fingerprints).await {
            Ok(true) => {
                state.processed_bridge_outs.insert(&id_hex);
                dirty = true;
                highest_processed = highest_processed.max(event.block_number);
                crate::metrics::record_direction_outcome(
                    crate::types::Direction::D2BridgeInWatcher.label(),
                    "submitted",
                );
            }
            Ok(false) => {
                // Deferred: user party not hosted yet, or completion genuinely
                // failed. Stop advancing the cursor past this block so the
                // event (and, on a restart, the same BridgeInRequest) is
                // retried next cycle.
                tracing::info!(nonce = event.nonce, "bridge-in deferred, retrying next cycle");
                break;
            }
            Err(e) => {
                // Stop at first processing error; retry next cycle (§4.2 cursor advance rule).
                if dirty {
                    state.last_scanned_block = crate::state::advance_cursor(state.last_scanned_block, highest_processed);
                    state
                        .persist()
                        .map_err(|e| RelayError::Transient(format!("failed to persist state: {e}")))?;
                }
                return Err(e);
            }
        }
    }

    if dirty {
        state.last_scanned_block = crate::state::advance_cursor(state.last_scanned_block, highest_processed);
        crate::metrics::record_cursor_advance(
            crate::types::Direction::D2BridgeInWatcher.label(),
            state.last_scanned_block,
        );
        state
            .persist()
            .map_err(|e| RelayError::Transient(format!("failed to persist state: {e}")))?;
    }

    Ok(())
}

/// `pub(super)` so [`super::orphan_recovery`] can re-scan for a single
/// nonce's recipient without duplicating the filter/decode logic (§4.6 step 1c).
pub(super) async fn scan(
    provider: &EvmProvider,
    bridge_address: Address,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<BridgeToCantonRequestedEvent>, RelayError> {
    let mut events = Vec::new();
    let mut current_from = from_block;

    while current_from <= to_block {
        let current_to = std::cmp::min(current_from + MAX_BLOCK_RANGE - 1, to_block);

        let filter = Filter::new()
            .address(bridge_address)
            .event_signature(IBridge::BridgeToCantonRequested::SIGNATURE_HASH)
            .from_block(current_from)
            .to_block(current_to);

        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| RelayError::Transient(format!("failed to fetch bridge-in logs: {e}")))?;

        for log in logs {
            let block_number = log.block_number.unwrap_or(current_to);
            let log_index = log.log_index.unwrap_or(0);
            let tx_hash = log.transaction_hash.unwrap_or_default();
            match log.log_decode::<IBridge::BridgeToCantonRequested>() {
                Ok(decoded) => {
                    let inner = decoded.inner.data;
                    events.push(BridgeToCantonRequestedEvent {
                        request_id: inner.requestId.0,
                        sender: inner.sender,
                        amount_wei: inner.amount.to::<u128>(),
                        nonce: inner.nonce.to::<u64>(),
                        canton_recipient: inner.cantonRecipient,
                        timestamp_unix: inner.timestamp.to::<i64>(),
                        block_number,
                        log_index,
                        tx_hash,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, block = block_number, "failed to decode BridgeToCantonRequested log");
                }
            }
        }

        current_from = current_to + 1;
    }

    events.sort_by_key(|e| (e.block_number, e.log_index));
    Ok(events)
}

async fn load_fingerprints<L: LedgerApi>(ledger: &L) -> Result<HashMap<Fingerprint, String>, RelayError> {
    let existing = ledger
        .query_active(BRIDGE_IN_REQUEST_TEMPLATE, Value::Null)
        .await
        .map_err(|e| RelayError::Transient(format!("failed to query existing bridge-in requests: {e}")))?;

    let mut fingerprints = HashMap::new();
    for contract in existing {
        let nonce = contract.payload.get("nonce").and_then(|v| v.as_str()).and_then(|s| s.parse::<u64>().ok());
        let amount = contract
            .payload
            .get("amount")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .map(|f| (f * 1e18) as u128);
        let created_at = contract.payload.get("createdAt").and_then(|v| v.as_i64());
        let user = contract.payload.get("user").and_then(|v| v.as_str()).map(str::to_string);
        if let (Some(nonce), Some(amount), Some(created_at), Some(user)) = (nonce, amount, created_at, user) {
            fingerprints.insert((nonce, amount, created_at, user), contract.contract_id);
        }
    }
    Ok(fingerprints)
}

/// Returns `Ok(true)` when the request was fully processed (holding
/// delivered and completion confirmed) this cycle, `Ok(false)` when it
/// should be deferred without marking processed — either because the user
/// party is not yet hosted, or because completion genuinely failed and must
/// be retried against the same `BridgeInRequest` next cycle.
async fn process_one<L: LedgerApi>(
    ledger: &L,
    config: &Config,
    event: &BridgeToCantonRequestedEvent,
    fingerprints: &HashMap<Fingerprint, String>,
) -> Result<bool, RelayError> {
    let recipient_party = resolve_ledger_recipient(&config.routing, &event.canton_recipient);

    let fingerprint = (event.nonce, event.amount_wei, event.timestamp_unix, recipient_party.clone());
    let agreement_hash = bridge_in_agreement_hash(event.nonce);
    let agreement_uri = bridge_in_agreement_uri(&config.chain.bridge_address, event.nonce, &recipient_party);
    let amount_decimal = wei_to_decimal_string(event.amount_wei);

    let contract_id = if let Some(existing_cid) = fingerprints.get(&fingerprint) {
        existing_cid.clone()
    } else {
        let payload = json!({
            "operator": config.ledger.operator_party,
            "user": recipient_party,
            "amount": amount_decimal,
            "feeAmount": "0",
            "sourceChainId": config.chain.chain_id,
            "nonce": event.nonce.to_string(),
            "createdAt": event.timestamp_unix,
            "status": "pending",
        });

        match ledger.create(BRIDGE_IN_REQUEST_TEMPLATE, payload).await {
            Ok(cid) => cid,
            Err(e) => {
                let msg = e.to_string();
                if msg.to_lowercase().contains("not hosted on this participant") {
                    return Ok(false);
                }
                return Err(RelayError::Permanent(format!("failed to create BridgeInRequest: {msg}")));
            }
        }
    };

    if !holding_already_delivered(ledger, &agreement_uri, &agreement_hash, event.amount_wei).await? {
        deliver_holding(ledger, config, &recipient_party, &amount_decimal, &agreement_hash, &agreement_uri)
            .await
            .map_err(|e| RelayError::Permanent(format!("failed to deliver wrapped holding: {e}")))?;
        crate::metrics::record_volume(
            crate::types::Direction::D2BridgeInWatcher.label(),
            "musd",
            amount_decimal.parse().unwrap_or(0.0),
        );
    }

    complete_bridge_in_request(ledger, &contract_id).await
}

/// Resolve the Ledger-side recipient party for a raw `cantonRecipient` hint
/// from the Chain event (§4.2 "Create BridgeInRequest": "Resolve the
/// recipient via an alias map (exact full party id first, then the
/// `name::hint` prefix)"). An already-well-formed full party id is used
/// unchanged; otherwise the alias map is consulted by exact key, then by
/// `name::` prefix against the map's alias keys.
fn resolve_ledger_recipient(routing: &crate::config::RoutingConfig, raw: &str) -> String {
    if is_valid_party_id(raw) {
        return raw.to_string();
    }
    if let Some(canonical) = routing.recipient_party_aliases.get(raw) {
        return canonical.clone();
    }
    let hint = raw.split_once("::").map(|(h, _)| h).unwrap_or(raw);
    if let Some((_, canonical)) = routing.recipient_party_aliases.iter().find(|(k, _)| k.starts_with(hint)) {
        return canonical.clone();
    }
    raw.to_string()
}

async fn holding_already_delivered<L: LedgerApi>(
    ledger: &L,
    agreement_uri: &str,
    agreement_hash: &str,
    amount_wei: u128,
) -> Result<bool, RelayError> {
    let existing = ledger
        .query_active(WRAPPED_HOLDING_TEMPLATE, Value::Null)
        .await
        .map_err(|e| RelayError::Transient(format!("failed to query wrapped holdings: {e}")))?;

    for contract in existing {
        let uri = contract.payload.get("agreementUri").and_then(|v| v.as_str());
        if uri == Some(agreement_uri) {
            return Ok(true);
        }
        // Legacy records without a URI: match on hash and amount.
        if uri.is_none() {
            let hash_matches = contract.payload.get("agreementHash").and_then(|v| v.as_str()) == Some(agreement_hash);
            let amount_matches = contract
                .payload
                .get("amount")
                .and_then(|v| v.as_str())
                .map(|s| s == wei_to_decimal_string(amount_wei))
                .unwrap_or(false);
            if hash_matches && amount_matches {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Preferred CIP-56 path when a transfer-factory package is configured,
/// else the legacy owned-holding-plus-Transfer path (§4.2 steps 4-5).
async fn deliver_holding<L: LedgerApi>(
    ledger: &L,
    config: &Config,
    recipient_party: &str,
    amount_decimal: &str,
    agreement_hash: &str,
    agreement_uri: &str,
) -> eyre::Result<()> {
    if let Some(package_id) = &config.ledger.cip56_package_id {
        return deliver_via_cip56(ledger, config, package_id, recipient_party, amount_decimal, agreement_hash, agreement_uri).await;
    }
    deliver_via_legacy_transfer(ledger, config, recipient_party, amount_decimal, agreement_hash, agreement_uri).await
}

async fn deliver_via_cip56<L: LedgerApi>(
    ledger: &L,
    config: &Config,
    package_id: &str,
    recipient_party: &str,
    amount_decimal: &str,
    agreement_hash: &str,
    agreement_uri: &str,
) -> eyre::Result<()> {
    let holding_cid = ledger
        .create(
            &format!("{package_id}:Holding:CIP56MintedMUSD"),
            json!({
                "issuer": config.ledger.operator_party,
                "owner": config.ledger.operator_party,
                "amount": amount_decimal,
                "agreementHash": agreement_hash,
                "agreementUri": agreement_uri,
            }),
        )
        .await?;

    let now = crate::state::now_unix();
    let transfer_result = ledger
        .exercise(
            &format!("{package_id}:TransferFactory:TransferFactory"),
            &holding_cid,
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
        .await;

    let Ok(result) = transfer_result else {
        // Mint succeeded, transfer failed: leave the stranded holding for
        // orphan recovery rather than falling back to the legacy path
        // (would double-mint).
        tracing::warn!(holding_cid = %holding_cid, "CIP-56 transfer failed after mint, leaving for orphan recovery");
        return Ok(());
    };

    if config.behavior.auto_accept_musd_transfer_proposals {
        if let Some(instruction_cid) = result.get("transferInstructionCid").and_then(|v| v.as_str()) {
            let _ = ledger
                .exercise(
                    &format!("{package_id}:TransferInstruction:TransferInstruction"),
                    instruction_cid,
                    "Accept",
                    Value::Null,
                    vec![recipient_party.to_string()],
                )
                .await;
        }
    }

    Ok(())
}

async fn deliver_via_legacy_transfer<L: LedgerApi>(
    ledger: &L,
    config: &Config,
    recipient_party: &str,
    amount_decimal: &str,
    agreement_hash: &str,
    agreement_uri: &str,
) -> eyre::Result<()> {
    let holding_cid = ledger
        .create(
            WRAPPED_HOLDING_TEMPLATE,
            json!({
                "issuer": config.ledger.operator_party,
                "owner": config.ledger.operator_party,
                "amount": amount_decimal,
                "agreementHash": agreement_hash,
                "agreementUri": agreement_uri,
                "observers": Value::Array(vec![]),
            }),
        )
        .await?;

    let compliance_registry_cid = format!("compliance-registry:{agreement_uri}");
    let proposal = ledger
        .exercise(
            WRAPPED_HOLDING_TEMPLATE,
            &holding_cid,
            "Transfer",
            json!({
                "newOwner": recipient_party,
                "complianceRegistryCid": compliance_registry_cid,
            }),
            vec![],
        )
        .await?;

    if config.behavior.auto_accept_musd_transfer_proposals {
        if let Some(proposal_cid) = proposal.get("proposalCid").and_then(|v| v.as_str()) {
            let _ = ledger
                .exercise(
                    TRANSFER_PROPOSAL_TEMPLATE,
                    proposal_cid,
                    "Accept",
                    Value::Null,
                    vec![recipient_party.to_string()],
                )
                .await;
        }
    }

    Ok(())
}

/// Attestation-style completion when the request schema carries validator
/// fields, else a plain `BridgeIn_Cancel` archive (§4.2 step 6). Returns
/// `Ok(true)` once the request is completed, cancelled, or was already gone
/// (archived by a prior cycle); `Ok(false)` to leave it pending for retry.
async fn complete_bridge_in_request<L: LedgerApi>(ledger: &L, contract_id: &str) -> Result<bool, RelayError> {
    let requests = ledger
        .query_active(BRIDGE_IN_REQUEST_TEMPLATE, Value::Null)
        .await
        .map_err(|e| RelayError::Transient(format!("failed to re-query BridgeInRequest for completion: {e}")))?;

    let Some(request) = requests.iter().find(|c| c.contract_id == contract_id) else {
        // Already completed or cancelled by a prior cycle.
        return Ok(true);
    };

    let validators = request
        .payload
        .get("validators")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect::<Vec<String>>())
        .filter(|v| !v.is_empty());

    let Some(validators) = validators else {
        return match ledger
            .exercise(BRIDGE_IN_REQUEST_TEMPLATE, contract_id, "BridgeIn_Cancel", Value::Null, vec![])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(contract_id, error = %e, "BridgeIn_Cancel failed, leaving request pending for retry");
                Ok(false)
            }
        };
    };

    match sign_and_complete(ledger, contract_id, &validators).await {
        Ok(()) => Ok(true),
        Err(e) => {
            tracing::warn!(contract_id, error = %e, "bridge-in attestation completion failed, leaving request pending for retry");
            Ok(false)
        }
    }
}

/// Build an `AttestationRequest` with empty signatures, have each validator
/// self-attest, fold the self-attestations into a `SignedAttestation` (first
/// validator via `Attestation_Sign`, the rest via
/// `SignedAttestation_AddSignature`), then exercise `BridgeIn_Complete` with
/// the result (§4.2 step 6). Any step failing aborts without archiving
/// anything, so the caller retries next cycle.
async fn sign_and_complete<L: LedgerApi>(ledger: &L, contract_id: &str, validators: &[String]) -> eyre::Result<()> {
    let attestation_cid = ledger
        .create(
            BRIDGE_IN_ATTESTATION_REQUEST_TEMPLATE,
            json!({
                "bridgeInRequestCid": contract_id,
                "signatures": Value::Array(vec![]),
            }),
        )
        .await?;

    let mut signed_cid: Option<String> = None;

    for (i, validator_party) in validators.iter().enumerate() {
        let self_attestation_cid = ledger
            .create(
                VALIDATOR_SELF_ATTESTATION_TEMPLATE,
                json!({
                    "validator": validator_party,
                    "bridgeInRequestCid": contract_id,
                }),
            )
            .await?;

        if i == 0 {
            let result = ledger
                .exercise(
                    BRIDGE_IN_ATTESTATION_REQUEST_TEMPLATE,
                    &attestation_cid,
                    "Attestation_Sign",
                    json!({ "selfAttestationCid": self_attestation_cid }),
                    vec![validator_party.clone()],
                )
                .await?;
            signed_cid = Some(
                result
                    .get("signedAttestationCid")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| eyre::eyre!("Attestation_Sign result missing signedAttestationCid"))?
                    .to_string(),
            );
        } else {
            let cid = signed_cid
                .clone()
                .ok_or_else(|| eyre::eyre!("no SignedAttestation to add a signature to"))?;
            let result = ledger
                .exercise(
                    SIGNED_ATTESTATION_TEMPLATE,
                    &cid,
                    "SignedAttestation_AddSignature",
                    json!({ "selfAttestationCid": self_attestation_cid }),
                    vec![validator_party.clone()],
                )
                .await?;
            signed_cid = Some(
                result
                    .get("signedAttestationCid")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or(cid),
            );
        }
    }

    let signed_cid = signed_cid.ok_or_else(|| eyre::eyre!("no validators to attest bridge-in request"))?;

    ledger
        .exercise(
            BRIDGE_IN_REQUEST_TEMPLATE,
            contract_id,
            "BridgeIn_Complete",
            json!({ "signedAttestationCid": signed_cid }),
            vec![],
        )
        .await?;

    Ok(())
}

/// Canton party-id grammar: `name::fingerprint`, where `name` is
/// alphanumeric/`-`/`_`/`.` of length 1-255 and `fingerprint` is a
/// non-empty lowercase-hex string (§4.2 step 4, §6 party-id grammar).
fn is_valid_party_id(party: &str) -> bool {
    let Some((name, fingerprint)) = party.split_once("::") else {
        return false;
    };
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return false;
    }
    !fingerprint.is_empty() && fingerprint.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_party_id_accepts_name_and_hex_fingerprint() {
        assert!(is_valid_party_id("Alice::1220abcdef"));
    }

    #[test]
    fn valid_party_id_rejects_missing_separator() {
        assert!(!is_valid_party_id("Alice"));
    }

    #[test]
    fn valid_party_id_rejects_non_hex_fingerprint() {
        assert!(!is_valid_party_id("Alice::not-hex!"));
    }

    #[test]
    fn resolve_ledger_recipient_passes_through_a_valid_full_party_id() {
        let routing = crate::config::RoutingConfig::default();
        assert_eq!(resolve_ledger_recipient(&routing, "alice::1220abcd"), "alice::1220abcd");
    }

    #[test]
    fn resolve_ledger_recipient_uses_exact_alias_match() {
        let mut routing = crate::config::RoutingConfig::default();
        routing
            .recipient_party_aliases
            .insert("bob-hint".to_string(), "bob::1220bb".to_string());
        assert_eq!(resolve_ledger_recipient(&routing, "bob-hint"), "bob::1220bb");
    }

    #[test]
    fn resolve_ledger_recipient_falls_back_to_name_prefix_match() {
        let mut routing = crate::config::RoutingConfig::default();
        routing
            .recipient_party_aliases
            .insert("carol::1220cc".to_string(), "carol-canonical::1220cc".to_string());
        // Fails the party-id grammar (non-hex fingerprint) and has no exact
        // alias key, but its `name::` hint ("carol") matches an alias key's prefix.
        assert_eq!(resolve_ledger_recipient(&routing, "carol::not-hex"), "carol-canonical::1220cc");
    }
}
