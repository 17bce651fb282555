//! Ledger→Chain Attestation Relay (D1, §4.1).
//!
//! Grounded on the teacher's `writers/evm.rs` submit-and-confirm loop
//! (estimate gas, apply a 1.2x buffer, send, wait for confirmations) and
//! `writers/retry.rs`'s classify-then-decide shape; the signature
//! aggregation and attestation-id computation are new, built directly from
//! §4.1 steps 8–12 against [`crate::hash`] and [`crate::signer`].

use alloy::primitives::{Address, B256, U256};
use alloy::providers::Provider;
use serde::Deserialize;
use serde_json::Value;

use crate::chain_client::EvmProvider;
use crate::config::Config;
use crate::contracts::IBridge;
use crate::errors::RelayError;
use crate::hash::{compute_attestation_id, compute_message_hash, derive_attestation_timestamp};
use crate::ledger_client::LedgerApi;
use crate::pause_guardian::{GuardianDecision, PauseGuardian};
use crate::rate_limiter::{RateLimitDecision, RateLimiter};
use crate::signer::{parse_validator_signature, recover_with_either_parity, Signer};
use crate::state::DurableState;
use crate::types::SubmissionOutcome;

use super::InFlightTracker;

const ATTESTATION_REQUEST_TEMPLATE: &str = "AttestationRequest:SignedAttestation";
const MAX_BATCH: usize = 100;
const MAX_CLOCK_DRIFT_SECS: i64 = 86_400;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerAttestationPayload {
    nonce: u64,
    chain_id: u64,
    global_ledger_assets_wei: String,
    expires_at_unix: i64,
    entropy_hex: String,
    ledger_state_hash_hex: String,
    #[serde(default)]
    signatures: Vec<LedgerValidatorSignature>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerValidatorSignature {
    validator_party: String,
    signature_hex: String,
}

struct Candidate {
    contract_id: String,
    nonce: u64,
    chain_id: u64,
    canton_assets_wei: u128,
    expires_at_unix: i64,
    entropy: [u8; 32],
    ledger_state_hash: [u8; 32],
    signatures: Vec<LedgerValidatorSignature>,
}

/// One pass of D1 (§4.1): query, validate, aggregate signatures, submit,
/// archive. Returns a typed [`RelayError`] the scheduler classifies.
pub async fn run<L: LedgerApi>(
    ledger: &L,
    provider: &EvmProvider,
    signer: &Signer,
    config: &Config,
    state: &mut DurableState,
    rate_limiter: &mut RateLimiter,
    guardian: &mut PauseGuardian,
    in_flight: &mut InFlightTracker,
) -> Result<(), RelayError> {
    let bridge_address: Address = config
        .chain
        .bridge_address
        .parse()
        .map_err(|e| RelayError::Permanent(format!("invalid BRIDGE address: {e}")))?;
    let bridge = IBridge::new(bridge_address, provider);

    // Step 1: query, sort ascending by nonce, cap at 100.
    let contracts = ledger
        .query_active(ATTESTATION_REQUEST_TEMPLATE, Value::Null)
        .await
        .map_err(|e| RelayError::Transient(format!("failed to query Ledger attestations: {e}")))?;

    let mut candidates: Vec<Candidate> = Vec::new();
    for contract in contracts {
        let payload: LedgerAttestationPayload = match serde_json::from_value(contract.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(contract_id = %contract.contract_id, error = %e, "malformed attestation payload, skipping");
                continue;
            }
        };
        let Ok(canton_assets_wei) = payload.global_ledger_assets_wei.parse::<u128>() else {
            tracing::warn!(contract_id = %contract.contract_id, "non-numeric globalLedgerAssetsWei, skipping");
            continue;
        };
        let Ok(entropy) = hex_to_32(&payload.entropy_hex) else {
            continue;
        };
        let Ok(ledger_state_hash) = hex_to_32(&payload.ledger_state_hash_hex) else {
            continue;
        };
        candidates.push(Candidate {
            contract_id: contract.contract_id,
            nonce: payload.nonce,
            chain_id: payload.chain_id,
            canton_assets_wei,
            expires_at_unix: payload.expires_at_unix,
            entropy,
            ledger_state_hash,
            signatures: payload.signatures,
        });
    }
    candidates.sort_by_key(|c| c.nonce);
    candidates.truncate(MAX_BATCH);

    let min_signatures: u64 = bridge
        .minSignatures()
        .call()
        .await
        .map_err(|e| RelayError::Transient(format!("minSignatures() call failed: {e}")))?
        ._0
        .try_into()
        .unwrap_or(u64::MAX);
    let on_chain_nonce: u64 = bridge
        .currentNonce()
        .call()
        .await
        .map_err(|e| RelayError::Transient(format!("currentNonce() call failed: {e}")))?
        ._0
        .try_into()
        .unwrap_or(0);

    for candidate in candidates {
        let outcome = process_one(
            provider,
            signer,
            config,
            state,
            rate_limiter,
            guardian,
            in_flight,
            &candidate,
            min_signatures,
            on_chain_nonce,
            bridge_address,
        )
        .await?;

        match outcome {
            SubmissionOutcome::Submitted { .. } => {
                let _ = ledger
                    .exercise(
                        ATTESTATION_REQUEST_TEMPLATE,
                        &candidate.contract_id,
                        "Attestation_Complete",
                        Value::Null,
                        vec![],
                    )
                    .await
                    .map_err(|e| tracing::warn!(error = %e, "Attestation_Complete failed (non-fatal)"));
                state.persist().map_err(|e| RelayError::Transient(e.to_string()))?;
            }
            SubmissionOutcome::AlreadyOnChain | SubmissionOutcome::Deferred(_) => {}
            SubmissionOutcome::Failed(reason) => {
                return Err(RelayError::Permanent(reason));
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn process_one(
    provider: &EvmProvider,
    signer: &Signer,
    config: &Config,
    state: &mut DurableState,
    rate_limiter: &mut RateLimiter,
    guardian: &mut PauseGuardian,
    in_flight: &mut InFlightTracker,
    candidate: &Candidate,
    min_signatures: u64,
    on_chain_nonce: u64,
    bridge_address: Address,
) -> Result<SubmissionOutcome, RelayError> {
    let bridge = IBridge::new(bridge_address, provider);

    // Step 2: skip if already consumed; signature threshold.
    if state.processed_attestations.contains(&candidate.contract_id) {
        return Ok(SubmissionOutcome::AlreadyOnChain);
    }
    if (candidate.signatures.len() as u64) < min_signatures {
        return Ok(SubmissionOutcome::Deferred("below signature threshold".into()));
    }

    // Step 3: strict nonce ordering.
    if candidate.nonce != on_chain_nonce + 1 {
        return Ok(SubmissionOutcome::Deferred(format!(
            "nonce {} != onChainNonce+1 ({})",
            candidate.nonce,
            on_chain_nonce + 1
        )));
    }

    // Step 4: cross-chain replay guard.
    if candidate.chain_id != config.chain.chain_id {
        return Err(RelayError::Security(format!(
            "attestation chainId {} does not match active chain {}",
            candidate.chain_id, config.chain.chain_id
        )));
    }

    // Step 5: in-flight dedup.
    if in_flight.is_in_flight(candidate.nonce, &candidate.contract_id) || in_flight.is_submitted(candidate.nonce) {
        return Ok(SubmissionOutcome::Deferred("already in flight".into()));
    }

    // Step 6: rate limit.
    let block = provider
        .get_block_number()
        .await
        .map_err(|e| RelayError::Transient(format!("failed to fetch block number: {e}")))?;
    if let RateLimitDecision::Denied(window) = rate_limiter.check(block) {
        crate::metrics::record_rate_limit_denied(match window {
            crate::rate_limiter::RateLimitWindow::Block => "block",
            crate::rate_limiter::RateLimitWindow::Minute => "minute",
            crate::rate_limiter::RateLimitWindow::Hour => "hour",
        });
        return Ok(SubmissionOutcome::Deferred("rate limited".into()));
    }

    // Step 7: pause guardian.
    guardian.ensure_baseline(candidate.canton_assets_wei);
    if let GuardianDecision::TripCapChange { change_bps } = guardian.evaluate_cap_change(candidate.canton_assets_wei) {
        crate::metrics::record_pause_triggered();
        crate::pause_guardian::invoke_pause(&crate::pause_guardian::BridgePauseInvoker {
            provider,
            bridge_address,
        })
        .await
        .map_err(|e| RelayError::Anomaly(format!("pause invocation failed: {e}")))?;
        return Err(RelayError::Anomaly(format!(
            "supply cap change of {change_bps} bps tripped the pause guardian"
        )));
    }

    // Step 8: compute attestation id; validate derived timestamp.
    let timestamp = derive_attestation_timestamp(candidate.expires_at_unix, config.attestation_timestamp_offset_secs);
    if timestamp <= 0 {
        state.processed_attestations.insert(candidate.contract_id.clone());
        return Err(RelayError::Permanent("derived attestation timestamp is non-positive".into()));
    }
    let now = crate::state::now_unix();
    if (timestamp - now).abs() > MAX_CLOCK_DRIFT_SECS {
        state.processed_attestations.insert(candidate.contract_id.clone());
        return Err(RelayError::Permanent("attestation timestamp drifts more than 86400s".into()));
    }

    let bridge_address_bytes: [u8; 20] = bridge_address.into_array();
    let id = compute_attestation_id(
        candidate.nonce,
        candidate.canton_assets_wei,
        timestamp,
        &candidate.entropy,
        &candidate.ledger_state_hash,
        candidate.chain_id,
        &bridge_address_bytes,
    );
    let id_hex = format!("0x{}", hex::encode(id));

    // Step 9: already-used check.
    if bridge
        .usedAttestationIds(B256::from(id))
        .call()
        .await
        .map_err(|e| RelayError::Transient(format!("usedAttestationIds() call failed: {e}")))?
        ._0
    {
        state.processed_attestations.insert(candidate.contract_id.clone());
        return Ok(SubmissionOutcome::AlreadyOnChain);
    }

    // Step 10: build message hash.
    let message_hash = compute_message_hash(
        &id,
        candidate.nonce,
        candidate.canton_assets_wei,
        timestamp,
        &candidate.entropy,
        &candidate.ledger_state_hash,
        candidate.chain_id,
        &bridge_address_bytes,
    );
    let digest = B256::from(message_hash);

    // Step 11: signature aggregation.
    let mut recovered: Vec<(Address, Vec<u8>)> = Vec::new();
    for sig in &candidate.signatures {
        let Some(expected) = config
            .routing
            .validator_addresses
            .get(&sig.validator_party)
            .and_then(|s| s.parse::<Address>().ok())
        else {
            continue;
        };
        let Ok(raw) = hex::decode(sig.signature_hex.trim_start_matches("0x")) else {
            continue;
        };
        let Ok(parsed) = parse_validator_signature(&raw) else {
            continue;
        };
        let result = if raw.len() == 65 {
            parsed
                .recover_address_from_prehash(&digest)
                .ok()
                .filter(|a| *a == expected)
                .map(|_| parsed)
        } else {
            recover_with_either_parity(parsed, digest, expected).ok()
        };
        if let Some(sig) = result {
            recovered.push((expected, sig.as_bytes().to_vec()));
        }
    }
    recovered.sort_by_key(|(addr, _)| *addr);

    if (recovered.len() as u64) < min_signatures {
        return Err(RelayError::Security("insufficient validly-recovered signatures".into()));
    }

    // Step 12: staticCall simulation.
    let attestation = crate::contracts::Attestation {
        nonce: U256::from(candidate.nonce),
        cantonAssets: U256::from(candidate.canton_assets_wei),
        timestamp: U256::from(timestamp.max(0) as u64),
        entropy: candidate.entropy.into(),
        ledgerStateHash: candidate.ledger_state_hash.into(),
        chainId: U256::from(candidate.chain_id),
    };
    let sig_bytes: Vec<alloy::primitives::Bytes> =
        recovered.iter().map(|(_, b)| alloy::primitives::Bytes::from(b.clone())).collect();

    let simulation = bridge.processAttestation(attestation.clone(), sig_bytes.clone()).call().await;
    if simulation.is_err() {
        let still_unused = !bridge
            .usedAttestationIds(B256::from(id))
            .call()
            .await
            .map(|r| r._0)
            .unwrap_or(false);
        if !still_unused {
            state.processed_attestations.insert(candidate.contract_id.clone());
            return Ok(SubmissionOutcome::AlreadyOnChain);
        }
        return Ok(SubmissionOutcome::Deferred("staticCall simulation reverted".into()));
    }

    // Step 13: submit, marking in-flight first.
    in_flight.mark_in_flight(candidate.nonce, &id_hex);
    let _ = signer; // the transaction-signing wallet is wired into `provider` by the caller.

    let call = bridge.processAttestation(attestation, sig_bytes);
    let pending = match call.send().await {
        Ok(p) => p,
        Err(e) => {
            in_flight.release(candidate.nonce, &id_hex);
            return Err(RelayError::Transient(format!("failed to submit processAttestation: {e}")));
        }
    };

    let receipt = match pending.get_receipt().await {
        Ok(r) => r,
        Err(_) => {
            // Ambiguous: timeout after send. Keep both markers.
            in_flight.keep();
            return Ok(SubmissionOutcome::Deferred("ambiguous confirmation status, markers retained".into()));
        }
    };

    if !receipt.status() {
        in_flight.release(candidate.nonce, &id_hex);
        return Err(RelayError::Permanent("processAttestation reverted on-chain".into()));
    }

    in_flight.confirm(candidate.nonce, &id_hex);
    rate_limiter.record_submission(block);

    // Step 14: refresh guardian baseline, persist.
    guardian.refresh_baseline(candidate.canton_assets_wei);
    state.processed_attestations.insert(candidate.contract_id.clone());
    crate::metrics::record_direction_outcome(crate::types::Direction::D1AttestationRelay.label(), "submitted");

    Ok(SubmissionOutcome::Submitted {
        tx_hash: receipt.transaction_hash,
    })
}

fn hex_to_32(s: &str) -> Result<[u8; 32], RelayError> {
    let bytes = hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| RelayError::Permanent(format!("invalid hex field: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| RelayError::Permanent("expected 32-byte hex field".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_to_32_rejects_wrong_length() {
        assert!(hex_to_32("0xabcd").is_err());
    }

    #[test]
    fn hex_to_32_accepts_32_bytes() {
        let s = format!("0x{}", "ab".repeat(32));
        assert!(hex_to_32(&s).is_ok());
    }
}
