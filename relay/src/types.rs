//! Core value types shared across every direction handler.

use std::fmt;

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};

/// One of the six reconciliation pipelines (D1…D4b), plus orphan recovery.
///
/// Order matters: the scheduler runs directions strictly in this sequence
/// every cycle (§5 of the relay specification).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    D1AttestationRelay,
    D2BridgeInWatcher,
    D2bRedemptionSettler,
    D3BridgeOutBacker,
    D4YieldBridgeIn,
    D4bEthPoolYieldBridgeIn,
    OrphanRecovery,
}

impl Direction {
    /// The six handlers the scheduler runs every cycle, in fixed order.
    /// Orphan recovery is scheduled separately (every 6th cycle).
    pub const CYCLE_ORDER: [Direction; 6] = [
        Direction::D1AttestationRelay,
        Direction::D2BridgeInWatcher,
        Direction::D2bRedemptionSettler,
        Direction::D3BridgeOutBacker,
        Direction::D4YieldBridgeIn,
        Direction::D4bEthPoolYieldBridgeIn,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Direction::D1AttestationRelay => "d1_attestation_relay",
            Direction::D2BridgeInWatcher => "d2_bridge_in_watcher",
            Direction::D2bRedemptionSettler => "d2b_redemption_settler",
            Direction::D3BridgeOutBacker => "d3_bridge_out_backer",
            Direction::D4YieldBridgeIn => "d4_yield_bridge_in",
            Direction::D4bEthPoolYieldBridgeIn => "d4b_eth_pool_yield_bridge_in",
            Direction::OrphanRecovery => "orphan_recovery",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Attestation direction field (distinct from the six-way `Direction` above —
/// this is the two-way flag carried on the Ledger-issued attestation itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttestationDirection {
    LedgerToChain,
    ChainToLedger,
}

/// A Ledger-issued artifact authorizing one Chain state change (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attestation {
    pub attestation_id: String,
    pub nonce: u64,
    pub chain_id: u64,
    /// Fixed-18-decimal total, carried as a decimal string to avoid float loss.
    pub global_ledger_assets: String,
    pub expires_at_unix: i64,
    pub entropy: [u8; 32],
    pub ledger_state_hash: [u8; 32],
    pub direction: AttestationDirection,
    pub signatures: Vec<ValidatorSignature>,
}

/// `(attestationId, validatorParty, ecdsaSignature, signedAt)` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSignature {
    pub attestation_id: String,
    pub validator_party: String,
    /// Either a raw 65-byte `r||s||v` signature or an ASN.1 DER-encoded one;
    /// disambiguated in `d1_attestation_relay::recover_signer`.
    pub signature_bytes: Vec<u8>,
    pub signed_at_unix: i64,
}

/// Outcome of attempting to submit one attestation, replacing exception-based
/// control flow in the dedup/already-processed paths (§9 design note).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Submitted { tx_hash: B256 },
    AlreadyOnChain,
    Deferred(String),
    Failed(String),
}

/// A recipient resolved on the Chain side, tagged with how it was resolved
/// (exact party id, alias, hint-prefix, or validator address map — §4.3 step 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecipient {
    pub address: Address,
    pub via: RecipientResolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientResolution {
    ExactPartyId,
    Alias,
    HintPrefix,
    ValidatorAddressMap,
}

/// A Ledger `BridgeInRequest` created by D2 in response to a Chain bridge-out
/// event (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInRequest {
    pub contract_id: String,
    pub operator: String,
    pub user: String,
    /// 18-decimal amount, carried as a decimal string.
    pub amount: String,
    pub fee_amount: String,
    pub source_chain_id: u64,
    pub nonce: u64,
    pub created_at_unix: i64,
    pub status: BridgeInStatus,
    pub validators: Option<Vec<String>>,
    pub required_signatures: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeInStatus {
    Pending,
    Completed,
    Cancelled,
}

/// A Ledger token representing mUSD issued by `issuer` and held by `owner` (§3).
///
/// Uniqueness is enforced by `(owner, agreement_uri)` — the URI is the
/// primary idempotency key for bridge-in-induced holdings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedHolding {
    pub contract_id: String,
    pub issuer: String,
    pub owner: String,
    pub amount: String,
    pub agreement_hash: String,
    pub agreement_uri: String,
    pub observers: Vec<String>,
}

/// A pending move of a [`WrappedHolding`] from `owner` to `new_owner`,
/// accepted by a separate choice (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProposal {
    pub contract_id: String,
    pub holding_cid: String,
    pub owner: String,
    pub new_owner: String,
    pub compliance_registry_cid: Option<String>,
}

/// `(operator, user, musdBurned, usdcOwed, feeAmount, createdAt, fulfilled)` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionRequest {
    pub contract_id: String,
    pub operator: String,
    pub user: String,
    pub musd_burned: String,
    /// 18-decimal fixed point, carried as a decimal string.
    pub usdc_owed: String,
    pub fee_amount: String,
    pub created_at_unix: i64,
    pub fulfilled: bool,
}

/// Operator-signed marker proving Chain-side settlement of a redemption (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionEthereumSettlement {
    pub operator: String,
    pub user: String,
    pub redemption_cid: String,
    pub recipient_eth: String,
    pub amount_paid: String,
    pub eth_tx_hash: String,
    pub settled_at_unix: i64,
}

/// Chain event shapes decoded against the ABIs in §6 (§2A supplemental).
#[derive(Debug, Clone)]
pub struct AttestationReceivedEvent {
    pub id: [u8; 32],
    pub canton_assets: u128,
    pub new_supply_cap: u128,
    pub nonce: u64,
    pub timestamp_unix: i64,
}

#[derive(Debug, Clone)]
pub struct BridgeToCantonRequestedEvent {
    pub request_id: [u8; 32],
    pub sender: Address,
    pub amount_wei: u128,
    pub nonce: u64,
    pub canton_recipient: String,
    pub timestamp_unix: i64,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: B256,
}

#[derive(Debug, Clone)]
pub struct CantonYieldBridgedEvent {
    pub epoch: u64,
    pub musd_amount: u128,
    pub canton_recipient: String,
    pub block_number: u64,
}

#[derive(Debug, Clone)]
pub struct EthPoolYieldBridgedEvent {
    pub epoch: u64,
    pub yield_usdc: u128,
    pub musd_bridged: u128,
    pub eth_pool_recipient: String,
    pub block_number: u64,
}

/// The four scan cursors plus the five processed-id sets, serialized as a
/// single state file (§3, §5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub version: u32,
    pub timestamp: i64,
    pub processed_attestations: Vec<String>,
    pub processed_bridge_outs: Vec<String>,
    pub processed_yield_epochs: Vec<String>,
    #[serde(rename = "processedETHPoolYieldEpochs")]
    pub processed_eth_pool_yield_epochs: Vec<String>,
    pub processed_redemption_requests: Vec<String>,
    pub last_scanned_block: u64,
    pub last_yield_scanned_block: u64,
    #[serde(rename = "lastETHPoolYieldScannedBlock")]
    pub last_eth_pool_yield_scanned_block: u64,
}

/// Current state file schema version (§5: "Version field gates
/// forward-compatibility").
pub const STATE_FILE_VERSION: u32 = 1;

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_FILE_VERSION,
            timestamp: 0,
            processed_attestations: Vec::new(),
            processed_bridge_outs: Vec::new(),
            processed_yield_epochs: Vec::new(),
            processed_eth_pool_yield_epochs: Vec::new(),
            processed_redemption_requests: Vec::new(),
            last_scanned_block: 0,
            last_yield_scanned_block: 0,
            last_eth_pool_yield_scanned_block: 0,
        }
    }
}

/// Per-direction health used for fault isolation demotion (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

impl HealthStatus {
    /// Poll cadence divisor: run every cycle when healthy, every 3rd when
    /// degraded, every 10th when failed (§5).
    pub fn cadence_divisor(&self) -> u64 {
        match self {
            HealthStatus::Healthy => 1,
            HealthStatus::Degraded => 3,
            HealthStatus::Failed => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_order_runs_d1_through_d4b_in_sequence() {
        assert_eq!(Direction::CYCLE_ORDER[0], Direction::D1AttestationRelay);
        assert_eq!(Direction::CYCLE_ORDER[5], Direction::D4bEthPoolYieldBridgeIn);
    }

    #[test]
    fn direction_label_is_stable_for_metrics() {
        assert_eq!(Direction::D2bRedemptionSettler.label(), "d2b_redemption_settler");
    }
}
