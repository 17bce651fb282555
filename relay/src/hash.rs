//! Hash and identifier computation for the attestation path and bridge-in
//! idempotency keys.
//!
//! Grounded on the keccak256-based id computation pattern used elsewhere in
//! this lineage (`WithdrawHash::compute`), generalized to the attestation
//! `id`/`messageHash` fields and the agreement hash/URI pair (§4.1, §4.2, §9).

use tiny_keccak::{Hasher, Keccak};

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// `keccak256(abi.encodePacked(nonce, cantonAssets, timestamp, entropy, ledgerStateHash, chainId, bridgeAddress))` (§4.1 step 8).
///
/// `cantonAssets` is passed pre-parsed as a `u128` wei-equivalent (18-decimal)
/// integer; callers are responsible for rejecting amounts that do not fit.
pub fn compute_attestation_id(
    nonce: u64,
    canton_assets_wei: u128,
    timestamp_unix: i64,
    entropy: &[u8; 32],
    ledger_state_hash: &[u8; 32],
    chain_id: u64,
    bridge_address: &[u8; 20],
) -> [u8; 32] {
    let mut data = Vec::with_capacity(32 + 32 + 32 + 32 + 32 + 32 + 20);
    data.extend_from_slice(&u256_word(nonce as u128));
    data.extend_from_slice(&u256_word(canton_assets_wei));
    data.extend_from_slice(&u256_word(timestamp_unix.max(0) as u128));
    data.extend_from_slice(entropy);
    data.extend_from_slice(ledger_state_hash);
    data.extend_from_slice(&u256_word(chain_id as u128));
    data.extend_from_slice(bridge_address);
    keccak256(&data)
}

/// Left-pad a value into a 32-byte big-endian word, matching Solidity's
/// `abi.encodePacked` of a `uint256` (the `Attestation` struct in
/// `contracts.rs` types `nonce`/`cantonAssets`/`timestamp`/`chainId` as
/// `uint256`, so every one of these fields packs to a full word on-chain,
/// not just its native Rust width).
fn u256_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Derive the attestation `timestamp` field: `floor(expiresAt_unix) - offset_secs`
/// (§4.1 step 8). `offset_secs` is the TTL constant duplicated on the Ledger-side
/// aggregator (`attestation_timestamp_offset_secs` in config, default 3600 —
/// §9 Open Questions) rather than a hardcoded value, so both sides can be kept
/// in lockstep.
pub fn derive_attestation_timestamp(expires_at_unix: i64, offset_secs: i64) -> i64 {
    expires_at_unix - offset_secs
}

/// Build the signable `messageHash`: the same fields as [`compute_attestation_id`]
/// with `id` prepended, then the standard personal-sign prefix applied
/// (§4.1 step 10).
pub fn compute_message_hash(
    id: &[u8; 32],
    nonce: u64,
    canton_assets_wei: u128,
    timestamp_unix: i64,
    entropy: &[u8; 32],
    ledger_state_hash: &[u8; 32],
    chain_id: u64,
    bridge_address: &[u8; 20],
) -> [u8; 32] {
    let mut data = Vec::with_capacity(32 + 32 + 32 + 32 + 32 + 32 + 32 + 20);
    data.extend_from_slice(id);
    data.extend_from_slice(&u256_word(nonce as u128));
    data.extend_from_slice(&u256_word(canton_assets_wei));
    data.extend_from_slice(&u256_word(timestamp_unix.max(0) as u128));
    data.extend_from_slice(entropy);
    data.extend_from_slice(ledger_state_hash);
    data.extend_from_slice(&u256_word(chain_id as u128));
    data.extend_from_slice(bridge_address);
    let digest = keccak256(&data);
    personal_sign_prefix(&digest)
}

/// `keccak256("\x19Ethereum Signed Message:\n32" || digest)`.
pub fn personal_sign_prefix(digest: &[u8; 32]) -> [u8; 32] {
    let mut data = Vec::with_capacity(28 + 32);
    data.extend_from_slice(b"\x19Ethereum Signed Message:\n32");
    data.extend_from_slice(digest);
    keccak256(&data)
}

/// Deterministic `agreementHash = "bridge-in:nonce:{n}:"` right-padded to 64
/// chars (§4.2 step 1). Kept only as an advisory secondary match — the URI
/// below is the primary idempotency key (§9 Open Questions).
pub fn bridge_in_agreement_hash(nonce: u64) -> String {
    pad_right(&format!("bridge-in:nonce:{nonce}:"), 64)
}

/// `agreementUri = "ethereum:bridge-in:{bridgeAddr}:nonce:{n}:recipient:{urlEncodedParty}"` (§4.2 step 2).
///
/// This is the authoritative idempotency key for bridge-in-induced holdings
/// (§3, §8 exactly-once invariant).
pub fn bridge_in_agreement_uri(bridge_address_hex: &str, nonce: u64, recipient_party: &str) -> String {
    format!(
        "ethereum:bridge-in:{}:nonce:{}:recipient:{}",
        bridge_address_hex,
        nonce,
        urlencoding::encode(recipient_party)
    )
}

/// `agreementHash = "{pool}-yield-epoch:{n}:".padEnd(64,"0")`, plus the legacy
/// non-padded variant for matching (§4.5 step 1).
pub fn yield_epoch_agreement_hash(pool: &str, epoch: u64) -> (String, String) {
    let legacy = format!("{pool}-yield-epoch:{epoch}:");
    (pad_right(&legacy, 64), legacy)
}

fn pad_right(s: &str, width: usize) -> String {
    if s.len() >= width {
        return s[..width].to_string();
    }
    let mut out = String::with_capacity(width);
    out.push_str(s);
    out.extend(std::iter::repeat('0').take(width - s.len()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attestation_id_is_deterministic() {
        let entropy = [1u8; 32];
        let lsh = [2u8; 32];
        let bridge = [3u8; 20];
        let a = compute_attestation_id(5, 1_000_000_000_000_000_000_000, 1_700_000_000, &entropy, &lsh, 1, &bridge);
        let b = compute_attestation_id(5, 1_000_000_000_000_000_000_000, 1_700_000_000, &entropy, &lsh, 1, &bridge);
        assert_eq!(a, b);
    }

    #[test]
    fn u256_word_left_pads_to_32_bytes() {
        let word = u256_word(5);
        assert_eq!(word.len(), 32);
        assert_eq!(&word[..31], &[0u8; 31]);
        assert_eq!(word[31], 5);
    }

    #[test]
    fn attestation_id_changes_with_nonce() {
        let entropy = [1u8; 32];
        let lsh = [2u8; 32];
        let bridge = [3u8; 20];
        let a = compute_attestation_id(5, 1_000, 1_700_000_000, &entropy, &lsh, 1, &bridge);
        let b = compute_attestation_id(6, 1_000, 1_700_000_000, &entropy, &lsh, 1, &bridge);
        assert_ne!(a, b);
    }

    #[test]
    fn derived_timestamp_subtracts_configured_offset() {
        assert_eq!(derive_attestation_timestamp(3600, 3600), 0);
        assert_eq!(derive_attestation_timestamp(3599, 3600), -1);
        assert_eq!(derive_attestation_timestamp(7200, 1800), 5400);
    }

    #[test]
    fn bridge_in_agreement_hash_is_right_padded_to_64() {
        let h = bridge_in_agreement_hash(5);
        assert_eq!(h.len(), 64);
        assert!(h.starts_with("bridge-in:nonce:5:"));
        assert!(h.ends_with('0'));
    }

    #[test]
    fn bridge_in_agreement_uri_url_encodes_recipient() {
        let uri = bridge_in_agreement_uri("0xabc", 7, "Alice::1220abcd");
        assert_eq!(uri, "ethereum:bridge-in:0xabc:nonce:7:recipient:Alice%3A%3A1220abcd");
    }

    #[test]
    fn yield_epoch_hash_has_padded_and_legacy_variants() {
        let (padded, legacy) = yield_epoch_agreement_hash("staking", 3);
        assert_eq!(padded.len(), 64);
        assert!(padded.starts_with(&legacy));
        assert_ne!(padded, legacy);
    }
}
