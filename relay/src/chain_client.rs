//! Chain RPC provider construction and failover rotation (§4.8).
//!
//! URL parsing + alloy provider construction, generalized from "one
//! provider per configured chain" to "one ordered failover list for the
//! single Chain this relay talks to."

use std::sync::atomic::{AtomicUsize, Ordering};

use alloy::network::EthereumWallet;
use alloy::providers::fillers::{FillProvider, JoinFill, WalletFiller};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy::transports::http::{Client as HttpClient, Http};
use eyre::{eyre, Result, WrapErr};

use crate::config::ChainConfig;
use crate::signer::Signer;

/// Every direction handler submits through this same wallet-attached
/// provider type (§4.1 step 13, §4.12) — there is no read-only variant,
/// since staticCall simulation and submission share one provider.
pub type EvmProvider =
    FillProvider<JoinFill<Identity, WalletFiller<EthereumWallet>>, RootProvider<Http<HttpClient>>>;

/// Ordered `[primaryRpc, fallback1…N]` list with the rotation rule from §4.8:
/// "If 3 consecutive cycles see ≥3 directions failing simultaneously, rotate
/// to the next provider modulo `N+1`, rebuild the signer against it, and
/// reset the failure counter."
pub struct RpcFailover {
    urls: Vec<String>,
    active_index: AtomicUsize,
    consecutive_bad_cycles: AtomicUsize,
}

impl RpcFailover {
    pub fn new(chain: &ChainConfig) -> Result<Self> {
        let urls = chain.all_rpc_urls();
        if urls.is_empty() {
            return Err(eyre!("at least one RPC URL is required"));
        }
        Ok(Self {
            urls,
            active_index: AtomicUsize::new(0),
            consecutive_bad_cycles: AtomicUsize::new(0),
        })
    }

    pub fn active_url(&self) -> String {
        let idx = self.active_index.load(Ordering::SeqCst);
        self.urls[idx % self.urls.len()].clone()
    }

    /// Build a provider with a wallet attached, for submitting transactions.
    pub fn active_provider_with_wallet(&self, signer: &Signer) -> Result<EvmProvider> {
        let Signer::RawKey(local_signer) = signer else {
            return Err(eyre!(
                "KMS-backed signing requires a wallet-aware provider wired by the operator (§4.12)"
            ));
        };
        let wallet = EthereumWallet::from(local_signer.clone());
        let url = self.active_url();
        let parsed = url
            .parse()
            .wrap_err_with(|| format!("invalid RPC URL: {}", crate::redact::scrub_line(&url)))?;
        Ok(ProviderBuilder::new().wallet(wallet).on_http(parsed))
    }

    /// Record whether this cycle saw 3 or more directions fail (§4.8, §5).
    /// Returns `true` if a rotation was performed.
    pub fn record_cycle(&self, directions_failed: usize) -> bool {
        if directions_failed >= 3 {
            let bad = self.consecutive_bad_cycles.fetch_add(1, Ordering::SeqCst) + 1;
            if bad >= 3 {
                let idx = self.active_index.fetch_add(1, Ordering::SeqCst);
                self.consecutive_bad_cycles.store(0, Ordering::SeqCst);
                tracing::warn!(
                    new_url = %crate::redact::scrub_line(&self.urls[(idx + 1) % self.urls.len()]),
                    "rotating to next RPC provider after 3 consecutive bad cycles"
                );
                return true;
            }
        } else {
            self.consecutive_bad_cycles.store(0, Ordering::SeqCst);
        }
        false
    }
}

/// Fetch the current block number through the active provider.
pub async fn current_block_number(provider: &EvmProvider) -> Result<u64> {
    provider
        .get_block_number()
        .await
        .wrap_err("failed to fetch current block number")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_config(urls: Vec<&str>) -> ChainConfig {
        ChainConfig {
            rpc_url: urls[0].to_string(),
            rpc_fallback_urls: urls[1..].iter().map(|s| s.to_string()).collect(),
            chain_id: 1,
            bridge_address: "0x0000000000000000000000000000000000000001".into(),
            treasury_address: "0x0000000000000000000000000000000000000002".into(),
            meta_vault3_address: None,
            musd_token_address: "0x0000000000000000000000000000000000000003".into(),
            yield_distributor_address: "0x0000000000000000000000000000000000000004".into(),
            eth_pool_yield_distributor_address: "0x0000000000000000000000000000000000000005".into(),
            rpc_timeout_secs: 30,
        }
    }

    #[test]
    fn does_not_rotate_before_three_bad_cycles() {
        let failover = RpcFailover::new(&chain_config(vec!["http://a", "http://b"])).unwrap();
        assert!(!failover.record_cycle(3));
        assert!(!failover.record_cycle(3));
        assert_eq!(failover.active_url(), "http://a");
    }

    #[test]
    fn rotates_after_three_consecutive_bad_cycles() {
        let failover = RpcFailover::new(&chain_config(vec!["http://a", "http://b"])).unwrap();
        failover.record_cycle(3);
        failover.record_cycle(3);
        assert!(failover.record_cycle(3));
        assert_eq!(failover.active_url(), "http://b");
    }

    #[test]
    fn a_good_cycle_resets_the_bad_streak() {
        let failover = RpcFailover::new(&chain_config(vec!["http://a", "http://b"])).unwrap();
        failover.record_cycle(3);
        failover.record_cycle(1);
        assert!(!failover.record_cycle(3));
        assert_eq!(failover.active_url(), "http://a");
    }

    #[test]
    fn rotation_wraps_modulo_list_length() {
        let failover = RpcFailover::new(&chain_config(vec!["http://a", "http://b"])).unwrap();
        for _ in 0..3 {
            failover.record_cycle(3);
        }
        assert_eq!(failover.active_url(), "http://b");
        for _ in 0..3 {
            failover.record_cycle(3);
        }
        assert_eq!(failover.active_url(), "http://a");
    }
}
