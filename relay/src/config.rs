//! Relay configuration, loaded from the environment (with optional `.env`
//! fallback) per the option table in §6.
//!
//! Env-var parsing, then a single `validate()` pass that turns malformed
//! input into a startup-fatal error, generalized from a Postgres/EVM/Terra
//! option set to the Ledger/Chain option set this relay actually needs.

#![allow(dead_code)]

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;

use crate::redact::Redacted;

/// Deployment environment. Gates TLS enforcement and the raw-key signer
/// (§6: "KMS required in production, raw key rejected unless dev/test";
/// "TLS enforced in production").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    fn from_env() -> Self {
        match env::var("NODE_ENV").unwrap_or_default().to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "test" => Environment::Test,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Top-level relay configuration.
#[derive(Clone)]
pub struct Config {
    pub environment: Environment,
    pub chain: ChainConfig,
    pub ledger: LedgerConfig,
    pub signer: SignerConfig,
    pub routing: RoutingConfig,
    pub scheduling: SchedulingConfig,
    pub rate_limits: RateLimitConfig,
    pub pause_guardian: PauseGuardianConfig,
    pub redemption: RedemptionConfig,
    pub behavior: BehaviorConfig,
    pub state_file: String,
    pub observability: ObservabilityConfig,
    /// Duplicated TTL constant shared with the Ledger-side attestation
    /// aggregator; a mismatch produces systematically rejected attestations
    /// (§9 Open Questions). Exposed as config rather than hardcoded so an
    /// operator can keep both sides of the bridge in lockstep.
    pub attestation_timestamp_offset_secs: i64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("environment", &self.environment)
            .field("chain", &self.chain)
            .field("ledger", &self.ledger)
            .field("signer", &self.signer)
            .field("routing", &self.routing)
            .field("scheduling", &self.scheduling)
            .field("rate_limits", &self.rate_limits)
            .field("pause_guardian", &self.pause_guardian)
            .field("redemption", &self.redemption)
            .field("behavior", &self.behavior)
            .field("state_file", &self.state_file)
            .field("observability", &self.observability)
            .field(
                "attestation_timestamp_offset_secs",
                &self.attestation_timestamp_offset_secs,
            )
            .finish()
    }
}

/// Chain (EVM) endpoint and contract addresses.
#[derive(Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub rpc_fallback_urls: Vec<String>,
    pub chain_id: u64,
    pub bridge_address: String,
    pub treasury_address: String,
    pub meta_vault3_address: Option<String>,
    pub musd_token_address: String,
    pub yield_distributor_address: String,
    pub eth_pool_yield_distributor_address: String,
    pub rpc_timeout_secs: u64,
}

impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("rpc_url", &crate::redact::scrub_line(&self.rpc_url))
            .field(
                "rpc_fallback_urls",
                &self
                    .rpc_fallback_urls
                    .iter()
                    .map(|u| crate::redact::scrub_line(u))
                    .collect::<Vec<_>>(),
            )
            .field("chain_id", &self.chain_id)
            .field("bridge_address", &self.bridge_address)
            .field("treasury_address", &self.treasury_address)
            .field("meta_vault3_address", &self.meta_vault3_address)
            .field("musd_token_address", &self.musd_token_address)
            .field("yield_distributor_address", &self.yield_distributor_address)
            .field(
                "eth_pool_yield_distributor_address",
                &self.eth_pool_yield_distributor_address,
            )
            .field("rpc_timeout_secs", &self.rpc_timeout_secs)
            .finish()
    }
}

impl ChainConfig {
    /// Primary followed by fallbacks, for the failover rotation in §4.8.
    pub fn all_rpc_urls(&self) -> Vec<String> {
        let mut urls = vec![self.rpc_url.clone()];
        urls.extend(self.rpc_fallback_urls.iter().cloned());
        urls
    }
}

/// Ledger (Canton) endpoint and operator identity.
#[derive(Clone)]
pub struct LedgerConfig {
    pub host: String,
    pub port: u16,
    pub token: Redacted<String>,
    pub operator_party: String,
    pub timeout_secs: u64,
    /// CIP-56 transfer-factory package id, when the interface is vetted on
    /// this participant (§4.2 step 4 preferred path).
    pub cip56_package_id: Option<String>,
    /// Added to the actor set on `ReceiveYield`/`ETHPool_ReceiveYield` when
    /// the distributor service requires multi-party authorization (§4.5 step 3).
    pub governance_party: Option<String>,
}

impl fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token", &"<redacted>")
            .field("operator_party", &self.operator_party)
            .field("timeout_secs", &self.timeout_secs)
            .field("cip56_package_id", &self.cip56_package_id)
            .field("governance_party", &self.governance_party)
            .finish()
    }
}

impl LedgerConfig {
    pub fn base_url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Signer source selection (§4.12, §9 two-variant capability).
#[derive(Clone)]
pub struct SignerConfig {
    pub kms_key_id: Option<String>,
    pub private_key: Option<Redacted<String>>,
}

impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerConfig")
            .field("kms_key_id", &self.kms_key_id)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Recipient routing maps.
#[derive(Debug, Clone, Default)]
pub struct RoutingConfig {
    /// validator-party -> Chain address, size-capped at 10 KiB raw JSON (§6).
    pub validator_addresses: HashMap<String, String>,
    /// Ledger party alias -> canonical party id.
    pub recipient_party_aliases: HashMap<String, String>,
    /// Ledger party (redemption `user`) -> Chain recipient address.
    pub redemption_eth_recipients: HashMap<String, String>,
}

/// Scheduling, reorg-safety, and bounded replay window (§6).
#[derive(Debug, Clone)]
pub struct SchedulingConfig {
    pub poll_interval_ms: u64,
    pub confirmations: u64,
    pub lookback_blocks: u64,
}

/// Token-bucket caps (§4.9).
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_tx_per_block: u32,
    pub max_tx_per_minute: u32,
    pub max_tx_per_hour: u32,
}

/// Pause-guardian thresholds (§4.10).
#[derive(Debug, Clone)]
pub struct PauseGuardianConfig {
    pub max_cap_change_pct: u32,
    pub max_consecutive_reverts: u32,
}

/// Redemption settlement caps and role auto-grant (§4.3).
#[derive(Debug, Clone)]
pub struct RedemptionConfig {
    /// `MAX_REDEMPTION_ETH_PAYOUT_MUSD`, interpreted as an 18-decimal amount.
    pub max_payout_wei: u128,
}

/// Behavioral knobs, default off in production, on in dev (§6).
#[derive(Debug, Clone)]
pub struct BehaviorConfig {
    pub auto_grant_bridge_role_for_redemptions: bool,
    pub auto_accept_musd_transfer_proposals: bool,
}

/// Logging/metrics ambient configuration (§2A, §6 additional options).
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    pub metrics_bind_addr: SocketAddr,
    pub health_bearer_token: Option<Redacted<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

fn default_poll_interval_ms() -> u64 {
    12_000
}
fn default_confirmations() -> u64 {
    12
}
fn default_lookback_blocks() -> u64 {
    10_000
}
fn default_rate_limit_block() -> u32 {
    1
}
fn default_rate_limit_minute() -> u32 {
    10
}
fn default_rate_limit_hour() -> u32 {
    60
}
fn default_pause_cap_change_pct() -> u32 {
    20
}
fn default_pause_max_reverts() -> u32 {
    5
}
fn default_rpc_timeout_secs() -> u64 {
    30
}
fn default_attestation_ttl_offset() -> i64 {
    3600
}

impl Config {
    /// Load configuration, trying `.env` first then falling back to the
    /// ambient environment.
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let environment = Environment::from_env();

        let rpc_raw = require_env("RPC_URL")?;
        let rpc_urls = crate::rpc_fallback::parse_rpc_urls(&rpc_raw);
        if rpc_urls.is_empty() {
            return Err(eyre!("RPC_URL cannot be empty"));
        }

        let chain = ChainConfig {
            rpc_url: rpc_urls[0].clone(),
            rpc_fallback_urls: rpc_urls[1..].to_vec(),
            chain_id: require_env("CHAIN_ID")?
                .parse()
                .wrap_err("CHAIN_ID must be a valid u64")?,
            bridge_address: require_env("BRIDGE")?,
            treasury_address: require_env("TREASURY")?,
            meta_vault3_address: env::var("META_VAULT3").ok(),
            musd_token_address: require_env("MUSD_TOKEN")?,
            yield_distributor_address: require_env("YIELD_DISTRIBUTOR")?,
            eth_pool_yield_distributor_address: require_env("ETH_POOL_YIELD_DISTRIBUTOR")?,
            rpc_timeout_secs: env::var("RPC_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_rpc_timeout_secs),
        };

        let ledger = LedgerConfig {
            host: require_env("CANTON_HOST")?,
            port: require_env("CANTON_PORT")?
                .parse()
                .wrap_err("CANTON_PORT must be a valid port number")?,
            token: Redacted(require_env("CANTON_TOKEN")?),
            operator_party: require_env("CANTON_PARTY")?,
            timeout_secs: 30,
            cip56_package_id: env::var("CIP56_PACKAGE_ID").ok(),
            governance_party: env::var("GOVERNANCE_PARTY").ok(),
        };

        let signer = SignerConfig {
            kms_key_id: env::var("KMS_KEY_ID").ok(),
            private_key: env::var("PRIVATE_KEY").ok().map(Redacted),
        };

        let routing = RoutingConfig {
            validator_addresses: parse_capped_json_map("VALIDATOR_ADDRESSES")?,
            recipient_party_aliases: parse_capped_json_map("RECIPIENT_PARTY_ALIASES")?,
            redemption_eth_recipients: parse_capped_json_map("REDEMPTION_ETH_RECIPIENTS")?,
        };

        let scheduling = SchedulingConfig {
            poll_interval_ms: env::var("POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_poll_interval_ms),
            confirmations: env::var("CONFIRMATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_confirmations),
            lookback_blocks: env::var("LOOKBACK_BLOCKS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_lookback_blocks),
        };

        let rate_limits = RateLimitConfig {
            max_tx_per_block: env::var("RATE_LIMIT_TX_PER_BLOCK")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_rate_limit_block),
            max_tx_per_minute: env::var("RATE_LIMIT_TX_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_rate_limit_minute),
            max_tx_per_hour: env::var("RATE_LIMIT_TX_PER_HOUR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_rate_limit_hour),
        };

        let pause_guardian = PauseGuardianConfig {
            max_cap_change_pct: env::var("PAUSE_CAP_CHANGE_PCT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_pause_cap_change_pct),
            max_consecutive_reverts: env::var("PAUSE_MAX_REVERTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_pause_max_reverts),
        };

        let redemption = RedemptionConfig {
            max_payout_wei: env::var("MAX_REDEMPTION_ETH_PAYOUT_MUSD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(u128::MAX),
        };

        let dev_default = !environment.is_production();
        let behavior = BehaviorConfig {
            auto_grant_bridge_role_for_redemptions: env::var(
                "AUTO_GRANT_BRIDGE_ROLE_FOR_REDEMPTIONS",
            )
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(dev_default),
            auto_accept_musd_transfer_proposals: env::var("AUTO_ACCEPT_MUSD_TRANSFER_PROPOSALS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(dev_default),
        };

        let state_file = env::var("STATE_FILE").unwrap_or_else(|_| "relay-state.json".to_string());

        let observability = ObservabilityConfig {
            log_format: match env::var("LOG_FORMAT").ok().as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            metrics_bind_addr: env::var("METRICS_BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 9090))),
            health_bearer_token: env::var("HEALTH_BEARER_TOKEN").ok().map(Redacted),
        };

        let config = Config {
            environment,
            chain,
            ledger,
            signer,
            routing,
            scheduling,
            rate_limits,
            pause_guardian,
            redemption,
            behavior,
            state_file,
            observability,
            attestation_timestamp_offset_secs: env::var("ATTESTATION_TIMESTAMP_OFFSET_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_attestation_ttl_offset),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.chain.rpc_url.is_empty() {
            return Err(eyre!("RPC_URL cannot be empty"));
        }
        if self.environment.is_production() && self.chain.rpc_url.starts_with("http://") {
            return Err(eyre!("RPC_URL must use TLS (https://) in production"));
        }
        for url in self.chain.all_rpc_urls() {
            if self.environment.is_production() && url.starts_with("http://") {
                return Err(eyre!("RPC fallback URLs must use TLS in production: {}", url));
            }
        }

        if !self.chain.bridge_address.starts_with("0x") || self.chain.bridge_address.len() != 42 {
            return Err(eyre!("BRIDGE must be a valid hex address (42 chars with 0x prefix)"));
        }
        if !self.chain.treasury_address.starts_with("0x") || self.chain.treasury_address.len() != 42 {
            return Err(eyre!("TREASURY must be a valid hex address"));
        }
        if !self.chain.musd_token_address.starts_with("0x") || self.chain.musd_token_address.len() != 42
        {
            return Err(eyre!("MUSD_TOKEN must be a valid hex address"));
        }

        if self.environment.is_production() {
            if self.signer.kms_key_id.is_none() {
                return Err(eyre!("KMS_KEY_ID is required in production (raw PRIVATE_KEY is rejected)"));
            }
            if !self.ledger.host.starts_with("https://") && self.ledger.host != "localhost" {
                return Err(eyre!("CANTON_HOST must use TLS in production"));
            }
        } else if self.signer.kms_key_id.is_none() && self.signer.private_key.is_none() {
            return Err(eyre!("one of KMS_KEY_ID or PRIVATE_KEY is required"));
        }

        if env::var("NODE_TLS_REJECT_UNAUTHORIZED").as_deref() == Ok("0") {
            return Err(eyre!(
                "NODE_TLS_REJECT_UNAUTHORIZED=0 detected; refusing to start with TLS verification disabled"
            ));
        }

        if self.rate_limits.max_tx_per_block == 0 {
            return Err(eyre!("RATE_LIMIT_TX_PER_BLOCK must be at least 1"));
        }

        if self.attestation_timestamp_offset_secs <= 0 {
            return Err(eyre!("ATTESTATION_TIMESTAMP_OFFSET_SECS must be positive"));
        }

        Ok(())
    }
}

fn require_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| eyre!("{key} environment variable is required"))
}

/// Parse a JSON object map from an env var, capped at 10 KiB raw (§6:
/// "size-capped at 10 KiB" for `VALIDATOR_ADDRESSES`; applied uniformly to
/// the other routing maps since they share the same attack surface: an
/// operator-controlled env var that is deserialized into a map).
fn parse_capped_json_map(key: &str) -> Result<HashMap<String, String>> {
    match env::var(key) {
        Ok(raw) => {
            if raw.len() > 10 * 1024 {
                return Err(eyre!("{key} exceeds the 10 KiB size cap"));
            }
            serde_json::from_str(&raw).wrap_err_with(|| format!("{key} must be a JSON object of string -> string"))
        }
        Err(_) => Ok(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_env() {
        for key in [
            "NODE_ENV", "RPC_URL", "CHAIN_ID", "BRIDGE", "TREASURY", "MUSD_TOKEN",
            "YIELD_DISTRIBUTOR", "ETH_POOL_YIELD_DISTRIBUTOR", "CANTON_HOST", "CANTON_PORT",
            "CANTON_TOKEN", "CANTON_PARTY", "KMS_KEY_ID", "PRIVATE_KEY", "VALIDATOR_ADDRESSES",
            "NODE_TLS_REJECT_UNAUTHORIZED", "RATE_LIMIT_TX_PER_BLOCK",
            "ATTESTATION_TIMESTAMP_OFFSET_SECS",
        ] {
            env::remove_var(key);
        }
    }

    fn set_minimal_dev_env() {
        clear_env();
        env::set_var("RPC_URL", "http://localhost:8545");
        env::set_var("CHAIN_ID", "1");
        env::set_var("BRIDGE", "0x0000000000000000000000000000000000000001");
        env::set_var("TREASURY", "0x0000000000000000000000000000000000000002");
        env::set_var("MUSD_TOKEN", "0x0000000000000000000000000000000000000003");
        env::set_var("YIELD_DISTRIBUTOR", "0x0000000000000000000000000000000000000004");
        env::set_var(
            "ETH_POOL_YIELD_DISTRIBUTOR",
            "0x0000000000000000000000000000000000000005",
        );
        env::set_var("CANTON_HOST", "localhost");
        env::set_var("CANTON_PORT", "7575");
        env::set_var("CANTON_TOKEN", "dev-token");
        env::set_var("CANTON_PARTY", "operator::1220abcd");
        env::set_var("PRIVATE_KEY", "0xabc");
    }

    #[test]
    #[ignore = "mutates process env; run with --test-threads=1"]
    fn loads_minimal_dev_config() {
        set_minimal_dev_env();
        let config = Config::load_from_env().unwrap();
        assert_eq!(config.chain.chain_id, 1);
        assert!(!config.environment.is_production());
        clear_env();
    }

    #[test]
    #[ignore = "mutates process env; run with --test-threads=1"]
    fn production_rejects_raw_private_key_without_kms() {
        set_minimal_dev_env();
        env::set_var("NODE_ENV", "production");
        env::set_var("CANTON_HOST", "https://canton.example.com");
        env::set_var("RPC_URL", "https://mainnet.example.com");
        let err = Config::load_from_env().unwrap_err();
        assert!(err.to_string().contains("KMS_KEY_ID"));
        clear_env();
    }

    #[test]
    #[ignore = "mutates process env; run with --test-threads=1"]
    fn production_rejects_plain_http_rpc() {
        set_minimal_dev_env();
        env::set_var("NODE_ENV", "production");
        env::set_var("KMS_KEY_ID", "arn:aws:kms:key/abc");
        env::set_var("CANTON_HOST", "https://canton.example.com");
        let err = Config::load_from_env().unwrap_err();
        assert!(err.to_string().contains("TLS"));
        clear_env();
    }

    #[test]
    fn validator_addresses_map_rejects_oversize_payload() {
        clear_env();
        let huge = format!("{{\"a\":\"{}\"}}", "0".repeat(11 * 1024));
        env::set_var("VALIDATOR_ADDRESSES", huge);
        let err = parse_capped_json_map("VALIDATOR_ADDRESSES").unwrap_err();
        assert!(err.to_string().contains("10 KiB"));
        env::remove_var("VALIDATOR_ADDRESSES");
    }
}
