//! External collaborator boundaries (§1, §4.12, §9).
//!
//! Every "out of scope" collaborator named in §1 gets exactly one trait plus
//! one concrete, runnable implementation here. [`crate::signer::Signer`] and
//! [`crate::ledger_client::LedgerApi`] live in their own modules since they
//! are large enough to warrant it; the remaining, smaller collaborators
//! (secrets, metrics sink, DAML schema validation, the optional rebalance
//! keeper) are grouped in this one module rather than given each a full
//! top-level module, since none of them is large enough to warrant one.

#![allow(dead_code)]

use std::collections::HashMap;

use eyre::Result;
use serde_json::Value;

use crate::redact::Redacted;

/// `{ load(key) -> Option<Redacted<String>> }` (§1 "the secrets loader",
/// §2A: "file-plus-environment fallback, the same precedence `dotenvy` +
/// `std::env` already gives the reference operator's config layer").
pub trait SecretsLoader {
    fn load(&self, key: &str) -> Option<Redacted<String>>;
}

pub struct EnvFileSecretsLoader {
    overrides: HashMap<String, String>,
}

impl EnvFileSecretsLoader {
    pub fn new() -> Self {
        Self {
            overrides: HashMap::new(),
        }
    }

    /// Used by tests / callers that load a secrets file explicitly rather
    /// than relying on `dotenvy`'s process-wide side effect.
    pub fn with_overrides(overrides: HashMap<String, String>) -> Self {
        Self { overrides }
    }
}

impl Default for EnvFileSecretsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretsLoader for EnvFileSecretsLoader {
    fn load(&self, key: &str) -> Option<Redacted<String>> {
        if let Some(v) = self.overrides.get(key) {
            return Some(Redacted(v.clone()));
        }
        std::env::var(key).ok().map(Redacted)
    }
}

/// Small trait so direction handlers depend on a narrow sink rather than the
/// global `prometheus` registry directly, keeping them unit-testable without
/// a live registry (§4.12).
pub trait MetricsSink {
    fn record_outcome(&self, direction: &str, outcome: &str);
    fn record_rate_limit_denied(&self, window: &str);
    fn record_pause_triggered(&self);
    fn record_validation_failure(&self, direction: &str, reason: &str);
    fn record_cursor_advance(&self, direction: &str, block: u64);
}

/// The real sink, delegating to the `prometheus` registry in [`crate::metrics`].
pub struct PrometheusMetricsSink;

impl MetricsSink for PrometheusMetricsSink {
    fn record_outcome(&self, direction: &str, outcome: &str) {
        crate::metrics::record_direction_outcome(direction, outcome);
    }

    fn record_rate_limit_denied(&self, window: &str) {
        crate::metrics::record_rate_limit_denied(window);
    }

    fn record_pause_triggered(&self) {
        crate::metrics::record_pause_triggered();
    }

    fn record_validation_failure(&self, direction: &str, reason: &str) {
        crate::metrics::record_validation_failure(direction, reason);
    }

    fn record_cursor_advance(&self, direction: &str, block: u64) {
        crate::metrics::record_cursor_advance(direction, block);
    }
}

/// `{ validate_payload(template_id, payload) -> Result<()> }` (§1 "the
/// Ledger-contract DAML-level schema validator"). The actual DAML schema is
/// an external, versioned artifact this relay does not own, so the concrete
/// implementation is a permissive pass-through (§4.12).
pub trait DamlSchemaValidator {
    fn validate_payload(&self, template_id: &str, payload: &Value) -> Result<()>;
}

pub struct PassthroughSchemaValidator;

impl DamlSchemaValidator for PassthroughSchemaValidator {
    fn validate_payload(&self, _template_id: &str, _payload: &Value) -> Result<()> {
        Ok(())
    }
}

/// `{ maybe_rebalance(vault) }` (§1 "an optional auxiliary 'strategy
/// rebalance keeper' (LTV drift monitoring)"). Optional and auxiliary per
/// the spec, so the concrete implementation is a no-op gated by config
/// (§4.12).
pub trait StrategyRebalanceKeeper {
    fn maybe_rebalance(&self, vault: &str) -> Result<()>;
}

pub struct NoopRebalanceKeeper {
    pub enabled: bool,
}

impl StrategyRebalanceKeeper for NoopRebalanceKeeper {
    fn maybe_rebalance(&self, vault: &str) -> Result<()> {
        if self.enabled {
            tracing::debug!(vault, "strategy rebalance keeper invoked (no-op)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_loader_prefers_overrides_over_env() {
        let mut overrides = HashMap::new();
        overrides.insert("FOO".to_string(), "bar".to_string());
        let loader = EnvFileSecretsLoader::with_overrides(overrides);
        assert_eq!(loader.load("FOO").unwrap().0, "bar");
    }

    #[test]
    fn passthrough_validator_accepts_anything() {
        let validator = PassthroughSchemaValidator;
        assert!(validator.validate_payload("AnyTemplate", &serde_json::json!({"x": 1})).is_ok());
    }

    #[test]
    fn disabled_rebalance_keeper_is_still_ok() {
        let keeper = NoopRebalanceKeeper { enabled: false };
        assert!(keeper.maybe_rebalance("vault-1").is_ok());
    }
}
