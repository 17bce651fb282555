//! Ledger HTTP JSON API client (§1 "the Ledger HTTP JSON API client", §6).
//!
//! A REST client wrapping `reqwest` with a narrow set of free functions per
//! endpoint, covering the four Ledger JSON API paths enumerated in §6 plus
//! the active-contracts-then-updates fallback §6 requires.

use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LedgerConfig;

/// Ledger API responses modeled as explicit structs with unknown fields
/// ignored (§9 design note: "Dynamic maps and decoded JSON → tagged
/// variants").
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerEnd {
    pub offset: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActiveContract {
    pub contract_id: String,
    pub template_id: String,
    pub payload: Value,
    #[serde(default)]
    pub created_event_blob: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ActiveContractsResponse {
    contracts: Vec<ActiveContract>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerUpdate {
    pub offset: u64,
    pub created: Option<ActiveContract>,
    pub archived_contract_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UpdatesPage {
    updates: Vec<LedgerUpdate>,
    next_offset: Option<u64>,
}

/// Narrow collaborator boundary over the Ledger HTTP JSON API (§1, §4.12).
/// A relay that cannot talk to a real Ledger is not a relay; this trait
/// exists so a test double or a different Ledger gateway can stand in.
pub trait LedgerApi: Send + Sync {
    fn get_ledger_end(&self) -> impl std::future::Future<Output = Result<u64>> + Send;

    fn query_active(
        &self,
        template_id: &str,
        predicate: Value,
    ) -> impl std::future::Future<Output = Result<Vec<ActiveContract>>> + Send;

    fn create(
        &self,
        template_id: &str,
        payload: Value,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    fn exercise(
        &self,
        template_id: &str,
        contract_id: &str,
        choice: &str,
        args: Value,
        extra_actors: Vec<String>,
    ) -> impl std::future::Future<Output = Result<Value>> + Send;
}

/// The 200-item list cap the Ledger JSON API enforces on `active-contracts`
/// responses (§6, §8 boundary tests).
pub const ACTIVE_CONTRACTS_PAGE_CAP: usize = 200;

/// Bound on `/v2/updates` replay pages, to avoid an unbounded loop if the
/// Ledger never stops returning progress (§6: "advancing a begin-exclusive
/// offset until progress halts or a max-pages bound is reached").
pub const MAX_UPDATES_PAGES: usize = 500;

pub struct HttpLedgerApi {
    client: Client,
    base_url: String,
    token: String,
    operator_party: String,
}

impl HttpLedgerApi {
    pub fn new(config: &LedgerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .wrap_err("failed to build Ledger HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            token: config.token.0.clone(),
            operator_party: config.operator_party.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Replay `/v2/updates` from `begin_exclusive`, deduplicating
    /// created-then-archived contracts, until progress halts or
    /// [`MAX_UPDATES_PAGES`] is reached (§6, §8 round-trip law).
    async fn updates_fallback(&self, begin_exclusive: u64) -> Result<Vec<ActiveContract>> {
        let mut offset = begin_exclusive;
        let mut active: std::collections::HashMap<String, ActiveContract> = std::collections::HashMap::new();

        for _ in 0..MAX_UPDATES_PAGES {
            let resp: UpdatesPage = self
                .client
                .post(self.url("/v2/updates"))
                .bearer_auth(&self.token)
                .json(&serde_json::json!({ "beginExclusive": offset }))
                .send()
                .await
                .wrap_err("failed to call /v2/updates")?
                .error_for_status()
                .wrap_err("/v2/updates returned an error status")?
                .json()
                .await
                .wrap_err("failed to decode /v2/updates response")?;

            if resp.updates.is_empty() {
                break;
            }

            for update in &resp.updates {
                if let Some(contract) = &update.created {
                    active.insert(contract.contract_id.clone(), contract.clone());
                }
                if let Some(archived_id) = &update.archived_contract_id {
                    active.remove(archived_id);
                }
            }

            match resp.next_offset {
                Some(next) if next > offset => offset = next,
                _ => break,
            }
        }

        Ok(active.into_values().collect())
    }
}

impl LedgerApi for HttpLedgerApi {
    async fn get_ledger_end(&self) -> Result<u64> {
        let resp: LedgerEnd = self
            .client
            .get(self.url("/v2/state/ledger-end"))
            .bearer_auth(&self.token)
            .send()
            .await
            .wrap_err("failed to call /v2/state/ledger-end")?
            .error_for_status()
            .wrap_err("/v2/state/ledger-end returned an error status")?
            .json()
            .await
            .wrap_err("failed to decode /v2/state/ledger-end response")?;
        Ok(resp.offset)
    }

    async fn query_active(&self, template_id: &str, predicate: Value) -> Result<Vec<ActiveContract>> {
        let response = self
            .client
            .post(self.url("/v2/state/active-contracts"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "templateId": template_id,
                "filter": predicate,
            }))
            .send()
            .await
            .wrap_err("failed to call /v2/state/active-contracts")?;

        // HTTP 413: permanent, the caller should fall back (§6, §7 taxonomy).
        if response.status() == StatusCode::PAYLOAD_TOO_LARGE {
            let ledger_end = self.get_ledger_end().await?;
            return self.updates_fallback(0).await.map(|mut contracts| {
                contracts.retain(|c| c.template_id == template_id);
                let _ = ledger_end;
                contracts
            });
        }

        let body: ActiveContractsResponse = response
            .error_for_status()
            .wrap_err("/v2/state/active-contracts returned an error status")?
            .json()
            .await
            .wrap_err("failed to decode /v2/state/active-contracts response")?;

        // Exactly the 200-item cap: fall back to /v2/updates replay (§6, §8).
        if body.contracts.len() == ACTIVE_CONTRACTS_PAGE_CAP {
            tracing::warn!(
                template_id,
                "active-contracts returned exactly the page cap, falling back to /v2/updates replay"
            );
            let mut contracts = self.updates_fallback(0).await?;
            contracts.retain(|c| c.template_id == template_id);
            return Ok(contracts);
        }

        Ok(body.contracts)
    }

    async fn create(&self, template_id: &str, payload: Value) -> Result<String> {
        #[derive(Deserialize)]
        struct SubmitResponse {
            #[serde(default)]
            contract_id: Option<String>,
            #[serde(default)]
            error: Option<String>,
        }

        let resp: SubmitResponse = self
            .client
            .post(self.url("/v2/commands/submit-and-wait"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "commands": [{
                    "CreateCommand": {
                        "templateId": template_id,
                        "createArguments": payload,
                    }
                }],
                "actAs": [self.operator_party],
            }))
            .send()
            .await
            .wrap_err("failed to call /v2/commands/submit-and-wait (create)")?
            .error_for_status()
            .wrap_err("create command returned an error status")?
            .json()
            .await
            .wrap_err("failed to decode create command response")?;

        if let Some(err) = resp.error {
            return Err(eyre!("ledger create failed: {err}"));
        }
        resp.contract_id.ok_or_else(|| eyre!("ledger create response missing contractId"))
    }

    async fn exercise(
        &self,
        template_id: &str,
        contract_id: &str,
        choice: &str,
        args: Value,
        extra_actors: Vec<String>,
    ) -> Result<Value> {
        let mut act_as = vec![self.operator_party.clone()];
        act_as.extend(extra_actors);

        let resp: Value = self
            .client
            .post(self.url("/v2/commands/submit-and-wait"))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "commands": [{
                    "ExerciseCommand": {
                        "templateId": template_id,
                        "contractId": contract_id,
                        "choice": choice,
                        "choiceArgument": args,
                    }
                }],
                "actAs": act_as,
            }))
            .send()
            .await
            .wrap_err_with(|| format!("failed to exercise {choice} on {contract_id}"))?
            .error_for_status()
            .wrap_err_with(|| format!("{choice} on {contract_id} returned an error status"))?
            .json()
            .await
            .wrap_err("failed to decode exercise response")?;

        Ok(resp)
    }
}

#[derive(Debug, Serialize)]
pub struct ContractFilter<'a> {
    pub party: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_contracts_page_cap_is_two_hundred() {
        assert_eq!(ACTIVE_CONTRACTS_PAGE_CAP, 200);
    }
}
