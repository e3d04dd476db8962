//! Pluggable facilitator interface: the external service that verifies and
//! settles micropayments on-chain. Tests substitute in-process fakes.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Payment requirements object returned with every 402 challenge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: String,
    pub pay_to: String,
    pub resource: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub is_valid: bool,
    #[serde(default)]
    pub invalid_reason: Option<String>,
    #[serde(default)]
    pub payer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleOutcome {
    pub success: bool,
    #[serde(default)]
    pub error_reason: Option<String>,
    /// On-chain transaction hash.
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub receipt_id: Option<String>,
}

#[async_trait]
pub trait Facilitator: Send + Sync {
    async fn verify(
        &self,
        payload: &Value,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyOutcome>;

    async fn settle(
        &self,
        payload: &Value,
        requirements: &PaymentRequirements,
    ) -> Result<SettleOutcome>;
}

/// HTTP facilitator speaking the x402 `/verify` + `/settle` convention.
pub struct HttpFacilitator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFacilitator {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Startup reachability probe.
    pub async fn probe(&self) -> bool {
        let url = format!("{}/supported", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => {
                info!("facilitator reachable at {} ({})", self.base_url, response.status());
                true
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Facilitator for HttpFacilitator {
    async fn verify(
        &self,
        payload: &Value,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyOutcome> {
        let response = self
            .client
            .post(format!("{}/verify", self.base_url))
            .json(&serde_json::json!({
                "paymentPayload": payload,
                "paymentRequirements": requirements,
            }))
            .send()
            .await
            .map_err(|e| anyhow!("facilitator verify call failed: {}", e))?;
        response
            .json::<VerifyOutcome>()
            .await
            .map_err(|e| anyhow!("facilitator verify response unparsable: {}", e))
    }

    async fn settle(
        &self,
        payload: &Value,
        requirements: &PaymentRequirements,
    ) -> Result<SettleOutcome> {
        let response = self
            .client
            .post(format!("{}/settle", self.base_url))
            .json(&serde_json::json!({
                "paymentPayload": payload,
                "paymentRequirements": requirements,
            }))
            .send()
            .await
            .map_err(|e| anyhow!("facilitator settle call failed: {}", e))?;
        response
            .json::<SettleOutcome>()
            .await
            .map_err(|e| anyhow!("facilitator settle response unparsable: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirements_serialize_camel_case() {
        let requirements = PaymentRequirements {
            scheme: "exact".to_string(),
            network: "base-sepolia".to_string(),
            max_amount_required: "0.01".to_string(),
            pay_to: "0x9431cf5da0ce60664661341db650763b08286b18".to_string(),
            resource: "/api/premium".to_string(),
            description: "premium call".to_string(),
        };
        let value = serde_json::to_value(&requirements).unwrap();
        assert_eq!(value["maxAmountRequired"], "0.01");
        assert_eq!(value["payTo"], "0x9431cf5da0ce60664661341db650763b08286b18");
        assert_eq!(value["resource"], "/api/premium");
    }

    #[test]
    fn outcomes_tolerate_missing_optionals() {
        let verify: VerifyOutcome = serde_json::from_str(r#"{"isValid":true}"#).unwrap();
        assert!(verify.is_valid);
        assert!(verify.payer.is_none());

        let settle: SettleOutcome =
            serde_json::from_str(r#"{"success":true,"transaction":"0xabc"}"#).unwrap();
        assert!(settle.success);
        assert_eq!(settle.transaction.as_deref(), Some("0xabc"));
    }
}
