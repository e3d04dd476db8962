//! On-chain reputation oracle: `(count, score)` per agent id, read with a
//! plain `eth_call` and cached briefly in-process.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

/// First four bytes of keccak("getReputation(uint256)").
const GET_REPUTATION_SELECTOR: &str = "0x90f04028";

#[async_trait]
pub trait ReputationOracle: Send + Sync {
    /// `(interaction_count, score)` for an agent id.
    async fn reputation(&self, agent_id: &str) -> Result<(u64, u64)>;
}

pub struct EvmReputationOracle {
    client: reqwest::Client,
    rpc_url: String,
    contract: String,
}

impl EvmReputationOracle {
    pub fn new(client: reqwest::Client, rpc_url: impl Into<String>, contract: impl Into<String>) -> Self {
        Self {
            client,
            rpc_url: rpc_url.into(),
            contract: contract.into(),
        }
    }

    fn calldata(agent_id: &str) -> Result<String> {
        let id: u128 = agent_id
            .trim()
            .parse()
            .map_err(|_| anyhow!("agent id must be a decimal integer"))?;
        Ok(format!("{}{:064x}", GET_REPUTATION_SELECTOR, id))
    }
}

#[async_trait]
impl ReputationOracle for EvmReputationOracle {
    async fn reputation(&self, agent_id: &str) -> Result<(u64, u64)> {
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "method": "eth_call",
                "params": [{
                    "to": self.contract,
                    "data": Self::calldata(agent_id)?,
                }, "latest"],
                "id": 1
            }))
            .send()
            .await
            .map_err(|e| anyhow!("reputation RPC call failed: {}", e))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| anyhow!("reputation RPC response unparsable: {}", e))?;
        let result = body
            .get("result")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("reputation RPC returned no result"))?;

        decode_two_words(result)
    }
}

/// Decode `(uint256, uint256)` return data into `(count, score)`.
fn decode_two_words(result: &str) -> Result<(u64, u64)> {
    let raw = result.strip_prefix("0x").unwrap_or(result);
    if raw.len() < 128 {
        bail!("reputation call returned {} hex chars, need 128", raw.len());
    }
    let count = u64::from_str_radix(&raw[48..64], 16)
        .map_err(|e| anyhow!("count word unparsable: {}", e))?;
    let score = u64::from_str_radix(&raw[112..128], 16)
        .map_err(|e| anyhow!("score word unparsable: {}", e))?;
    Ok((count, score))
}
