use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::jsonrpc::{to_quantity, JsonRpcClient};
use super::{SignedTransaction, UnsignedTransaction};
use crate::error::ExecutionError;

/// Opaque signing capability for one account.
///
/// SECURITY: implementations must never log or persist key material.
/// The executor drops the signer as soon as the execution call returns.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Account this signer signs for
    fn address(&self) -> &str;

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<SignedTransaction, ExecutionError>;
}

/// Source of per-owner signers
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn signer_for(&self, owner_address: &str) -> Result<Box<dyn TransactionSigner>, ExecutionError>;
}

/// Key source backed by a node or remote signer that holds owner keys
/// and exposes `eth_signTransaction`.
pub struct NodeKeySource {
    rpc_url: String,
    request_timeout: Duration,
}

impl NodeKeySource {
    pub fn new(rpc_url: &str, request_timeout: Duration) -> Self {
        Self {
            rpc_url: rpc_url.to_string(),
            request_timeout,
        }
    }
}

#[async_trait]
impl KeySource for NodeKeySource {
    async fn signer_for(&self, owner_address: &str) -> Result<Box<dyn TransactionSigner>, ExecutionError> {
        let rpc = JsonRpcClient::new(&self.rpc_url, self.request_timeout);

        let accounts: Vec<String> = rpc.call("eth_accounts", json!([])).await?;
        if !accounts.iter().any(|a| a.eq_ignore_ascii_case(owner_address)) {
            return Err(ExecutionError::Signing(format!(
                "no signing key available for {}",
                owner_address
            )));
        }

        Ok(Box::new(NodeSigner {
            address: owner_address.to_string(),
            rpc,
        }))
    }
}

struct NodeSigner {
    address: String,
    rpc: JsonRpcClient,
}

#[async_trait]
impl TransactionSigner for NodeSigner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<SignedTransaction, ExecutionError> {
        let request = json!({
            "from": self.address,
            "to": tx.call.to,
            "value": to_quantity(tx.call.value),
            "data": format!("0x{}", hex::encode(&tx.call.data)),
            "gas": to_quantity(u128::from(tx.gas_limit)),
            "maxFeePerGas": to_quantity(tx.max_fee_per_gas),
            "maxPriorityFeePerGas": to_quantity(tx.max_priority_fee_per_gas),
            "nonce": to_quantity(u128::from(tx.nonce)),
            "chainId": to_quantity(u128::from(tx.chain_id)),
            "type": "0x2",
        });

        let result: Value = self
            .rpc
            .call("eth_signTransaction", json!([request]))
            .await
            .map_err(|e| ExecutionError::Signing(e.to_string()))?;

        // geth returns { raw, tx }, other nodes return the raw hex directly
        let raw_hex = match &result {
            Value::String(raw) => raw.as_str(),
            Value::Object(obj) => obj.get("raw").and_then(Value::as_str).unwrap_or_default(),
            _ => "",
        };

        let raw = hex::decode(raw_hex.trim_start_matches("0x"))
            .ok()
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| ExecutionError::Signing("node returned no signed transaction".to_string()))?;

        Ok(SignedTransaction { raw })
    }
}
