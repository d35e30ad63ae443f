use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::*;
use crate::error::RpcError;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub request_timeout: Duration,
    /// How often a pending receipt is polled
    pub receipt_poll_interval: Duration,
    /// Priority fee used when the node does not expose `eth_maxPriorityFeePerGas`
    pub default_priority_fee_wei: u128,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            request_timeout: Duration::from_secs(15),
            receipt_poll_interval: Duration::from_secs(2),
            default_priority_fee_wei: 1_500_000_000, // 1.5 gwei
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Minimal Ethereum JSON-RPC 2.0 client
pub struct JsonRpcClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: &str, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| RpcError::InvalidResponse(format!("{} returned null", method)))
    }

    /// Like `call`, but a null result is `Ok(None)`
    pub async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!("→ {} (id {})", method, id);
        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(RpcError::Transport(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let payload: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| RpcError::InvalidResponse(format!("{}: {}", method, e)))?;

        if let Some(err) = payload.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }

        Ok(payload.result)
    }
}

/// Ledger RPC over Ethereum JSON-RPC
pub struct JsonRpcLedger {
    config: LedgerConfig,
    rpc: JsonRpcClient,
}

impl JsonRpcLedger {
    pub fn new(config: LedgerConfig) -> Self {
        let rpc = JsonRpcClient::new(&config.rpc_url, config.request_timeout);
        info!("Ledger RPC configured: {}", config.rpc_url);
        Self { config, rpc }
    }

    fn call_object(call: &TransferCall) -> Value {
        json!({
            "from": call.from,
            "to": call.to,
            "value": to_quantity(call.value),
            "data": format!("0x{}", hex::encode(&call.data)),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockHeader {
    base_fee_per_gas: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptBody {
    transaction_hash: String,
    block_number: String,
    gas_used: String,
    effective_gas_price: Option<String>,
    status: Option<String>,
}

impl TryFrom<ReceiptBody> for ChainReceipt {
    type Error = RpcError;

    fn try_from(body: ReceiptBody) -> Result<Self, Self::Error> {
        Ok(ChainReceipt {
            tx_hash: body.transaction_hash,
            block_number: parse_quantity(&body.block_number)? as u64,
            gas_used: parse_quantity(&body.gas_used)? as u64,
            effective_gas_price: body
                .effective_gas_price
                .as_deref()
                .map(parse_quantity)
                .transpose()?
                .unwrap_or_default(),
            // Pre-Byzantium receipts carry no status; treat as success
            success: body.status.as_deref().map_or(true, |s| s == "0x1"),
        })
    }
}

#[async_trait]
impl LedgerRpc for JsonRpcLedger {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        let id: String = self.rpc.call("eth_chainId", json!([])).await?;
        Ok(parse_quantity(&id)? as u64)
    }

    async fn fee_market(&self) -> Result<FeeMarket, RpcError> {
        let head: BlockHeader = self
            .rpc
            .call("eth_getBlockByNumber", json!(["latest", false]))
            .await?;

        let base_fee_per_gas = match head.base_fee_per_gas.as_deref() {
            Some(fee) => parse_quantity(fee)?,
            None => {
                // Legacy chain: fall back to the node's gas price
                let price: String = self.rpc.call("eth_gasPrice", json!([])).await?;
                parse_quantity(&price)?
            }
        };

        let priority_fee_per_gas = match self
            .rpc
            .call::<String>("eth_maxPriorityFeePerGas", json!([]))
            .await
        {
            Ok(fee) => parse_quantity(&fee)?,
            Err(e) => {
                debug!("eth_maxPriorityFeePerGas unavailable ({}), using default", e);
                self.config.default_priority_fee_wei
            }
        };

        Ok(FeeMarket {
            base_fee_per_gas,
            priority_fee_per_gas,
        })
    }

    async fn simulate(&self, call: &TransferCall) -> Result<u64, RpcError> {
        let gas: String = self
            .rpc
            .call("eth_estimateGas", json!([Self::call_object(call)]))
            .await?;
        Ok(parse_quantity(&gas)? as u64)
    }

    async fn broadcast(&self, tx: &SignedTransaction) -> Result<String, RpcError> {
        self.rpc
            .call("eth_sendRawTransaction", json!([tx.raw_hex()]))
            .await
    }

    async fn wait_confirmation(&self, tx_hash: &str, timeout: Duration) -> Result<Confirmation, RpcError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self
                .rpc
                .call_optional::<ReceiptBody>("eth_getTransactionReceipt", json!([tx_hash]))
                .await
            {
                Ok(Some(receipt)) => return Ok(Confirmation::Confirmed(receipt.try_into()?)),
                Ok(None) => debug!("⏳ {} not yet mined", tx_hash),
                // A dropped poll is not a failed transaction; keep waiting until the deadline
                Err(RpcError::Transport(e)) => warn!("Receipt poll for {} failed: {}", tx_hash, e),
                Err(e) => return Err(e),
            }

            if Instant::now() + self.config.receipt_poll_interval > deadline {
                return Ok(Confirmation::TimedOut);
            }
            sleep(self.config.receipt_poll_interval).await;
        }
    }

    async fn get_balance(&self, address: &str) -> Result<u128, RpcError> {
        let balance: String = self
            .rpc
            .call("eth_getBalance", json!([address, "latest"]))
            .await?;
        parse_quantity(&balance)
    }

    async fn transaction_count(&self, address: &str) -> Result<u64, RpcError> {
        let count: String = self
            .rpc
            .call("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        Ok(parse_quantity(&count)? as u64)
    }
}

/// Parse a hex quantity (`0x1a`)
pub fn parse_quantity(value: &str) -> Result<u128, RpcError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::InvalidResponse(format!("not a hex quantity: {}", value)))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| RpcError::InvalidResponse(format!("bad quantity {}: {}", value, e)))
}

pub fn to_quantity(value: u128) -> String {
    format!("0x{:x}", value)
}
