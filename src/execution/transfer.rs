use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::chain::{
    from_base_units, Confirmation, LedgerRpc, TransactionSigner, TransferCall,
    UnsignedTransaction, NATIVE_TRANSFER_GAS,
};
use crate::error::{ExecutionError, RpcError};
use crate::fees::FeeQuote;
use crate::jobs::models::Asset;
use crate::oracle::PriceOracle;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Upper bound on waiting for a receipt after broadcast
    pub confirmation_timeout: Duration,
    pub native_symbol: String,
    pub native_decimals: u32,
    /// Attach the execution's idempotency tag as calldata on native transfers
    pub tag_native_transfers: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(120),
            native_symbol: "ETH".to_string(),
            native_decimals: 18,
            tag_native_transfers: true,
        }
    }
}

/// Outcome of a confirmed transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReceipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub gas_used: u64,
    pub effective_fee_per_unit: u128,
    /// Realized network fee in the native asset
    #[serde(with = "rust_decimal::serde::str")]
    pub actual_cost_in_asset: Decimal,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub actual_cost_in_fiat: Option<Decimal>,
    pub confirmed_at: DateTime<Utc>,
}

/// Builds, signs, broadcasts and confirms a single transfer.
///
/// SECURITY: No internal retries. A failure at any step is reported once and
/// the caller decides the job's fate.
///
/// Nonce read, signing and broadcast are serialized per sender, so transfers
/// from one owner that run concurrently through the same executor never sign
/// with the same pending nonce. Share one executor across every loop in a process.
pub struct TransferExecutor {
    config: TransferConfig,
    ledger: Arc<dyn LedgerRpc>,
    oracle: Arc<dyn PriceOracle>,
    sender_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TransferExecutor {
    pub fn new(config: TransferConfig, ledger: Arc<dyn LedgerRpc>, oracle: Arc<dyn PriceOracle>) -> Self {
        Self {
            config,
            ledger,
            oracle,
            sender_locks: Mutex::new(HashMap::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, signer, fee_quote, idempotency_tag), fields(asset = %asset.symbol))]
    pub async fn execute(
        &self,
        asset: &Asset,
        sender: &str,
        recipient: &str,
        amount: Decimal,
        signer: &dyn TransactionSigner,
        fee_quote: &FeeQuote,
        idempotency_tag: Option<[u8; 32]>,
    ) -> Result<TransferReceipt, ExecutionError> {
        if !signer.address().eq_ignore_ascii_case(sender) {
            return Err(ExecutionError::Signing(format!(
                "signer does not control sender {}",
                sender
            )));
        }

        if asset.is_native && asset.decimals != self.config.native_decimals {
            return Err(ExecutionError::InvalidTransfer(format!(
                "native {} has {} decimals on this ledger, job says {}",
                asset.symbol, self.config.native_decimals, asset.decimals
            )));
        }

        let units = asset
            .to_base_units(amount)
            .map_err(|e| ExecutionError::InvalidAmount(e.to_string()))?;

        let (call, gas_limit) = self
            .build_call(asset, sender, recipient, units, fee_quote, idempotency_tag)
            .await?;

        self.check_balance(sender, &call, gas_limit, fee_quote).await?;

        let (tx_hash, nonce) = self
            .sign_and_broadcast(sender, recipient, call, gas_limit, fee_quote, signer)
            .await?;
        info!(
            "Transaction sent: {} (nonce {}, {} {})",
            tx_hash, nonce, amount, asset.symbol
        );

        let receipt = match self
            .ledger
            .wait_confirmation(&tx_hash, self.config.confirmation_timeout)
            .await?
        {
            Confirmation::Confirmed(receipt) => receipt,
            Confirmation::TimedOut => {
                warn!("Confirmation timeout for {}", tx_hash);
                return Err(ExecutionError::ConfirmationTimeout {
                    tx_hash,
                    waited_secs: self.config.confirmation_timeout.as_secs(),
                });
            }
        };

        if !receipt.success {
            error!("Transaction {} reverted in block {}", tx_hash, receipt.block_number);
            return Err(ExecutionError::Reverted { tx_hash });
        }

        // Some nodes omit effectiveGasPrice; the quoted fee is the closest substitute
        let effective_fee_per_unit = if receipt.effective_gas_price > 0 {
            receipt.effective_gas_price
        } else {
            fee_quote.fee_per_unit
        };
        let actual_cost_in_asset = from_base_units(
            u128::from(receipt.gas_used).saturating_mul(effective_fee_per_unit),
            self.config.native_decimals,
        );
        let actual_cost_in_fiat = self
            .oracle
            .spot_price(&self.config.native_symbol)
            .await
            .and_then(|price| actual_cost_in_asset.checked_mul(price));

        info!(
            "✅ Transaction confirmed: {} (block {}, gas {}, cost {} {})",
            receipt.tx_hash,
            receipt.block_number,
            receipt.gas_used,
            actual_cost_in_asset,
            self.config.native_symbol
        );

        Ok(TransferReceipt {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
            effective_fee_per_unit,
            actual_cost_in_asset,
            actual_cost_in_fiat,
            confirmed_at: Utc::now(),
        })
    }

    fn sender_lock(&self, sender: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.sender_locks
            .lock()
            .entry(sender.to_ascii_lowercase())
            .or_default()
            .clone()
    }

    /// Holds the sender's lock until the node has accepted the transaction,
    /// after which its pending nonce already counts it
    async fn sign_and_broadcast(
        &self,
        sender: &str,
        recipient: &str,
        call: TransferCall,
        gas_limit: u64,
        fee_quote: &FeeQuote,
        signer: &dyn TransactionSigner,
    ) -> Result<(String, u64), ExecutionError> {
        let lock = self.sender_lock(sender);
        let _guard = lock.lock().await;

        let nonce = self.ledger.transaction_count(sender).await?;
        let chain_id = self.ledger.chain_id().await?;
        let unsigned = UnsignedTransaction {
            chain_id,
            nonce,
            call,
            gas_limit,
            max_fee_per_gas: fee_quote.max_fee_per_unit,
            max_priority_fee_per_gas: fee_quote.priority_fee_per_unit,
        };

        let signed = signer.sign(&unsigned).await?;

        match self.ledger.broadcast(&signed).await {
            Ok(hash) => Ok((hash, nonce)),
            Err(e) => {
                error!("Broadcast rejected for {} -> {}: {}", sender, recipient, e);
                Err(ExecutionError::BroadcastRejected(e.to_string()))
            }
        }
    }

    async fn build_call(
        &self,
        asset: &Asset,
        sender: &str,
        recipient: &str,
        units: u128,
        fee_quote: &FeeQuote,
        idempotency_tag: Option<[u8; 32]>,
    ) -> Result<(TransferCall, u64), ExecutionError> {
        if asset.is_native {
            let data = match idempotency_tag {
                Some(tag) if self.config.tag_native_transfers => tag.to_vec(),
                _ => Vec::new(),
            };
            let call = TransferCall::native(sender, recipient, units, data);
            let gas_limit = fee_quote.gas_units.max(NATIVE_TRANSFER_GAS) + call.calldata_gas();
            return Ok((call, gas_limit));
        }

        let contract = asset.contract_address.as_deref().ok_or_else(|| {
            ExecutionError::InvalidTransfer(format!("{} has no contract address", asset.symbol))
        })?;
        let call = TransferCall::token(sender, contract, recipient, units)
            .map_err(|e| ExecutionError::InvalidTransfer(e.to_string()))?;

        // Reverts surface here, before anything is signed
        let simulated = match self.ledger.simulate(&call).await {
            Ok(gas) => gas,
            Err(RpcError::Node { message, .. }) => {
                warn!("Token transfer simulation reverted: {}", message);
                return Err(ExecutionError::SimulationReverted(message));
            }
            Err(e) => return Err(e.into()),
        };

        Ok((call, simulated.max(fee_quote.gas_units)))
    }

    /// The sender must hold the transferred value plus the worst-case fee
    async fn check_balance(
        &self,
        sender: &str,
        call: &TransferCall,
        gas_limit: u64,
        fee_quote: &FeeQuote,
    ) -> Result<(), ExecutionError> {
        let max_fee = u128::from(gas_limit).saturating_mul(fee_quote.max_fee_per_unit);
        let required = call.value.saturating_add(max_fee);
        let available = self.ledger.get_balance(sender).await?;

        if available < required {
            let decimals = self.config.native_decimals;
            return Err(ExecutionError::InsufficientFunds {
                required: format!("{} {}", from_base_units(required, decimals), self.config.native_symbol),
                available: format!("{} {}", from_base_units(available, decimals), self.config.native_symbol),
            });
        }

        Ok(())
    }
}
