// Ledger network interface - fee market, simulation, broadcast and confirmation
pub mod jsonrpc;
pub mod signer;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;

use crate::error::RpcError;

pub use jsonrpc::{JsonRpcLedger, LedgerConfig};
pub use signer::{KeySource, NodeKeySource, TransactionSigner};

/// Gas consumed by a plain native-value transfer
pub const NATIVE_TRANSFER_GAS: u64 = 21_000;

/// `transfer(address,uint256)` selector
pub const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// Current fee market at the chain head, in wei per gas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeMarket {
    pub base_fee_per_gas: u128,
    pub priority_fee_per_gas: u128,
}

/// A call that moves value: native transfer or token `transfer`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCall {
    pub from: String,
    /// Recipient for native transfers, token contract for token transfers
    pub to: String,
    /// Native value in wei
    pub value: u128,
    pub data: Vec<u8>,
}

impl TransferCall {
    pub fn native(from: &str, recipient: &str, value: u128, data: Vec<u8>) -> Self {
        Self {
            from: from.to_string(),
            to: recipient.to_string(),
            value,
            data,
        }
    }

    pub fn token(from: &str, contract: &str, recipient: &str, amount: u128) -> Result<Self, RpcError> {
        Ok(Self {
            from: from.to_string(),
            to: contract.to_string(),
            value: 0,
            data: encode_erc20_transfer(recipient, amount)?,
        })
    }

    /// Intrinsic gas for the call's calldata (4 per zero byte, 16 per non-zero byte)
    pub fn calldata_gas(&self) -> u64 {
        self.data
            .iter()
            .map(|b| if *b == 0 { 4 } else { 16 })
            .sum()
    }
}

/// Transaction ready for signing (EIP-1559 fields)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub call: TransferCall,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Vec<u8>,
}

impl SignedTransaction {
    pub fn raw_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.raw))
    }
}

/// Confirmation receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReceipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub gas_used: u64,
    /// Fee per gas actually paid in the including block
    pub effective_gas_price: u128,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed(ChainReceipt),
    TimedOut,
}

/// Ledger RPC - consumed, never implemented by the scheduler core
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    async fn chain_id(&self) -> Result<u64, RpcError>;

    async fn fee_market(&self) -> Result<FeeMarket, RpcError>;

    /// Gas the call would use against the current state. Reverts surface as errors.
    async fn simulate(&self, call: &TransferCall) -> Result<u64, RpcError>;

    /// Returns the transaction hash
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<String, RpcError>;

    async fn wait_confirmation(&self, tx_hash: &str, timeout: Duration) -> Result<Confirmation, RpcError>;

    /// Native balance in wei
    async fn get_balance(&self, address: &str) -> Result<u128, RpcError>;

    /// Next nonce for `address`
    async fn transaction_count(&self, address: &str) -> Result<u64, RpcError>;
}

/// `0x` followed by 40 hex digits
pub fn is_valid_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .map_or(false, |hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

pub fn encode_erc20_transfer(recipient: &str, amount: u128) -> Result<Vec<u8>, RpcError> {
    let recipient_bytes = recipient
        .strip_prefix("0x")
        .filter(|_| is_valid_address(recipient))
        .and_then(|h| hex::decode(h).ok())
        .ok_or_else(|| RpcError::InvalidResponse(format!("invalid recipient address {}", recipient)))?;

    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&ERC20_TRANSFER_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(&recipient_bytes);
    data.extend_from_slice(&[0u8; 16]);
    data.extend_from_slice(&amount.to_be_bytes());
    Ok(data)
}

/// Convert a wei amount into native units with `decimals` places
pub fn from_base_units(amount: u128, decimals: u32) -> Decimal {
    // Saturates when the value does not fit a 96-bit mantissa
    i128::try_from(amount)
        .ok()
        .and_then(|value| Decimal::try_from_i128_with_scale(value, decimals).ok())
        .unwrap_or(Decimal::MAX)
}
