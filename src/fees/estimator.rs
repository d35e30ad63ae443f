use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::chain::{from_base_units, FeeMarket, LedgerRpc, TransferCall, NATIVE_TRANSFER_GAS};
use crate::jobs::models::Asset;
use crate::oracle::PriceOracle;

const GWEI: u128 = 1_000_000_000;

/// Fee estimator configuration
#[derive(Debug, Clone)]
pub struct FeeConfig {
    /// Extra headroom over base fee tolerated between estimate and inclusion (25 = 25%)
    pub headroom_percent: u32,
    /// Gas substituted when a token transfer cannot be simulated
    pub token_fallback_gas: u64,
    /// Fee per gas assumed when the fee market cannot be read
    pub fallback_base_fee_wei: u128,
    pub fallback_priority_fee_wei: u128,
    /// Base fee below which the network counts as uncongested
    pub low_congestion_wei: u128,
    /// Base fee at or above which the network counts as congested
    pub high_congestion_wei: u128,
    pub native_symbol: String,
    pub native_decimals: u32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            headroom_percent: 25,
            token_fallback_gas: 65_000,
            fallback_base_fee_wei: 50 * GWEI,
            fallback_priority_fee_wei: 2 * GWEI,
            low_congestion_wei: 20 * GWEI,
            high_congestion_wei: 60 * GWEI,
            native_symbol: "ETH".to_string(),
            native_decimals: 18,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteSource {
    /// Fee market read from the chain head
    Network,
    /// Ledger RPC unreachable; static tiers
    Fallback,
}

/// Estimated cost of one transfer. Fee fields are wei per gas unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeeQuote {
    pub fee_per_unit: u128,
    pub max_fee_per_unit: u128,
    pub priority_fee_per_unit: u128,
    pub gas_units: u64,
    /// Expected cost in the native asset
    #[serde(with = "rust_decimal::serde::str")]
    pub cost_in_asset: Decimal,
    /// Worst-case cost at `max_fee_per_unit`
    #[serde(with = "rust_decimal::serde::str")]
    pub max_cost_in_asset: Decimal,
    /// `None` when no spot price is available; never zero-filled
    #[serde(with = "rust_decimal::serde::str_option")]
    pub cost_in_fiat: Option<Decimal>,
    pub congestion_level: CongestionLevel,
    pub source: QuoteSource,
    pub native_symbol: String,
}

/// Fee estimator - best effort, never fails
pub struct FeeEstimator {
    config: FeeConfig,
    ledger: Arc<dyn LedgerRpc>,
    oracle: Arc<dyn PriceOracle>,
}

impl FeeEstimator {
    pub fn new(config: FeeConfig, ledger: Arc<dyn LedgerRpc>, oracle: Arc<dyn PriceOracle>) -> Self {
        Self {
            config,
            ledger,
            oracle,
        }
    }

    /// Estimate the cost of transferring `amount` of `asset` from `sender` to `recipient`
    #[instrument(skip_all, fields(asset = %asset.symbol, native = asset.is_native))]
    pub async fn estimate(
        &self,
        asset: &Asset,
        sender: &str,
        recipient: &str,
        amount: Decimal,
    ) -> FeeQuote {
        let market = match self.ledger.fee_market().await {
            Ok(market) => market,
            Err(e) => {
                warn!("⚠️  Fee market unavailable ({}), using fallback quote", e);
                return self.fallback_quote(asset).await;
            }
        };

        let (gas_units, simulated) = if asset.is_native {
            (NATIVE_TRANSFER_GAS, true)
        } else {
            match self.simulate_token_transfer(asset, sender, recipient, amount).await {
                Some(gas) => (gas, true),
                None => (self.config.token_fallback_gas, false),
            }
        };

        let congestion_level = if simulated {
            self.congestion_level(market.base_fee_per_gas)
        } else {
            CongestionLevel::Unknown
        };

        let quote = self
            .build_quote(market, gas_units, congestion_level, QuoteSource::Network)
            .await;
        info!(
            "📊 Fee quote: {} gas @ {} wei (max {}), cost {} {} [{:?}]",
            quote.gas_units,
            quote.fee_per_unit,
            quote.max_fee_per_unit,
            quote.cost_in_asset,
            quote.native_symbol,
            quote.congestion_level
        );
        quote
    }

    /// Static quote used when the ledger cannot be reached
    pub async fn fallback_quote(&self, asset: &Asset) -> FeeQuote {
        let gas_units = if asset.is_native {
            NATIVE_TRANSFER_GAS
        } else {
            self.config.token_fallback_gas
        };
        let market = FeeMarket {
            base_fee_per_gas: self.config.fallback_base_fee_wei,
            priority_fee_per_gas: self.config.fallback_priority_fee_wei,
        };

        self.build_quote(market, gas_units, CongestionLevel::Unknown, QuoteSource::Fallback)
            .await
    }

    async fn simulate_token_transfer(
        &self,
        asset: &Asset,
        sender: &str,
        recipient: &str,
        amount: Decimal,
    ) -> Option<u64> {
        let contract = asset.contract_address.as_deref()?;
        let units = asset.to_base_units(amount).ok()?;
        let call = TransferCall::token(sender, contract, recipient, units).ok()?;

        match self.ledger.simulate(&call).await {
            Ok(gas) => Some(gas),
            Err(e) => {
                warn!(
                    "Token transfer simulation failed ({}), substituting {} gas",
                    e, self.config.token_fallback_gas
                );
                None
            }
        }
    }

    fn congestion_level(&self, base_fee: u128) -> CongestionLevel {
        if base_fee < self.config.low_congestion_wei {
            CongestionLevel::Low
        } else if base_fee < self.config.high_congestion_wei {
            CongestionLevel::Medium
        } else {
            CongestionLevel::High
        }
    }

    async fn build_quote(
        &self,
        market: FeeMarket,
        gas_units: u64,
        congestion_level: CongestionLevel,
        source: QuoteSource,
    ) -> FeeQuote {
        let fee_per_unit = market.base_fee_per_gas.saturating_add(market.priority_fee_per_gas);
        let headroom = market
            .base_fee_per_gas
            .saturating_mul(u128::from(self.config.headroom_percent))
            / 100;
        let max_fee_per_unit = fee_per_unit.saturating_add(headroom);

        let gas = u128::from(gas_units);
        let decimals = self.config.native_decimals;
        let cost_in_asset = from_base_units(gas.saturating_mul(fee_per_unit), decimals);
        let max_cost_in_asset = from_base_units(gas.saturating_mul(max_fee_per_unit), decimals);

        let cost_in_fiat = match self.oracle.spot_price(&self.config.native_symbol).await {
            Some(price) => cost_in_asset.checked_mul(price),
            None => {
                debug!("No spot price for {}, fiat cost unavailable", self.config.native_symbol);
                None
            }
        };

        FeeQuote {
            fee_per_unit,
            max_fee_per_unit,
            priority_fee_per_unit: market.priority_fee_per_gas,
            gas_units,
            cost_in_asset,
            max_cost_in_asset,
            cost_in_fiat,
            congestion_level,
            source,
            native_symbol: self.config.native_symbol.clone(),
        }
    }
}
