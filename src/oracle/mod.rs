pub mod pyth;

use async_trait::async_trait;
use rust_decimal::Decimal;

pub use pyth::{OracleConfig, PythOracle};

/// Spot-price lookup in fiat (USD)
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// `None` when no fresh price is available. Callers must not substitute zero.
    async fn spot_price(&self, symbol: &str) -> Option<Decimal>;
}
