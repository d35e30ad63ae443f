use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::PriceOracle;

/// Pyth USD price feed identifiers by asset symbol
pub struct PythPriceFeedIds {
    feeds: HashMap<String, String>,
}

impl PythPriceFeedIds {
    pub fn new() -> Self {
        let mut feeds = HashMap::new();

        feeds.insert(
            "ETH".to_string(),
            "ff61491a931112ddf1bd8147cd1b641375f79f5825126d665480874634fd0ace".to_string(),
        );
        feeds.insert(
            "BTC".to_string(),
            "e62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43".to_string(),
        );
        feeds.insert(
            "USDC".to_string(),
            "eaa020c61cc479712813461ce153894a96a6c00b21ed0cfc2798d1f9a9e9c94a".to_string(),
        );
        feeds.insert(
            "USDT".to_string(),
            "2b89b9dc8fdf9f34709a5b106b472f0f39bb6ca9ce04b0fd7f2e971688e2e53b".to_string(),
        );
        feeds.insert(
            "SOL".to_string(),
            "ef0d8b6fda2ceba41da15d4095d1da392a0d2f8ed0c6c7bc0f4cfac8c280b56d".to_string(),
        );

        Self { feeds }
    }

    /// Wrapped assets share the feed of the underlying asset
    pub fn get_feed_id(&self, symbol: &str) -> Option<&str> {
        let symbol = symbol.to_ascii_uppercase();
        let key = match symbol.as_str() {
            "WETH" => "ETH",
            "WBTC" => "BTC",
            other => other,
        };
        self.feeds.get(key).map(String::as_str)
    }
}

impl Default for PythPriceFeedIds {
    fn default() -> Self {
        Self::new()
    }
}

/// One feed entry from the Hermes `latest_price_feeds` endpoint
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PythPriceFeed {
    pub id: String,
    pub price: PythPrice,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PythPrice {
    pub price: String,
    #[serde(rename = "conf")]
    pub confidence: String,
    #[serde(rename = "expo")]
    pub exponent: i32,
    pub publish_time: i64,
}

impl PythPrice {
    /// Convert Pyth price to decimal (handle exponent)
    pub fn to_decimal(&self) -> Option<Decimal> {
        let raw = Decimal::from_str(&self.price).ok()?;
        if self.exponent <= 0 {
            let mut scaled = raw;
            scaled.set_scale(self.exponent.unsigned_abs()).ok()?;
            Some(scaled)
        } else {
            raw.checked_mul(Decimal::from(10i64.checked_pow(self.exponent as u32)?))
        }
    }

    /// Confidence interval as a percentage of price
    pub fn confidence_pct(&self) -> Option<Decimal> {
        let conf = Decimal::from_str(&self.confidence).ok()?;
        let price = Decimal::from_str(&self.price).ok()?;
        if price.is_zero() {
            return None;
        }
        Some((conf / price) * Decimal::from(100))
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() - self.publish_time
    }
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub hermes_url: String,
    /// How long a fetched price is served from cache
    pub cache_ttl: Duration,
    /// Prices published longer ago than this are treated as unavailable
    pub max_price_age: Duration,
    pub request_timeout: Duration,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            hermes_url: "https://hermes.pyth.network".to_string(),
            cache_ttl: Duration::from_secs(5),
            max_price_age: Duration::from_secs(120),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Pyth Hermes spot-price client with a short-lived cache
pub struct PythOracle {
    client: Client,
    config: OracleConfig,
    feed_ids: PythPriceFeedIds,
    cache: RwLock<HashMap<String, (Decimal, DateTime<Utc>)>>,
}

impl PythOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self::with_feeds(config, PythPriceFeedIds::new())
    }

    pub fn with_feeds(config: OracleConfig, feed_ids: PythPriceFeedIds) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        info!("✅ Pyth price oracle configured: {}", config.hermes_url);
        Self {
            client,
            config,
            feed_ids,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, symbol: &str) -> Option<Decimal> {
        let cache = self.cache.read();
        let (price, fetched_at) = cache.get(symbol)?;
        let age = Utc::now().signed_duration_since(*fetched_at);
        (age.to_std().ok()? < self.config.cache_ttl).then_some(*price)
    }

    async fn fetch_price(&self, feed_id: &str) -> Result<PythPrice, String> {
        let url = format!(
            "{}/api/latest_price_feeds?ids[]={}",
            self.config.hermes_url.trim_end_matches('/'),
            feed_id
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        let feeds: Vec<PythPriceFeed> = response
            .json()
            .await
            .map_err(|e| format!("invalid response: {}", e))?;

        feeds
            .into_iter()
            .next()
            .map(|feed| feed.price)
            .ok_or_else(|| "no price data in response".to_string())
    }
}

#[async_trait]
impl PriceOracle for PythOracle {
    async fn spot_price(&self, symbol: &str) -> Option<Decimal> {
        let symbol = symbol.to_ascii_uppercase();
        if let Some(price) = self.cached(&symbol) {
            debug!("✓ Price cache hit: {} = {}", symbol, price);
            return Some(price);
        }

        let feed_id = match self.feed_ids.get_feed_id(&symbol) {
            Some(id) => id.to_string(),
            None => {
                warn!("No Pyth feed configured for {}", symbol);
                return None;
            }
        };

        let price = match self.fetch_price(&feed_id).await {
            Ok(price) => price,
            Err(e) => {
                warn!("Pyth price for {} unavailable: {}", symbol, e);
                return None;
            }
        };

        let age = price.age_secs(Utc::now());
        if age > self.config.max_price_age.as_secs() as i64 {
            warn!("Stale Pyth price for {}: {}s old", symbol, age);
            return None;
        }

        let value = price.to_decimal()?;
        debug!(
            "✓ Fetched price: {} = {} USD (confidence: {}%)",
            symbol,
            value,
            price.confidence_pct().unwrap_or_default()
        );

        self.cache.write().insert(symbol, (value, Utc::now()));
        Some(value)
    }
}
