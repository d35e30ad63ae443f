use config::{Config, Environment};
use serde::Deserialize;
use std::time::Duration;

use crate::chain::LedgerConfig;
use crate::error::AppError;
use crate::execution::TransferConfig;
use crate::fees::FeeConfig;
use crate::jobs::JobServiceConfig;
use crate::oracle::OracleConfig;
use crate::worker::{ExecutorLoopConfig, ReconcileConfig};

/// Application configuration, loaded once at startup from `SCHEDULER__*`
/// environment variables (e.g. `SCHEDULER__LEDGER__RPC_URL`).
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub ledger: LedgerSettings,
    pub fees: FeeSettings,
    pub oracle: OracleSettings,
    pub worker: WorkerSettings,
    pub jobs: JobSettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    /// Empty allows any origin
    pub cors_origins: Vec<String>,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            cors_origins: Vec::new(),
            rate_limit_requests: 30,
            rate_limit_window_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/scheduled_transfers".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerSettings {
    pub rpc_url: String,
    /// Signing node; defaults to `rpc_url`
    pub signer_rpc_url: Option<String>,
    pub request_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    pub confirmation_timeout_secs: u64,
    pub default_priority_fee_wei: u64,
    pub native_symbol: String,
    pub native_decimals: u32,
    pub tag_native_transfers: bool,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            signer_rpc_url: None,
            request_timeout_secs: 15,
            receipt_poll_interval_ms: 2_000,
            confirmation_timeout_secs: 120,
            default_priority_fee_wei: 1_500_000_000,
            native_symbol: "ETH".to_string(),
            native_decimals: 18,
            tag_native_transfers: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeeSettings {
    pub headroom_percent: u32,
    pub token_fallback_gas: u64,
    pub fallback_base_fee_wei: u64,
    pub fallback_priority_fee_wei: u64,
    pub low_congestion_wei: u64,
    pub high_congestion_wei: u64,
}

impl Default for FeeSettings {
    fn default() -> Self {
        let defaults = FeeConfig::default();
        Self {
            headroom_percent: defaults.headroom_percent,
            token_fallback_gas: defaults.token_fallback_gas,
            fallback_base_fee_wei: defaults.fallback_base_fee_wei as u64,
            fallback_priority_fee_wei: defaults.fallback_priority_fee_wei as u64,
            low_congestion_wei: defaults.low_congestion_wei as u64,
            high_congestion_wei: defaults.high_congestion_wei as u64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OracleSettings {
    pub hermes_url: String,
    pub cache_ttl_secs: u64,
    pub max_price_age_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            hermes_url: "https://hermes.pyth.network".to_string(),
            cache_ttl_secs: 5,
            max_price_age_secs: 120,
            request_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerSettings {
    /// Executor loops started by this process
    pub instances: usize,
    pub claimant_prefix: String,
    pub poll_interval_secs: u64,
    pub due_tolerance_secs: i64,
    pub batch_size: usize,
    pub stale_claim_after_secs: i64,
    pub reconcile_attempts: u32,
    pub forced_write_attempts: u32,
    pub reconcile_backoff_ms: u64,
    pub reconcile_max_backoff_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            instances: 2,
            claimant_prefix: "executor".to_string(),
            poll_interval_secs: 30,
            due_tolerance_secs: 300,
            batch_size: 10,
            stale_claim_after_secs: 1_800,
            reconcile_attempts: 3,
            forced_write_attempts: 2,
            reconcile_backoff_ms: 200,
            reconcile_max_backoff_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobSettings {
    pub past_grace_secs: i64,
    pub preview_occurrences: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            past_grace_secs: 60,
            preview_occurrences: 12,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("SCHEDULER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.worker.batch_size == 0 {
            return Err(AppError::Config("worker.batch_size must be positive".to_string()));
        }
        if self.worker.poll_interval_secs == 0 {
            return Err(AppError::Config("worker.poll_interval_secs must be positive".to_string()));
        }
        if self.fees.low_congestion_wei > self.fees.high_congestion_wei {
            return Err(AppError::Config(
                "fees.low_congestion_wei exceeds fees.high_congestion_wei".to_string(),
            ));
        }
        if self.ledger.native_decimals > 28 {
            return Err(AppError::Config(format!(
                "ledger.native_decimals {} exceeds the supported maximum of 28",
                self.ledger.native_decimals
            )));
        }
        Ok(())
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            rpc_url: self.ledger.rpc_url.clone(),
            request_timeout: Duration::from_secs(self.ledger.request_timeout_secs),
            receipt_poll_interval: Duration::from_millis(self.ledger.receipt_poll_interval_ms),
            default_priority_fee_wei: u128::from(self.ledger.default_priority_fee_wei),
        }
    }

    pub fn signer_rpc_url(&self) -> &str {
        self.ledger
            .signer_rpc_url
            .as_deref()
            .unwrap_or(&self.ledger.rpc_url)
    }

    pub fn fee_config(&self) -> FeeConfig {
        FeeConfig {
            headroom_percent: self.fees.headroom_percent,
            token_fallback_gas: self.fees.token_fallback_gas,
            fallback_base_fee_wei: u128::from(self.fees.fallback_base_fee_wei),
            fallback_priority_fee_wei: u128::from(self.fees.fallback_priority_fee_wei),
            low_congestion_wei: u128::from(self.fees.low_congestion_wei),
            high_congestion_wei: u128::from(self.fees.high_congestion_wei),
            native_symbol: self.ledger.native_symbol.clone(),
            native_decimals: self.ledger.native_decimals,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            confirmation_timeout: Duration::from_secs(self.ledger.confirmation_timeout_secs),
            native_symbol: self.ledger.native_symbol.clone(),
            native_decimals: self.ledger.native_decimals,
            tag_native_transfers: self.ledger.tag_native_transfers,
        }
    }

    pub fn oracle_config(&self) -> OracleConfig {
        OracleConfig {
            hermes_url: self.oracle.hermes_url.clone(),
            cache_ttl: Duration::from_secs(self.oracle.cache_ttl_secs),
            max_price_age: Duration::from_secs(self.oracle.max_price_age_secs),
            request_timeout: Duration::from_secs(self.oracle.request_timeout_secs),
        }
    }

    pub fn job_service_config(&self) -> JobServiceConfig {
        JobServiceConfig {
            past_grace: chrono::Duration::seconds(self.jobs.past_grace_secs),
            preview_occurrences: self.jobs.preview_occurrences,
            native_symbol: self.ledger.native_symbol.clone(),
            native_decimals: self.ledger.native_decimals,
        }
    }

    /// Config for the `index`-th executor loop of this process
    pub fn executor_loop_config(&self, index: usize) -> ExecutorLoopConfig {
        let worker = &self.worker;
        ExecutorLoopConfig {
            claimant_id: ExecutorLoopConfig::claimant_id(&worker.claimant_prefix, index),
            poll_interval: Duration::from_secs(worker.poll_interval_secs),
            due_tolerance: chrono::Duration::seconds(worker.due_tolerance_secs),
            batch_size: worker.batch_size,
            stale_claim_after: chrono::Duration::seconds(worker.stale_claim_after_secs),
            reconcile: ReconcileConfig {
                conditional_attempts: worker.reconcile_attempts,
                forced_attempts: worker.forced_write_attempts,
                initial_backoff: Duration::from_millis(worker.reconcile_backoff_ms),
                max_backoff: Duration::from_millis(worker.reconcile_max_backoff_ms),
            },
        }
    }
}
