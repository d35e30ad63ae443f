use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use validator::Validate;

use crate::error::ValidationError;
use crate::jobs::{Asset, Frequency, NewJob, ScheduledJob};

// ========== REQUEST MODELS ==========

/// Asset descriptor as sent by clients
#[derive(Debug, Deserialize, Validate)]
pub struct AssetRequest {
    #[serde(default = "default_native")]
    pub is_native: bool,

    #[validate(length(equal = 42, message = "contract address must be 0x + 40 hex digits"))]
    pub contract_address: Option<String>,

    /// Required for tokens; must be omitted for the native asset, whose
    /// precision is fixed by the ledger
    #[validate(range(max = 36, message = "decimals must be at most 36"))]
    pub decimals: Option<u32>,

    #[validate(length(min = 1, max = 16, message = "symbol must be 1-16 characters"))]
    pub symbol: String,
}

fn default_native() -> bool {
    true
}

/// Request body shared by job creation and preview
#[derive(Debug, Deserialize, Validate)]
pub struct CreateJobRequest {
    #[validate(length(equal = 42, message = "owner address must be 0x + 40 hex digits"))]
    pub owner_address: String,

    #[validate(length(equal = 42, message = "recipient address must be 0x + 40 hex digits"))]
    pub recipient_address: String,

    #[validate]
    pub asset: AssetRequest,

    /// Decimal string, e.g. "1.5"
    #[validate(custom = "validate_amount_string")]
    pub amount: String,

    pub frequency: String,

    pub scheduled_for: DateTime<Utc>,

    #[validate(range(min = 1, max = 10000, message = "max_executions must be 1-10000"))]
    pub max_executions: Option<u32>,
}

fn validate_amount_string(amount: &str) -> Result<(), validator::ValidationError> {
    match Decimal::from_str(amount.trim()) {
        Ok(value) if value > Decimal::ZERO => Ok(()),
        _ => {
            let mut err = validator::ValidationError::new("amount");
            err.message = Some("amount must be a positive decimal string".into());
            Err(err)
        }
    }
}

impl AssetRequest {
    /// Resolve against the ledger's native asset
    pub fn into_asset(self, native: &Asset) -> Result<Asset, ValidationError> {
        let symbol = self.symbol.trim().to_ascii_uppercase();
        if self.is_native {
            if self.decimals.is_some() {
                return Err(ValidationError::NativeAssetMismatch(format!(
                    "decimals cannot be set for native {}",
                    native.symbol
                )));
            }
            if symbol != native.symbol.to_ascii_uppercase() {
                return Err(ValidationError::NativeAssetMismatch(format!(
                    "native asset on this ledger is {}, got {}",
                    native.symbol, symbol
                )));
            }
            return Ok(native.clone());
        }

        let contract = self
            .contract_address
            .filter(|c| !c.is_empty())
            .ok_or(ValidationError::MissingContractAddress)?;
        let decimals = self.decimals.ok_or_else(|| {
            ValidationError::InvalidInput("token assets require decimals".to_string())
        })?;
        Ok(Asset::token(&symbol, &contract, decimals))
    }
}

impl CreateJobRequest {
    pub fn into_new_job(self, native: &Asset) -> Result<NewJob, ValidationError> {
        let amount = Decimal::from_str(self.amount.trim())
            .map_err(|_| ValidationError::InvalidAmount(self.amount.clone()))?;
        let frequency = Frequency::from_str(&self.frequency)?;

        Ok(NewJob {
            owner_address: self.owner_address,
            recipient_address: self.recipient_address,
            asset: self.asset.into_asset(native)?,
            amount,
            frequency,
            scheduled_for: self.scheduled_for,
            max_executions: self.max_executions,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub owner: String,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub schedule_id: String,
    pub status: String,
    pub next_execution: Option<DateTime<Utc>>,
    pub job: ScheduledJob,
}

impl From<ScheduledJob> for CreateJobResponse {
    fn from(job: ScheduledJob) -> Self {
        Self {
            schedule_id: job.schedule_id.clone(),
            status: job.status.as_str().to_string(),
            next_execution: job.next_execution,
            job,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub owner_address: String,
    pub count: usize,
    pub jobs: Vec<ScheduledJob>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}
