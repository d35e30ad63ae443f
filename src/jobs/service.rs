use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::models::{Asset, Frequency, JobPatch, JobStatus, ScheduledJob, UpdateGuard};
use super::store::JobStore;
use crate::chain::is_valid_address;
use crate::error::{AppError, AppResult, ValidationError};
use crate::fees::{FeeEstimator, FeeQuote};
use crate::recurrence::next_instants;

#[derive(Debug, Clone)]
pub struct JobServiceConfig {
    /// How far in the past `scheduled_for` may lie (clock skew between client and server)
    pub past_grace: Duration,
    /// Upper bound on occurrences listed in a preview
    pub preview_occurrences: usize,
    pub native_symbol: String,
    pub native_decimals: u32,
}

impl Default for JobServiceConfig {
    fn default() -> Self {
        Self {
            past_grace: Duration::minutes(1),
            preview_occurrences: 12,
            native_symbol: "ETH".to_string(),
            native_decimals: 18,
        }
    }
}

/// Parameters of a job to create or preview
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub owner_address: String,
    pub recipient_address: String,
    pub asset: Asset,
    pub amount: Decimal,
    pub frequency: Frequency,
    pub scheduled_for: DateTime<Utc>,
    /// Defaults to 1 for one-time jobs; required for recurring jobs
    pub max_executions: Option<u32>,
}

/// Fee quote plus the execution dates a job would have
#[derive(Debug, Clone, Serialize)]
pub struct JobPreview {
    pub fee_quote: FeeQuote,
    pub occurrences: Vec<DateTime<Utc>>,
    pub max_executions: u32,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
    /// Expected fees over every execution, native asset
    #[serde(with = "rust_decimal::serde::str")]
    pub total_fees_in_asset: Decimal,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub total_fees_in_fiat: Option<Decimal>,
}

/// Job creation API: create, preview, cancel, inspect
pub struct JobService {
    store: Arc<dyn JobStore>,
    estimator: Arc<FeeEstimator>,
    config: JobServiceConfig,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, estimator: Arc<FeeEstimator>, config: JobServiceConfig) -> Self {
        Self {
            store,
            estimator,
            config,
        }
    }

    /// The ledger's native asset as jobs must record it
    pub fn native_asset(&self) -> Asset {
        Asset::native(&self.config.native_symbol, self.config.native_decimals)
    }

    /// Validate and persist a new active job
    #[instrument(skip(self, new_job), fields(owner = %new_job.owner_address, frequency = %new_job.frequency))]
    pub async fn create_job(&self, new_job: NewJob) -> AppResult<ScheduledJob> {
        let now = Utc::now();
        let max_executions = self.validate(&new_job, now)?;

        let job = ScheduledJob {
            schedule_id: ScheduledJob::generate_schedule_id(),
            owner_address: new_job.owner_address,
            recipient_address: new_job.recipient_address,
            asset: new_job.asset,
            amount: new_job.amount,
            frequency: new_job.frequency,
            scheduled_for: new_job.scheduled_for,
            next_execution: Some(new_job.scheduled_for),
            execution_count: 0,
            max_executions,
            status: JobStatus::Active,
            processing_by: None,
            processing_started: None,
            last_error: None,
            failed_at: None,
            created_at: now,
            last_execution_at: None,
            last_transaction_hash: None,
            cancelled_at: None,
        };
        job.check_invariants().map_err(AppError::Internal)?;

        self.store.insert(&job).await?;
        info!(
            "✅ Scheduled {}: {} {} every {} x{} starting {}",
            job.schedule_id,
            job.amount,
            job.asset.symbol,
            job.frequency,
            job.max_executions,
            job.scheduled_for
        );
        Ok(job)
    }

    /// Fee quote and upcoming execution dates, without persisting anything
    pub async fn preview_job(&self, new_job: &NewJob) -> AppResult<JobPreview> {
        let max_executions = self.validate(new_job, Utc::now())?;

        let fee_quote = self
            .estimator
            .estimate(
                &new_job.asset,
                &new_job.owner_address,
                &new_job.recipient_address,
                new_job.amount,
            )
            .await;

        let count = (max_executions as usize).min(self.config.preview_occurrences);
        let occurrences = next_instants(new_job.scheduled_for, new_job.frequency, count);

        let executions = Decimal::from(max_executions);
        let total_fees_in_asset = fee_quote.cost_in_asset * executions;
        let total_fees_in_fiat = fee_quote.cost_in_fiat.map(|fiat| fiat * executions);

        Ok(JobPreview {
            occurrences,
            max_executions,
            total_amount: new_job.amount * executions,
            total_fees_in_asset,
            total_fees_in_fiat,
            fee_quote,
        })
    }

    /// Cancel an active job. Cancelling twice is not an error.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, schedule_id: &str) -> AppResult<ScheduledJob> {
        let guard = UpdateGuard::status(JobStatus::Active);
        let cancelled = self
            .store
            .conditional_update(schedule_id, &guard, &JobPatch::cancelled(Utc::now()))
            .await?;

        let job = self
            .store
            .get(schedule_id)
            .await?
            .ok_or_else(|| AppError::NotFound(schedule_id.to_string()))?;

        if cancelled {
            info!("Cancelled job {}", schedule_id);
            return Ok(job);
        }

        match job.status {
            JobStatus::Cancelled => Ok(job),
            status => {
                warn!("Cancel of {} rejected: job is {}", schedule_id, status);
                Err(AppError::Conflict(format!(
                    "job {} is {} and can no longer be cancelled",
                    schedule_id, status
                )))
            }
        }
    }

    pub async fn get_job(&self, schedule_id: &str) -> AppResult<ScheduledJob> {
        self.store
            .get(schedule_id)
            .await?
            .ok_or_else(|| AppError::NotFound(schedule_id.to_string()))
    }

    /// All jobs of an owner, newest first
    pub async fn list_jobs(&self, owner_address: &str) -> AppResult<Vec<ScheduledJob>> {
        if !is_valid_address(owner_address) {
            return Err(ValidationError::InvalidAddress {
                field: "owner",
                value: owner_address.to_string(),
            }
            .into());
        }
        Ok(self.store.list_by_owner(owner_address).await?)
    }

    /// Returns the effective max executions
    fn validate(&self, job: &NewJob, now: DateTime<Utc>) -> Result<u32, ValidationError> {
        for (field, value) in [
            ("owner", &job.owner_address),
            ("recipient", &job.recipient_address),
        ] {
            if !is_valid_address(value) {
                return Err(ValidationError::InvalidAddress {
                    field,
                    value: value.clone(),
                });
            }
        }

        if job.asset.is_native {
            let native = self.native_asset();
            if job.asset != native {
                return Err(ValidationError::NativeAssetMismatch(format!(
                    "native asset on this ledger is {} with {} decimals, got {} with {}",
                    native.symbol, native.decimals, job.asset.symbol, job.asset.decimals
                )));
            }
        } else {
            match job.asset.contract_address.as_deref() {
                None | Some("") => return Err(ValidationError::MissingContractAddress),
                Some(contract) if !is_valid_address(contract) => {
                    return Err(ValidationError::InvalidAddress {
                        field: "contract",
                        value: contract.to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        job.asset.to_base_units(job.amount)?;

        let max_executions = match (job.frequency, job.max_executions) {
            (Frequency::Once, None | Some(1)) => 1,
            (Frequency::Once, Some(other)) => {
                return Err(ValidationError::InvalidMaxExecutions(format!(
                    "one-time jobs run exactly once, got {}",
                    other
                )))
            }
            (_, None) => {
                return Err(ValidationError::InvalidMaxExecutions(
                    "recurring jobs require max_executions".to_string(),
                ))
            }
            (_, Some(0)) => {
                return Err(ValidationError::InvalidMaxExecutions(
                    "max_executions must be at least 1".to_string(),
                ))
            }
            (_, Some(n)) => n,
        };

        if job.scheduled_for < now - self.config.past_grace {
            return Err(ValidationError::ScheduleInPast(job.scheduled_for.to_rfc3339()));
        }

        Ok(max_executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory::MemoryJobStore;
    use crate::testing::{job_service, new_job, OWNER, TOKEN_CONTRACT};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_create_job_persists_active_record() {
        let store = Arc::new(MemoryJobStore::new());
        let service = job_service(store.clone());

        let job = service.create_job(new_job(Frequency::Weekly, Some(4))).await.unwrap();
        assert!(job.schedule_id.starts_with("sched_"));
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.next_execution, Some(job.scheduled_for));
        assert!(job.check_invariants().is_ok());

        let stored = store.get(&job.schedule_id).await.unwrap().unwrap();
        assert_eq!(stored, job);
    }

    #[tokio::test]
    async fn test_native_asset_follows_ledger_config() {
        let service = job_service(Arc::new(MemoryJobStore::new()));
        assert_eq!(service.native_asset(), Asset::native("ETH", 18));

        let job = service.create_job(new_job(Frequency::Once, None)).await.unwrap();
        assert_eq!(
            job.asset.to_base_units(job.amount).unwrap(),
            1_500_000_000_000_000_000
        );
    }

    #[tokio::test]
    async fn test_once_defaults_to_single_execution() {
        let service = job_service(Arc::new(MemoryJobStore::new()));
        let job = service.create_job(new_job(Frequency::Once, None)).await.unwrap();
        assert_eq!(job.max_executions, 1);

        let err = service
            .create_job(new_job(Frequency::Once, Some(3)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation(ValidationError::InvalidMaxExecutions(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_input() {
        let store = Arc::new(MemoryJobStore::new());
        let service = job_service(store.clone());

        let mut bad_address = new_job(Frequency::Daily, Some(3));
        bad_address.recipient_address = "0x1234".to_string();

        let mut zero_amount = new_job(Frequency::Daily, Some(3));
        zero_amount.amount = dec!(0);

        let mut past = new_job(Frequency::Daily, Some(3));
        past.scheduled_for = Utc::now() - Duration::hours(1);

        let zero_max = new_job(Frequency::Daily, Some(0));

        let mut no_contract = new_job(Frequency::Daily, Some(3));
        no_contract.asset = Asset {
            is_native: false,
            contract_address: None,
            decimals: 6,
            symbol: "USDC".to_string(),
        };

        let mut wrong_precision = new_job(Frequency::Daily, Some(3));
        wrong_precision.asset = Asset::native("ETH", 6);

        let mut precise = new_job(Frequency::Daily, Some(3));
        precise.asset = Asset::token("USDC", TOKEN_CONTRACT, 6);
        precise.amount = dec!(1.0000001);

        for (job, expected) in [
            (bad_address, "InvalidAddress"),
            (zero_amount, "NonPositiveAmount"),
            (past, "ScheduleInPast"),
            (zero_max, "InvalidMaxExecutions"),
            (no_contract, "MissingContractAddress"),
            (precise, "TooManyDecimals"),
            (wrong_precision, "NativeAssetMismatch"),
        ] {
            let err = service.create_job(job).await.unwrap_err();
            let AppError::Validation(validation) = err else {
                panic!("expected validation error for {}", expected);
            };
            assert!(format!("{:?}", validation).starts_with(expected), "{:?}", validation);
        }

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_preview_lists_occurrences_and_totals() {
        let service = job_service(Arc::new(MemoryJobStore::new()));
        let job = new_job(Frequency::Weekly, Some(4));
        let preview = service.preview_job(&job).await.unwrap();

        assert_eq!(preview.occurrences.len(), 4);
        assert_eq!(preview.occurrences[1], job.scheduled_for + Duration::weeks(1));
        assert_eq!(preview.total_amount, dec!(6.0));
        assert_eq!(
            preview.total_fees_in_asset,
            preview.fee_quote.cost_in_asset * dec!(4)
        );
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_guarded() {
        let store = Arc::new(MemoryJobStore::new());
        let service = job_service(store.clone());
        let job = service.create_job(new_job(Frequency::Daily, Some(3))).await.unwrap();

        let cancelled = service.cancel_job(&job.schedule_id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.next_execution.is_none());
        assert!(cancelled.check_invariants().is_ok());
        assert!(service.cancel_job(&job.schedule_id).await.is_ok());

        let other = service.create_job(new_job(Frequency::Daily, Some(3))).await.unwrap();
        store
            .force_update(&other.schedule_id, &JobPatch::claim("executor-1", Utc::now()))
            .await
            .unwrap();
        assert!(matches!(
            service.cancel_job(&other.schedule_id).await,
            Err(AppError::Conflict(_))
        ));

        assert!(matches!(
            service.cancel_job("sched_missing").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_jobs_by_owner() {
        let service = job_service(Arc::new(MemoryJobStore::new()));
        service.create_job(new_job(Frequency::Daily, Some(2))).await.unwrap();
        service.create_job(new_job(Frequency::Once, None)).await.unwrap();

        let jobs = service.list_jobs(&OWNER.to_lowercase()).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(service.list_jobs("not-an-address").await.is_err());
    }
}
