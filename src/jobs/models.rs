use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{StoreError, ValidationError};

/// How often a job repeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Once,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Once => "once",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Yearly => "yearly",
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Frequency::Once)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Frequency::Once),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            "yearly" => Ok(Frequency::Yearly),
            _ => Err(ValidationError::UnknownFrequency(s.to_string())),
        }
    }
}

/// Job status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    /// Valid transitions:
    /// - Active → Processing, Cancelled, Completed
    /// - Processing → Active, Completed, Failed
    /// - Terminal states (Completed, Cancelled, Failed) → NO TRANSITIONS ALLOWED
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        match self {
            JobStatus::Active => matches!(
                to,
                JobStatus::Processing | JobStatus::Cancelled | JobStatus::Completed
            ),
            JobStatus::Processing => matches!(
                to,
                JobStatus::Active | JobStatus::Completed | JobStatus::Failed
            ),
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobStatus::Active),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Asset being transferred (native coin or token contract)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub is_native: bool,
    /// Token contract address, `None` for the native asset
    pub contract_address: Option<String>,
    pub decimals: u32,
    pub symbol: String,
}

impl Asset {
    /// The ledger's native coin; `decimals` comes from the ledger config
    pub fn native(symbol: &str, decimals: u32) -> Self {
        Self {
            is_native: true,
            contract_address: None,
            decimals,
            symbol: symbol.to_string(),
        }
    }

    pub fn token(symbol: &str, contract_address: &str, decimals: u32) -> Self {
        Self {
            is_native: false,
            contract_address: Some(contract_address.to_string()),
            decimals,
            symbol: symbol.to_string(),
        }
    }

    /// Convert a human amount to integer base units (`amount * 10^decimals`)
    pub fn to_base_units(&self, amount: Decimal) -> Result<u128, ValidationError> {
        if amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount(amount.to_string()));
        }

        let normalized = amount.normalize();
        if normalized.scale() > self.decimals {
            return Err(ValidationError::TooManyDecimals {
                amount: amount.to_string(),
                decimals: self.decimals,
            });
        }

        // Decimal tops out at 28 digits, so scale through u128 rather than Decimal
        let mantissa = u128::try_from(normalized.mantissa())
            .map_err(|_| ValidationError::InvalidAmount(amount.to_string()))?;
        let exponent = self.decimals - normalized.scale();
        10u128
            .checked_pow(exponent)
            .and_then(|factor| mantissa.checked_mul(factor))
            .ok_or_else(|| ValidationError::InvalidAmount(amount.to_string()))
    }
}

/// Scheduled job entity - a persisted instruction to transfer a fixed amount
///
/// INVARIANTS:
/// - `processing_by`/`processing_started` are set iff status is Processing
/// - `next_execution` is None iff status is terminal
/// - `execution_count` only grows after a confirmed on-chain transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub schedule_id: String,
    pub owner_address: String,
    pub recipient_address: String,
    pub asset: Asset,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub frequency: Frequency,
    pub scheduled_for: DateTime<Utc>,
    pub next_execution: Option<DateTime<Utc>>,
    pub execution_count: u32,
    pub max_executions: u32,
    pub status: JobStatus,
    pub processing_by: Option<String>,
    pub processing_started: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub last_transaction_hash: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    pub fn generate_schedule_id() -> String {
        format!("sched_{}", Uuid::new_v4().simple())
    }

    /// Instant the job is next due
    pub fn due_at(&self) -> DateTime<Utc> {
        self.next_execution.unwrap_or(self.scheduled_for)
    }

    /// Check if the job may be claimed at `now` given the poll-ahead tolerance
    pub fn is_due(&self, now: DateTime<Utc>, tolerance: chrono::Duration) -> bool {
        self.status == JobStatus::Active && self.due_at() <= now + tolerance
    }

    /// Deterministic tag binding one execution of this schedule to its transaction
    pub fn idempotency_tag(&self, execution_index: u32) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.schedule_id.as_bytes());
        hasher.update(b":");
        hasher.update(execution_index.to_string().as_bytes());
        hasher.finalize().into()
    }

    pub fn idempotency_tag_hex(&self, execution_index: u32) -> String {
        format!("0x{}", hex::encode(self.idempotency_tag(execution_index)))
    }

    /// Check the structural invariants of the record
    pub fn check_invariants(&self) -> Result<(), String> {
        let processing_fields =
            self.processing_by.is_some() && self.processing_started.is_some();
        if (self.status == JobStatus::Processing) != processing_fields {
            return Err(format!(
                "processing fields inconsistent with status {}",
                self.status
            ));
        }
        if self.status.is_terminal() == self.next_execution.is_some() {
            return Err(format!(
                "next_execution inconsistent with status {}",
                self.status
            ));
        }
        if self.status == JobStatus::Failed && (self.last_error.is_none() || self.failed_at.is_none())
        {
            return Err("failed job without error details".to_string());
        }
        if self.execution_count > self.max_executions {
            return Err(format!(
                "execution_count {} exceeds max_executions {}",
                self.execution_count, self.max_executions
            ));
        }
        Ok(())
    }
}

/// Guard for a conditional store update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateGuard {
    pub expected_status: JobStatus,
    /// When set, the job must also be due at or before this instant
    pub due_by: Option<DateTime<Utc>>,
}

impl UpdateGuard {
    pub fn status(expected_status: JobStatus) -> Self {
        Self {
            expected_status,
            due_by: None,
        }
    }

    pub fn due(expected_status: JobStatus, due_by: DateTime<Utc>) -> Self {
        Self {
            expected_status,
            due_by: Some(due_by),
        }
    }

    pub fn matches(&self, job: &ScheduledJob) -> bool {
        job.status == self.expected_status
            && self.due_by.map_or(true, |due_by| job.due_at() <= due_by)
    }

    /// A guarded write may only move the status along an allowed transition
    pub fn permits(&self, patch: &JobPatch) -> Result<(), StoreError> {
        match patch.status {
            Some(to) if !self.expected_status.can_transition_to(to) => Err(StoreError::IllegalTransition {
                from: self.expected_status,
                to,
            }),
            _ => Ok(()),
        }
    }
}

/// Partial update of a job record.
///
/// Outer `None` leaves a field untouched; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub next_execution: Option<Option<DateTime<Utc>>>,
    pub execution_count: Option<u32>,
    pub processing_by: Option<Option<String>>,
    pub processing_started: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
    pub failed_at: Option<Option<DateTime<Utc>>>,
    pub last_execution_at: Option<Option<DateTime<Utc>>>,
    pub last_transaction_hash: Option<Option<String>>,
    pub cancelled_at: Option<Option<DateTime<Utc>>>,
}

impl JobPatch {
    /// Reserve the job for one executor
    pub fn claim(claimant_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            processing_by: Some(Some(claimant_id.to_string())),
            processing_started: Some(Some(now)),
            ..Default::default()
        }
    }

    /// Record a confirmed execution. `next_execution` of `None` means terminal.
    pub fn executed(
        status: JobStatus,
        execution_count: u32,
        next_execution: Option<DateTime<Utc>>,
        executed_at: DateTime<Utc>,
        tx_hash: &str,
    ) -> Self {
        Self {
            status: Some(status),
            next_execution: Some(next_execution),
            execution_count: Some(execution_count),
            processing_by: Some(None),
            processing_started: Some(None),
            last_execution_at: Some(Some(executed_at)),
            last_transaction_hash: Some(Some(tx_hash.to_string())),
            ..Default::default()
        }
    }

    /// Terminal failure
    pub fn failed(error: &str, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            next_execution: Some(None),
            processing_by: Some(None),
            processing_started: Some(None),
            last_error: Some(Some(error.to_string())),
            failed_at: Some(Some(now)),
            ..Default::default()
        }
    }

    pub fn cancelled(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            next_execution: Some(None),
            cancelled_at: Some(Some(now)),
            ..Default::default()
        }
    }

    pub fn apply(&self, job: &mut ScheduledJob) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(next_execution) = self.next_execution {
            job.next_execution = next_execution;
        }
        if let Some(count) = self.execution_count {
            job.execution_count = count;
        }
        if let Some(processing_by) = &self.processing_by {
            job.processing_by = processing_by.clone();
        }
        if let Some(processing_started) = self.processing_started {
            job.processing_started = processing_started;
        }
        if let Some(last_error) = &self.last_error {
            job.last_error = last_error.clone();
        }
        if let Some(failed_at) = self.failed_at {
            job.failed_at = failed_at;
        }
        if let Some(last_execution_at) = self.last_execution_at {
            job.last_execution_at = last_execution_at;
        }
        if let Some(tx_hash) = &self.last_transaction_hash {
            job.last_transaction_hash = tx_hash.clone();
        }
        if let Some(cancelled_at) = self.cancelled_at {
            job.cancelled_at = cancelled_at;
        }
    }
}
