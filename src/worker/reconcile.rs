// Post-execution write-back of confirmed transfers and terminal failures

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{ReconciliationError, StoreError};
use crate::execution::TransferReceipt;
use crate::jobs::models::{JobPatch, JobStatus, ScheduledJob, UpdateGuard};
use crate::jobs::store::JobStore;
use crate::recurrence::{outcome_after_execution, RecurrenceOutcome};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Conditional (expected `processing`) write attempts
    pub conditional_attempts: u32,
    /// Unconditional write attempts once conditional writes are exhausted
    pub forced_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            conditional_attempts: 3,
            forced_attempts: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl ReconcileConfig {
    /// Exponential backoff with up to 50% random jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() / 2) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Write back a confirmed execution.
///
/// Escalates from a conditional update with backoff to a forced update.
/// If every attempt fails the error is an operational alarm; the job is
/// never marked failed for it.
pub async fn record_success(
    store: &dyn JobStore,
    job: &ScheduledJob,
    receipt: &TransferReceipt,
    config: &ReconcileConfig,
) -> Result<RecurrenceOutcome, ReconciliationError> {
    let outcome = outcome_after_execution(job);
    let patch = JobPatch::executed(
        outcome.status,
        outcome.execution_count,
        outcome.next_execution,
        receipt.confirmed_at,
        &receipt.tx_hash,
    );
    let guard = UpdateGuard::status(JobStatus::Processing);
    let mut attempts = 0;

    for attempt in 0..config.conditional_attempts {
        attempts += 1;
        match store.conditional_update(&job.schedule_id, &guard, &patch).await {
            Ok(true) => {
                info!(
                    "Recorded execution {} of {} (tx {}, status {})",
                    outcome.execution_count, job.schedule_id, receipt.tx_hash, outcome.status
                );
                return Ok(outcome);
            }
            Ok(false) => {
                // Left `processing` under us; the same guard cannot match again
                warn!(
                    "Job {} no longer processing, escalating to forced write",
                    job.schedule_id
                );
                break;
            }
            Err(e) => {
                warn!(
                    "Conditional write for {} failed (attempt {}): {}",
                    job.schedule_id, attempt + 1, e
                );
                if attempt + 1 < config.conditional_attempts {
                    tokio::time::sleep(config.backoff(attempt)).await;
                }
            }
        }
    }

    for attempt in 0..config.forced_attempts {
        attempts += 1;
        match store.force_update(&job.schedule_id, &patch).await {
            Ok(true) => {
                warn!(
                    "Recorded execution of {} with forced write (tx {})",
                    job.schedule_id, receipt.tx_hash
                );
                return Ok(outcome);
            }
            Ok(false) => {
                error!("Job {} vanished before its execution was recorded", job.schedule_id);
                break;
            }
            Err(e) => {
                warn!(
                    "Forced write for {} failed (attempt {}): {}",
                    job.schedule_id, attempt + 1, e
                );
                if attempt + 1 < config.forced_attempts {
                    tokio::time::sleep(config.backoff(attempt)).await;
                }
            }
        }
    }

    error!(
        "🚨 RECONCILIATION FAILURE: {} executed on-chain as {} but the job record was not updated",
        job.schedule_id, receipt.tx_hash
    );
    Err(ReconciliationError::WriteFailure {
        schedule_id: job.schedule_id.clone(),
        tx_hash: receipt.tx_hash.clone(),
        attempts,
    })
}

/// Mark a claimed job permanently failed. Unconditional; the claim already
/// established ownership.
pub async fn record_failure(
    store: &dyn JobStore,
    schedule_id: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let written = store
        .force_update(schedule_id, &JobPatch::failed(message, now))
        .await?;
    if written {
        warn!("❌ Job {} failed: {}", schedule_id, message);
    }
    Ok(written)
}
