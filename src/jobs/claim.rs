use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument};

use super::models::{JobPatch, JobStatus, ScheduledJob, UpdateGuard};
use super::store::JobStore;
use crate::error::StoreError;

/// Result of a claim attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This claimant now owns the job; carries the record as written
    Claimed(ScheduledJob),
    NotDue,
    AlreadyClaimed,
    NotFound,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}

/// Atomically move a due job from Active to Processing.
///
/// SECURITY: This conditional update is the sole mutual-exclusion mechanism.
/// Of any number of concurrent callers, at most one observes `Claimed`.
#[instrument(skip(store, tolerance), fields(schedule_id = %schedule_id, claimant = %claimant_id))]
pub async fn claim(
    store: &dyn JobStore,
    schedule_id: &str,
    claimant_id: &str,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<ClaimOutcome, StoreError> {
    let guard = UpdateGuard::due(JobStatus::Active, now + tolerance);
    let patch = JobPatch::claim(claimant_id, now);

    if store.conditional_update(schedule_id, &guard, &patch).await? {
        // Re-read so the caller works from the stored record
        let job = store.get(schedule_id).await?;
        return Ok(match job {
            Some(job) => {
                info!("Claimed job {} (due {})", schedule_id, job.due_at());
                ClaimOutcome::Claimed(job)
            }
            None => ClaimOutcome::NotFound,
        });
    }

    // The update was rejected; classify why
    let outcome = match store.get(schedule_id).await? {
        None => ClaimOutcome::NotFound,
        Some(job) if job.status != JobStatus::Active => ClaimOutcome::AlreadyClaimed,
        Some(_) => ClaimOutcome::NotDue,
    };
    debug!("Claim of {} rejected: {:?}", schedule_id, outcome);
    Ok(outcome)
}
