use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::models::{JobPatch, ScheduledJob, UpdateGuard};
use crate::error::StoreError;

/// Job store - the only shared mutable resource between executors
///
/// INVARIANTS:
/// - Every mutation is a single-record update
/// - `conditional_update` is atomic: the guard check and the write happen as one step
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Active jobs due at or before `now + tolerance`, oldest due first
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        tolerance: Duration,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Apply `patch` only if the job currently satisfies `guard`.
    /// Returns false when the guard did not match or the job is missing.
    async fn conditional_update(
        &self,
        schedule_id: &str,
        guard: &UpdateGuard,
        patch: &JobPatch,
    ) -> Result<bool, StoreError>;

    /// Apply `patch` regardless of current state. Returns false if the job is missing.
    async fn force_update(&self, schedule_id: &str, patch: &JobPatch) -> Result<bool, StoreError>;

    async fn insert(&self, job: &ScheduledJob) -> Result<(), StoreError>;

    async fn get(&self, schedule_id: &str) -> Result<Option<ScheduledJob>, StoreError>;

    /// Jobs of one owner, newest first
    async fn list_by_owner(&self, owner_address: &str) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Jobs stuck in Processing since before `older_than`
    async fn find_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, StoreError>;
}
