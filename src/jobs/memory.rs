use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use super::models::{JobPatch, JobStatus, ScheduledJob, UpdateGuard};
use super::store::JobStore;
use crate::error::StoreError;

/// In-process job store. The mutex makes each guard check and write one atomic step,
/// which is what lets several executor loops share it safely.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, ScheduledJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        tolerance: Duration,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let jobs = self.jobs.lock();
        let mut due: Vec<ScheduledJob> = jobs
            .values()
            .filter(|job| job.is_due(now, tolerance))
            .cloned()
            .collect();
        due.sort_by_key(|job| job.due_at());
        due.truncate(limit);
        Ok(due)
    }

    async fn conditional_update(
        &self,
        schedule_id: &str,
        guard: &UpdateGuard,
        patch: &JobPatch,
    ) -> Result<bool, StoreError> {
        guard.permits(patch)?;
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(schedule_id) {
            Some(job) if guard.matches(job) => {
                patch.apply(job);
                Ok(true)
            }
            Some(job) => {
                debug!(
                    "Guard rejected update of {} (status {}, expected {})",
                    schedule_id, job.status, guard.expected_status
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn force_update(&self, schedule_id: &str, patch: &JobPatch) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(schedule_id) {
            Some(job) => {
                patch.apply(job);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.schedule_id) {
            return Err(StoreError::Duplicate(job.schedule_id.clone()));
        }
        jobs.insert(job.schedule_id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, schedule_id: &str) -> Result<Option<ScheduledJob>, StoreError> {
        Ok(self.jobs.lock().get(schedule_id).cloned())
    }

    async fn list_by_owner(&self, owner_address: &str) -> Result<Vec<ScheduledJob>, StoreError> {
        let jobs = self.jobs.lock();
        let mut owned: Vec<ScheduledJob> = jobs
            .values()
            .filter(|job| job.owner_address.eq_ignore_ascii_case(owner_address))
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }

    async fn find_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let jobs = self.jobs.lock();
        Ok(jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.processing_started.map_or(false, |t| t < older_than)
            })
            .cloned()
            .collect())
    }
}
