use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::{prelude::FromRow, types::Json, PgPool, Postgres, QueryBuilder};
use std::str::FromStr;
use tracing::info;

use super::models::*;
use super::store::JobStore;
use crate::error::StoreError;

const JOB_COLUMNS: &str = r#"
    schedule_id, owner_address, recipient_address, asset, amount, frequency,
    scheduled_for, next_execution, execution_count, max_executions, status,
    processing_by, processing_started, last_error, failed_at, created_at,
    last_execution_at, last_transaction_hash, cancelled_at
"#;

/// Postgres-backed job store - one row per job
pub struct PgJobStore {
    pub pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("🔄 Running job store migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn apply_patch(
        &self,
        schedule_id: &str,
        guard: Option<&UpdateGuard>,
        patch: &JobPatch,
    ) -> Result<bool, StoreError> {
        if *patch == JobPatch::default() {
            return Ok(false);
        }
        let result = update_query(schedule_id, guard, patch)
            .build()
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// `UPDATE` for a non-empty patch; a guard adds its conditions to the `WHERE` clause
fn update_query(
    schedule_id: &str,
    guard: Option<&UpdateGuard>,
    patch: &JobPatch,
) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::<Postgres>::new("UPDATE scheduled_jobs SET ");
    {
        let mut set = query.separated(", ");
        if let Some(status) = patch.status {
            set.push("status = ").push_bind_unseparated(status.as_str());
        }
        if let Some(next_execution) = patch.next_execution {
            set.push("next_execution = ").push_bind_unseparated(next_execution);
        }
        if let Some(count) = patch.execution_count {
            set.push("execution_count = ").push_bind_unseparated(count as i32);
        }
        if let Some(processing_by) = &patch.processing_by {
            set.push("processing_by = ").push_bind_unseparated(processing_by.clone());
        }
        if let Some(processing_started) = patch.processing_started {
            set.push("processing_started = ").push_bind_unseparated(processing_started);
        }
        if let Some(last_error) = &patch.last_error {
            set.push("last_error = ").push_bind_unseparated(last_error.clone());
        }
        if let Some(failed_at) = patch.failed_at {
            set.push("failed_at = ").push_bind_unseparated(failed_at);
        }
        if let Some(last_execution_at) = patch.last_execution_at {
            set.push("last_execution_at = ").push_bind_unseparated(last_execution_at);
        }
        if let Some(tx_hash) = &patch.last_transaction_hash {
            set.push("last_transaction_hash = ").push_bind_unseparated(tx_hash.clone());
        }
        if let Some(cancelled_at) = patch.cancelled_at {
            set.push("cancelled_at = ").push_bind_unseparated(cancelled_at);
        }
    }

    query.push(" WHERE schedule_id = ").push_bind(schedule_id.to_string());
    if let Some(guard) = guard {
        query
            .push(" AND status = ")
            .push_bind(guard.expected_status.as_str());
        if let Some(due_by) = guard.due_by {
            query
                .push(" AND COALESCE(next_execution, scheduled_for) <= ")
                .push_bind(due_by);
        }
    }
    query
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        tolerance: Duration,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM scheduled_jobs
            WHERE status = 'active' AND COALESCE(next_execution, scheduled_for) <= $1
            ORDER BY COALESCE(next_execution, scheduled_for) ASC
            LIMIT $2
            "#
        ))
        .bind(now + tolerance)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ScheduledJob::try_from).collect()
    }

    async fn conditional_update(
        &self,
        schedule_id: &str,
        guard: &UpdateGuard,
        patch: &JobPatch,
    ) -> Result<bool, StoreError> {
        guard.permits(patch)?;
        self.apply_patch(schedule_id, Some(guard), patch).await
    }

    async fn force_update(&self, schedule_id: &str, patch: &JobPatch) -> Result<bool, StoreError> {
        self.apply_patch(schedule_id, None, patch).await
    }

    async fn insert(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO scheduled_jobs ({JOB_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#
        ))
        .bind(&job.schedule_id)
        .bind(&job.owner_address)
        .bind(&job.recipient_address)
        .bind(Json(&job.asset))
        .bind(job.amount.to_string())
        .bind(job.frequency.as_str())
        .bind(job.scheduled_for)
        .bind(job.next_execution)
        .bind(job.execution_count as i32)
        .bind(job.max_executions as i32)
        .bind(job.status.as_str())
        .bind(&job.processing_by)
        .bind(job.processing_started)
        .bind(&job.last_error)
        .bind(job.failed_at)
        .bind(job.created_at)
        .bind(job.last_execution_at)
        .bind(&job.last_transaction_hash)
        .bind(job.cancelled_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(job.schedule_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, schedule_id: &str) -> Result<Option<ScheduledJob>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE schedule_id = $1"
        ))
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ScheduledJob::try_from).transpose()
    }

    async fn list_by_owner(&self, owner_address: &str) -> Result<Vec<ScheduledJob>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM scheduled_jobs
            WHERE LOWER(owner_address) = LOWER($1)
            ORDER BY created_at DESC
            "#
        ))
        .bind(owner_address)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ScheduledJob::try_from).collect()
    }

    async fn find_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM scheduled_jobs
            WHERE status = 'processing' AND processing_started < $1
            "#
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ScheduledJob::try_from).collect()
    }
}

/// Raw database row
#[derive(Debug, FromRow)]
struct JobRow {
    schedule_id: String,
    owner_address: String,
    recipient_address: String,
    asset: Json<Asset>,
    amount: String,
    frequency: String,
    scheduled_for: DateTime<Utc>,
    next_execution: Option<DateTime<Utc>>,
    execution_count: i32,
    max_executions: i32,
    status: String,
    processing_by: Option<String>,
    processing_started: Option<DateTime<Utc>>,
    last_error: Option<String>,
    failed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    last_execution_at: Option<DateTime<Utc>>,
    last_transaction_hash: Option<String>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for ScheduledJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |message: String| StoreError::Corrupt {
            schedule_id: row.schedule_id.clone(),
            message,
        };

        let amount = Decimal::from_str(&row.amount)
            .map_err(|e| corrupt(format!("invalid amount {}: {}", row.amount, e)))?;
        let frequency = Frequency::from_str(&row.frequency).map_err(|e| corrupt(e.to_string()))?;
        let status = JobStatus::from_str(&row.status).map_err(corrupt)?;
        let execution_count = u32::try_from(row.execution_count)
            .map_err(|_| corrupt(format!("negative execution_count {}", row.execution_count)))?;
        let max_executions = u32::try_from(row.max_executions)
            .map_err(|_| corrupt(format!("negative max_executions {}", row.max_executions)))?;

        Ok(ScheduledJob {
            schedule_id: row.schedule_id,
            owner_address: row.owner_address,
            recipient_address: row.recipient_address,
            asset: row.asset.0,
            amount,
            frequency,
            scheduled_for: row.scheduled_for,
            next_execution: row.next_execution,
            execution_count,
            max_executions,
            status,
            processing_by: row.processing_by,
            processing_started: row.processing_started,
            last_error: row.last_error,
            failed_at: row.failed_at,
            created_at: row.created_at,
            last_execution_at: row.last_execution_at,
            last_transaction_hash: row.last_transaction_hash,
            cancelled_at: row.cancelled_at,
        })
    }
}
