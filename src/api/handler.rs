use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use validator::Validate;

use super::models::*;
use crate::error::AppResult;
use crate::jobs::{JobPreview, JobService, ScheduledJob};

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobService>,
}

/// Schedule a transfer
/// POST /api/v1/jobs
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> AppResult<(StatusCode, Json<CreateJobResponse>)> {
    request.validate()?;
    let new_job = request.into_new_job(&state.jobs.native_asset())?;
    info!(
        "Creating {} job for {} ({} {})",
        new_job.frequency, new_job.owner_address, new_job.amount, new_job.asset.symbol
    );

    let job = state.jobs.create_job(new_job).await?;
    Ok((StatusCode::CREATED, Json(CreateJobResponse::from(job))))
}

/// Fee quote and execution dates for a prospective job
/// POST /api/v1/jobs/preview
pub async fn preview_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> AppResult<Json<JobPreview>> {
    request.validate()?;
    let new_job = request.into_new_job(&state.jobs.native_asset())?;
    Ok(Json(state.jobs.preview_job(&new_job).await?))
}

/// GET /api/v1/jobs/:schedule_id
pub async fn get_job(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> AppResult<Json<ScheduledJob>> {
    Ok(Json(state.jobs.get_job(&schedule_id).await?))
}

/// POST /api/v1/jobs/:schedule_id/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(schedule_id): Path<String>,
) -> AppResult<Json<ScheduledJob>> {
    info!("Cancel requested for {}", schedule_id);
    Ok(Json(state.jobs.cancel_job(&schedule_id).await?))
}

/// GET /api/v1/jobs?owner=0x..
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> AppResult<Json<JobListResponse>> {
    let jobs = state.jobs.list_jobs(&query.owner).await?;
    Ok(Json(JobListResponse {
        owner_address: query.owner,
        count: jobs.len(),
        jobs,
    }))
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}
