use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use uuid::Uuid;

use super::types::{
    ClaimJobsRequest, ClaimJobsResponse, CompleteJobRequest, CompleteJobResponse,
    ExtendLeaseRequest, ExtendLeaseResponse, FailJobRequest, FailJobResponse, JobListQuery,
    SubmitJobResponse,
};
use super::{ApiError, ApiResult, AppState, AuthenticatedRobot};
use crate::config::LeaseConfig;
use crate::scheduler::{ClaimRequest, ClaimRouting, Job, JobSpec, JobStatus};

/// Lease length in seconds, bounded by the configured maximum.
fn lease_seconds(lease: &LeaseConfig, requested: Option<u64>) -> ApiResult<i64> {
    let seconds = requested.unwrap_or(lease.visibility_timeout_secs);
    if seconds == 0 || seconds > lease.max_extension_secs {
        return Err(ApiError::bad_request(format!(
            "lease must be between 1 and {} seconds, got {}",
            lease.max_extension_secs, seconds
        )));
    }
    Ok(seconds as i64)
}

/// A claim doubles as a heartbeat, so robots that poll faster than they
/// heartbeat stay alive. Jobs routed to another robot are left for it.
pub(super) async fn claim(
    State(state): State<AppState>,
    Extension(AuthenticatedRobot(robot_id)): Extension<AuthenticatedRobot>,
    Json(body): Json<ClaimJobsRequest>,
) -> ApiResult<Response> {
    let (robot, fleet) = {
        let mut registry = state.registry.write().await;
        let robot = registry.heartbeat(&robot_id)?;
        registry.sweep_liveness();
        (robot, registry.snapshot())
    };
    let seconds = lease_seconds(&state.lease, body.visibility_timeout_seconds)?;
    let limit = body
        .limit
        .unwrap_or(1)
        .clamp(1, robot.max_concurrent_jobs as usize);
    let assignments = state.assignments.read().await.clone();

    let request = ClaimRequest {
        robot_id,
        capabilities: robot.capabilities,
        environment: body.environment.unwrap_or(robot.environment),
        tenant_id: robot.tenant_id,
        max_concurrent_jobs: robot.max_concurrent_jobs,
        limit,
        visibility_timeout: chrono::Duration::seconds(seconds),
        routing: Some(ClaimRouting::new(state.affinity_mode, assignments, fleet)),
    };
    let jobs = state.queue.claim_batch(&request).await?;

    if jobs.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(Json(ClaimJobsResponse { jobs }).into_response())
}

pub(super) async fn extend_lease(
    State(state): State<AppState>,
    Extension(AuthenticatedRobot(robot_id)): Extension<AuthenticatedRobot>,
    Path(job_id): Path<Uuid>,
    Json(body): Json<ExtendLeaseRequest>,
) -> ApiResult<Json<ExtendLeaseResponse>> {
    let seconds = lease_seconds(&state.lease, Some(body.extension_seconds))?;
    let extended = state
        .queue
        .extend_lease(job_id, &robot_id, chrono::Duration::seconds(seconds))
        .await?;
    Ok(Json(ExtendLeaseResponse { extended }))
}

pub(super) async fn complete(
    State(state): State<AppState>,
    Extension(AuthenticatedRobot(robot_id)): Extension<AuthenticatedRobot>,
    Path(job_id): Path<Uuid>,
    Json(body): Json<CompleteJobRequest>,
) -> ApiResult<Json<CompleteJobResponse>> {
    let status = state.queue.complete(job_id, &robot_id, body.result).await?;
    Ok(Json(CompleteJobResponse { status }))
}

pub(super) async fn fail(
    State(state): State<AppState>,
    Extension(AuthenticatedRobot(robot_id)): Extension<AuthenticatedRobot>,
    Path(job_id): Path<Uuid>,
    Json(body): Json<FailJobRequest>,
) -> ApiResult<Json<FailJobResponse>> {
    let outcome = state.queue.fail(job_id, &robot_id, body.error).await?;
    Ok(Json(outcome.into()))
}

pub(super) async fn submit(
    State(state): State<AppState>,
    Json(spec): Json<JobSpec>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let job_id = state.queue.submit(spec).await?;
    Ok((StatusCode::CREATED, Json(SubmitJobResponse { job_id })))
}

pub(super) async fn list(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    Ok(Json(state.queue.list(status).await?))
}

pub(super) async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.queue.get(job_id).await?))
}
