use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::Utc;

use super::types::{AssignmentRequest, NodeOverrideRequest, RegisterRobotRequest};
use super::{ApiError, ApiResult, AppState, AuthenticatedRobot};
use crate::fleet::{NodeRobotOverride, Robot, RobotAssignment, RobotRegistration};

pub(super) async fn register(
    State(state): State<AppState>,
    Extension(AuthenticatedRobot(robot_id)): Extension<AuthenticatedRobot>,
    Json(body): Json<RegisterRobotRequest>,
) -> ApiResult<Json<Robot>> {
    let mut registration = RobotRegistration::new(robot_id, body.max_concurrent_jobs);
    if let Some(name) = body.name {
        registration.name = name;
    }
    if let Some(environment) = body.environment {
        registration.environment = environment;
    }
    registration.capabilities = body.capabilities;
    registration.tenant_id = body.tenant_id;

    // Keep the registry's view of the load current before capacity checks.
    let running = state.queue.running_counts().await?;
    let mut registry = state.registry.write().await;
    registry.sync_loads(&running);
    Ok(Json(registry.register(registration)?))
}

pub(super) async fn heartbeat(
    State(state): State<AppState>,
    Extension(AuthenticatedRobot(robot_id)): Extension<AuthenticatedRobot>,
) -> ApiResult<Json<Robot>> {
    Ok(Json(state.registry.write().await.heartbeat(&robot_id)?))
}

pub(super) async fn offline(
    State(state): State<AppState>,
    Extension(AuthenticatedRobot(robot_id)): Extension<AuthenticatedRobot>,
) -> ApiResult<Json<Robot>> {
    Ok(Json(state.registry.write().await.mark_offline(&robot_id)?))
}

pub(super) async fn list_robots(State(state): State<AppState>) -> Json<Vec<Robot>> {
    Json(state.registry.read().await.snapshot())
}

pub(super) async fn put_assignment(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(body): Json<AssignmentRequest>,
) -> ApiResult<Json<RobotAssignment>> {
    let assignment = RobotAssignment::new(
        workflow_id,
        body.robot_id,
        body.is_default,
        body.priority,
        Utc::now(),
    )?;
    let mut store = state.assignments.write().await;
    if assignment.is_default {
        store.set_default(assignment.clone())?;
    } else {
        store.assign(assignment.clone())?;
    }
    Ok(Json(assignment))
}

pub(super) async fn list_assignments(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Json<Vec<RobotAssignment>> {
    Json(state.assignments.read().await.assignments_for(&workflow_id))
}

pub(super) async fn delete_assignment(
    State(state): State<AppState>,
    Path((workflow_id, robot_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if state
        .assignments
        .write()
        .await
        .unassign(&workflow_id, &robot_id)
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "workflow {workflow_id} has no assignment for robot {robot_id}"
        )))
    }
}

pub(super) async fn put_node_override(
    State(state): State<AppState>,
    Path((workflow_id, node_id)): Path<(String, String)>,
    Json(body): Json<NodeOverrideRequest>,
) -> ApiResult<Json<NodeRobotOverride>> {
    let node_override =
        NodeRobotOverride::new(workflow_id, node_id, body.robot_id, body.priority, Utc::now())?;
    state
        .assignments
        .write()
        .await
        .set_node_override(node_override.clone());
    Ok(Json(node_override))
}

pub(super) async fn delete_node_override(
    State(state): State<AppState>,
    Path((workflow_id, node_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if state
        .assignments
        .write()
        .await
        .remove_node_override(&workflow_id, &node_id)
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "no override for node {node_id} of workflow {workflow_id}"
        )))
    }
}
