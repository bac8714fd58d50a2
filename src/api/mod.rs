//! HTTP surface.
//!
//! Robot-facing routes sit behind the `X-Api-Key` middleware; operator
//! routes (submission, inspection, routing rules, key management) do not.

mod admin;
mod fleet;
mod jobs;
mod middleware;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::RobotAuthenticator;
use crate::config::LeaseConfig;
use crate::error::OrchestratorError;
use crate::fleet::{AffinityMode, AssignmentStore, RobotRegistry};
use crate::scheduler::{EventBus, JobQueue};

pub use middleware::AuthenticatedRobot;
use types::ErrorBody;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub registry: Arc<RwLock<RobotRegistry>>,
    pub assignments: Arc<RwLock<AssignmentStore>>,
    pub authenticator: RobotAuthenticator,
    pub events: EventBus,
    pub lease: LeaseConfig,
    pub affinity_mode: AffinityMode,
}

/// An error on its way out as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::JobNotFound(_) | OrchestratorError::RobotNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            OrchestratorError::DuplicateJobAssignment { .. }
            | OrchestratorError::InvalidJobState { .. }
            | OrchestratorError::InvalidRobotState { .. }
            | OrchestratorError::DuplicateAssignment(_)
            | OrchestratorError::RobotAtCapacity { .. } => StatusCode::CONFLICT,
            OrchestratorError::Validation(_) | OrchestratorError::InvalidAssignment(_) => {
                StatusCode::BAD_REQUEST
            }
            OrchestratorError::Unauthorized => StatusCode::UNAUTHORIZED,
            OrchestratorError::QueueFull(_)
            | OrchestratorError::NoAvailableRobot
            | OrchestratorError::RobotUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Http(_)
            | OrchestratorError::Api { .. }
            | OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let robot_routes = Router::new()
        .route("/api/v1/jobs/claim", post(jobs::claim))
        .route("/api/v1/jobs/{id}/extend-lease", post(jobs::extend_lease))
        .route("/api/v1/jobs/{id}/complete", post(jobs::complete))
        .route("/api/v1/jobs/{id}/fail", post(jobs::fail))
        .route("/api/v1/robots/register", post(fleet::register))
        .route("/api/v1/robots/heartbeat", post(fleet::heartbeat))
        .route("/api/v1/robots/offline", post(fleet::offline))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_robot_key,
        ));

    let operator_routes = Router::new()
        .route("/api/v1/jobs", post(jobs::submit).get(jobs::list))
        .route("/api/v1/jobs/{id}", get(jobs::get_job))
        .route("/api/v1/robots", get(fleet::list_robots))
        .route("/api/v1/stats", get(admin::stats))
        .route("/api/v1/events", get(admin::events))
        .route(
            "/api/v1/workflows/{workflow_id}/assignments",
            put(fleet::put_assignment).get(fleet::list_assignments),
        )
        .route(
            "/api/v1/workflows/{workflow_id}/assignments/{robot_id}",
            delete(fleet::delete_assignment),
        )
        .route(
            "/api/v1/workflows/{workflow_id}/nodes/{node_id}/override",
            put(fleet::put_node_override).delete(fleet::delete_node_override),
        )
        .route("/api/v1/admin/api-keys", post(admin::issue_key))
        .route("/api/v1/admin/api-keys/{key_id}", delete(admin::revoke_key));

    robot_routes
        .merge(operator_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "HTTP API listening");
    }
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}
