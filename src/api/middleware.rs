use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::types::API_KEY_HEADER;
use super::{ApiError, AppState};

/// Robot id resolved from the request's API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedRobot(pub String);

pub async fn require_robot_key(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let raw_key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string());

    let Some(raw_key) = raw_key.filter(|k| !k.is_empty()) else {
        return ApiError::new(StatusCode::UNAUTHORIZED, "Missing X-Api-Key header").into_response();
    };

    // Absent when the router runs without a socket, e.g. in tests.
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    match state.authenticator.verify(&raw_key, client_ip).await {
        Some(robot_id) => {
            req.extensions_mut().insert(AuthenticatedRobot(robot_id));
            next.run(req).await
        }
        None => {
            tracing::debug!(client_ip = ?client_ip, path = %req.uri().path(), "Rejected API key");
            ApiError::new(StatusCode::UNAUTHORIZED, "Invalid API key").into_response()
        }
    }
}
