use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use super::types::{fleet_counts, IssueKeyRequest, StatsResponse};
use super::{ApiError, ApiResult, AppState};
use crate::auth::IssuedKey;

pub(super) async fn stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let jobs = state.queue.counts().await?;
    let robots = {
        let registry = state.registry.read().await;
        fleet_counts(&registry.snapshot(), registry.available_slots())
    };
    Ok(Json(StatsResponse { jobs, robots }))
}

/// Domain events as server-sent events, one `event:` per variant name.
pub(super) async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|item| {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(error = %e, "Event subscriber lagged");
                return None;
            }
        };
        match Event::default().event(event.name()).json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode event");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub(super) async fn issue_key(
    State(state): State<AppState>,
    Json(body): Json<IssueKeyRequest>,
) -> ApiResult<(StatusCode, Json<IssuedKey>)> {
    let issued = match body.raw_key {
        Some(raw_key) => {
            let key = state
                .authenticator
                .import_key(&body.robot_id, &raw_key)
                .await?;
            IssuedKey {
                key_id: key.id,
                robot_id: key.robot_id,
                raw_key,
                expires_at: key.expires_at,
            }
        }
        None => {
            let ttl = body.ttl_seconds.map(key_ttl).transpose()?;
            state.authenticator.issue_key(&body.robot_id, ttl).await?
        }
    };
    Ok((StatusCode::CREATED, Json(issued)))
}

fn key_ttl(secs: u64) -> ApiResult<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| ApiError::bad_request(format!("ttl_seconds {secs} is out of range")))
}

pub(super) async fn revoke_key(
    State(state): State<AppState>,
    Path(key_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if state.authenticator.revoke(key_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("API key {key_id} not found")))
    }
}
