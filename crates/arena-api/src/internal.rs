//! Supervisor reporting handlers.
//!
//! Both routes are bearer-authenticated and only write the workload's
//! `process` fields through `update_workload`, which preserves `status`.

use arena_core::{HeartbeatReport, StatusReport};
use arena_state::epoch_secs;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use tracing::{debug, warn};

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response};

/// Whether the request carries `Authorization: Bearer <internal token>`.
fn authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|presented| !token.is_empty() && tokens_match(presented.trim(), token))
}

/// Compares every byte regardless of where the first mismatch is.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let (presented, expected) = (presented.as_bytes(), expected.as_bytes());
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

/// POST /internal/servers/{id}/status
pub async fn report_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(report): Json<StatusReport>,
) -> impl IntoResponse {
    if !authorized(&headers, &state.internal_token) {
        warn!(workload_id = %id, "status report with bad credentials");
        return error_response("unauthorized", StatusCode::UNAUTHORIZED).into_response();
    }
    if report.status.trim().is_empty() {
        return error_response("status must not be empty", StatusCode::BAD_REQUEST)
            .into_response();
    }

    let now = epoch_secs();
    let result = state.store.update_workload(&id, |w| {
        w.process.status = Some(report.status.clone());
        w.process.message = report.message.clone();
        if report.process_pid.is_some() {
            w.process.pid = report.process_pid;
        }
        w.process.reported_at = Some(now);
    });
    match result {
        Ok(true) => {
            debug!(workload_id = %id, status = %report.status, "process status reported");
            ApiResponse::ok("recorded").into_response()
        }
        Ok(false) => error_response("server not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /internal/servers/{id}/heartbeat
pub async fn report_heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(heartbeat): Json<HeartbeatReport>,
) -> impl IntoResponse {
    if !authorized(&headers, &state.internal_token) {
        warn!(workload_id = %id, "heartbeat with bad credentials");
        return error_response("unauthorized", StatusCode::UNAUTHORIZED).into_response();
    }

    let now = epoch_secs();
    let result = state.store.update_workload(&id, |w| {
        w.process.pid = Some(heartbeat.process_pid);
        w.process.memory_mb = heartbeat.memory_mb;
        w.process.cpu_percent = heartbeat.cpu_percent;
        w.process.last_heartbeat_at = Some(now);
    });
    match result {
        Ok(true) => ApiResponse::ok("recorded").into_response(),
        Ok(false) => error_response("server not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}
