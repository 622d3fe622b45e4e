//! Read-only inspection handlers.
//!
//! Each handler reads via `StateStore` or `Allocator` and returns JSON
//! wrapped in [`ApiResponse`].

use arena_core::ResourceRequirement;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Servers ────────────────────────────────────────────────────

/// GET /api/v1/servers
pub async fn list_servers(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_workloads() {
        Ok(workloads) => ApiResponse::ok(workloads).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/servers/{id}
pub async fn get_server(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_workload(&id) {
        Ok(Some(workload)) => ApiResponse::ok(workload).into_response(),
        Ok(None) => error_response("server not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/servers/{id}/ports
pub async fn server_ports(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_workload(&id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response("server not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    }
    match state.allocator.server_ports(&id) {
        Ok(ports) => ApiResponse::ok(ports).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// One node of the ledger as exposed over the API.
#[derive(Debug, serde::Serialize)]
pub struct NodeView {
    pub name: String,
    pub ip: String,
    pub capacity: ResourceRequirement,
    pub reserved: ResourceRequirement,
    pub free: ResourceRequirement,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub free_ports: usize,
    pub workloads: usize,
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.allocator.node_usage() {
        Ok(usage) => {
            let nodes: Vec<NodeView> = usage
                .iter()
                .map(|node| NodeView {
                    name: node.name.clone(),
                    ip: node.ip.clone(),
                    capacity: node.capacity,
                    reserved: node.reserved,
                    free: node.free(),
                    port_range_start: node.port_range_start,
                    port_range_end: node.port_range_end,
                    free_ports: node.free_port_count(),
                    workloads: node.workloads,
                })
                .collect();
            ApiResponse::ok(nodes).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}
