//! arena-api: HTTP surface of the Arena control plane.
//!
//! Two groups of routes share one router:
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/servers` | List all workloads |
//! | GET | `/api/v1/servers/{id}` | Get one workload |
//! | GET | `/api/v1/servers/{id}/ports` | Host ports bound to a workload |
//! | GET | `/api/v1/nodes` | Node ledger with free capacity |
//! | POST | `/internal/servers/{id}/status` | Supervisor status report |
//! | POST | `/internal/servers/{id}/heartbeat` | Supervisor heartbeat |
//! | GET | `/healthz` | Daemon liveness |
//!
//! The `/internal` routes require `Authorization: Bearer <token>` matching
//! the daemon's internal token. Reports land in the workload's process
//! fields and never touch `status`.

pub mod handlers;
pub mod internal;

use std::sync::Arc;

use arena_allocator::Allocator;
use arena_state::StateStore;
use axum::Router;
use axum::routing::{get, post};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub allocator: Allocator,
    /// Bearer token supervisors present on `/internal` routes.
    pub internal_token: Arc<str>,
}

impl ApiState {
    pub fn new(store: StateStore, allocator: Allocator, internal_token: &str) -> Self {
        Self {
            store,
            allocator,
            internal_token: Arc::from(internal_token),
        }
    }
}

/// Build the complete router (inspection + internal reporting).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/servers", get(handlers::list_servers))
        .route("/servers/{id}", get(handlers::get_server))
        .route("/servers/{id}/ports", get(handlers::server_ports))
        .route("/nodes", get(handlers::list_nodes))
        .with_state(state.clone());

    let internal_routes = Router::new()
        .route("/servers/{id}/status", post(internal::report_status))
        .route("/servers/{id}/heartbeat", post(internal::report_heartbeat))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/internal", internal_routes)
        .route("/healthz", get(|| async { "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_core::ResourceRequirement;
    use arena_state::{NodeCapacity, Workload, WorkloadStatus};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret";

    fn state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let allocator = Allocator::new(store.clone());
        allocator
            .sync_nodes(&[NodeCapacity {
                name: "node-a".to_string(),
                ip: "10.0.0.1".to_string(),
                capacity: ResourceRequirement::new(4000, 8 << 30),
                port_range_start: 7000,
                port_range_end: 7009,
            }])
            .unwrap();
        store
            .insert_workload(&Workload::new("w1", "u1", "minecraft", "small", 100))
            .unwrap();
        ApiState::new(store, allocator, TOKEN)
    }

    fn post_json(uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz() {
        let app = build_router(state());
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_servers_through_router() {
        let app = build_router(state());
        let response = app
            .oneshot(Request::get("/api/v1/servers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"][0]["id"], "w1");
    }

    #[tokio::test]
    async fn status_report_requires_token() {
        let app = build_router(state());
        let response = app
            .oneshot(post_json(
                "/internal/servers/w1/status",
                None,
                r#"{"status":"running"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_report_rejects_wrong_token() {
        let app = build_router(state());
        let response = app
            .oneshot(post_json(
                "/internal/servers/w1/status",
                Some("nope"),
                r#"{"status":"running"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_report_is_recorded_without_touching_status() {
        let state = state();
        let app = build_router(state.clone());
        let response = app
            .oneshot(post_json(
                "/internal/servers/w1/status",
                Some(TOKEN),
                r#"{"status":"running","message":"health check passed","process_pid":4242}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let w = state.store.get_workload("w1").unwrap().unwrap();
        assert_eq!(w.status, WorkloadStatus::Pending);
        assert_eq!(w.process.status.as_deref(), Some("running"));
        assert_eq!(w.process.message.as_deref(), Some("health check passed"));
        assert_eq!(w.process.pid, Some(4242));
        assert!(w.process.reported_at.is_some());
    }

    #[tokio::test]
    async fn status_report_for_unknown_server_is_404() {
        let app = build_router(state());
        let response = app
            .oneshot(post_json(
                "/internal/servers/ghost/status",
                Some(TOKEN),
                r#"{"status":"running"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn heartbeat_through_router() {
        let state = state();
        let app = build_router(state.clone());
        let response = app
            .oneshot(post_json(
                "/internal/servers/w1/heartbeat",
                Some(TOKEN),
                r#"{"process_pid":4242,"memory_mb":512,"cpu_percent":12.5}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let w = state.store.get_workload("w1").unwrap().unwrap();
        assert_eq!(w.process.memory_mb, Some(512));
        assert_eq!(w.process.cpu_percent, Some(12.5));
        assert!(w.process.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn nodes_route_reports_free_capacity() {
        let app = build_router(state());
        let response = app
            .oneshot(Request::get("/api/v1/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"][0]["name"], "node-a");
        assert_eq!(body["data"][0]["free_ports"], 10);
    }
}
