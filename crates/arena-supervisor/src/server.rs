//! Local probe endpoints for the orchestrator.
//!
//! | Path | Meaning |
//! |---|---|
//! | `/healthz` | 200 while the supervisor itself is alive |
//! | `/readyz` | 200 only when the process is running and healthy, else 503 |
//! | `/status` | process status, pid, uptime and health flag |

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::supervisor::Supervisor;

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/status", get(status))
        .with_state(supervisor)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    if supervisor.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn status(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    Json(supervisor.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::{HealthSettings, SupervisorConfig};
    use crate::reporter::MemoryReporter;

    fn supervisor() -> Arc<Supervisor> {
        let config = SupervisorConfig {
            server_id: "w1".to_string(),
            auth_token: "token".to_string(),
            api_url: "http://127.0.0.1:1".to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), "exec sleep 30".to_string()],
            workdir: None,
            grace_period: Duration::from_secs(1),
            health: HealthSettings::default(),
            heartbeat_interval: Duration::from_secs(30),
            health_server_port: 0,
        };
        Supervisor::new(config, Arc::new(MemoryReporter::new()))
    }

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn liveness_is_unconditional() {
        let app = router(supervisor());
        assert_eq!(get_status(app, "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_process() {
        let sup = supervisor();
        assert_eq!(
            get_status(router(Arc::clone(&sup)), "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        sup.start().await.unwrap();
        assert_eq!(get_status(router(Arc::clone(&sup)), "/readyz").await, StatusCode::OK);

        sup.stop(false).await.unwrap();
        assert_eq!(
            get_status(router(Arc::clone(&sup)), "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn status_is_json() {
        let sup = supervisor();
        sup.start().await.unwrap();
        let response = router(Arc::clone(&sup))
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "running");
        assert_eq!(body["healthy"], true);
        assert_eq!(body["pid"], sup.pid().unwrap());
        sup.stop(false).await.unwrap();
    }
}
