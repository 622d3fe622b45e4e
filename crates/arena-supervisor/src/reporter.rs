//! Upstream reporting to the control plane's internal API.
//!
//! Status reports are retried under a [`RetryPolicy`]; heartbeats are sent
//! once and their failures only logged by the caller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arena_core::{HeartbeatReport, StatusReport};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::SupervisorConfig;
use crate::error::{SupervisorError, SupervisorResult};

/// Sink for process status reports and heartbeats.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report_status(&self, report: &StatusReport) -> SupervisorResult<()>;

    async fn heartbeat(&self, heartbeat: &HeartbeatReport) -> SupervisorResult<()>;
}

/// Bounded linear backoff: attempt `n` (1-based) waits `base_delay * n`
/// before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Posts JSON to `{api_url}/internal/servers/{id}/…` with a bearer token.
///
/// Each request opens its own HTTP/1 connection.
pub struct HttpReporter {
    api_url: String,
    server_id: String,
    auth_token: String,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl HttpReporter {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            api_url: config.api_url.clone(),
            server_id: config.server_id.clone(),
            auth_token: config.auth_token.clone(),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/internal/servers/{}/{endpoint}", self.api_url, self.server_id)
    }

    async fn post_json<T: serde::Serialize + Sync>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> SupervisorResult<()> {
        let payload =
            serde_json::to_vec(body).map_err(|e| SupervisorError::Report(e.to_string()))?;
        let url = self.url(endpoint);
        let uri: http::Uri = url
            .parse()
            .map_err(|e| SupervisorError::Report(format!("invalid url {url}: {e}")))?;
        let Some(authority) = uri.authority().cloned() else {
            return Err(SupervisorError::Report(format!("url {url} has no host")));
        };
        let target = uri
            .path_and_query()
            .map_or("/", |p| p.as_str())
            .to_string();
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(target)
            .header(http::header::HOST, authority.as_str())
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(http::header::AUTHORIZATION, format!("Bearer {}", self.auth_token))
            .header(http::header::USER_AGENT, "arena-supervisor/0.1")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| SupervisorError::Report(e.to_string()))?;

        let exchange = async {
            let port = authority.port_u16().unwrap_or(80);
            let stream = TcpStream::connect((authority.host(), port))
                .await
                .map_err(|e| SupervisorError::Report(format!("connect {authority}: {e}")))?;
            let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| SupervisorError::Report(format!("handshake {authority}: {e}")))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "report connection closed with error");
                }
            });
            sender
                .send_request(request)
                .await
                .map_err(|e| SupervisorError::Report(e.to_string()))
        };

        let response = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| SupervisorError::Report(format!("{endpoint} request timed out")))??;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SupervisorError::ReportStatus(response.status()))
        }
    }
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn report_status(&self, report: &StatusReport) -> SupervisorResult<()> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.post_json("status", report).await {
                Ok(()) => {
                    debug!(status = %report.status, attempt, "status reported");
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        status = %report.status,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "status report failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn heartbeat(&self, heartbeat: &HeartbeatReport) -> SupervisorResult<()> {
        self.post_json("heartbeat", heartbeat).await
    }
}

/// Records reports in memory instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct MemoryReporter {
    statuses: Arc<Mutex<Vec<StatusReport>>>,
    heartbeats: Arc<Mutex<Vec<HeartbeatReport>>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<StatusReport> {
        self.statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Just the `status` field of every report, in order.
    pub fn status_names(&self) -> Vec<String> {
        self.statuses().into_iter().map(|r| r.status).collect()
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatReport> {
        self.heartbeats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Reporter for MemoryReporter {
    async fn report_status(&self, report: &StatusReport) -> SupervisorResult<()> {
        self.statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(report.clone());
        Ok(())
    }

    async fn heartbeat(&self, heartbeat: &HeartbeatReport) -> SupervisorResult<()> {
        self.heartbeats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(heartbeat.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;

    #[derive(Clone, Default)]
    struct Upstream {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
        seen_auth: Arc<Mutex<Vec<String>>>,
    }

    async fn status_handler(State(up): State<Upstream>, headers: HeaderMap) -> StatusCode {
        if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            up.seen_auth.lock().unwrap().push(auth.to_string());
        }
        let n = up.calls.fetch_add(1, Ordering::SeqCst);
        if n < up.fail_first {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        }
    }

    async fn serve(up: Upstream) -> String {
        let app = Router::new()
            .route("/internal/servers/{id}/status", post(status_handler))
            .route("/internal/servers/{id}/heartbeat", post(status_handler))
            .with_state(up);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn reporter(api_url: String) -> HttpReporter {
        let config = SupervisorConfig::from_lookup(|key| {
            match key {
                "ARENA_SERVER_ID" => Some("w1".to_string()),
                "ARENA_AUTH_TOKEN" => Some("token".to_string()),
                "ARENA_API_URL" => Some(api_url.clone()),
                "ARENA_START_COMMAND" => Some(r#"["true"]"#.to_string()),
                _ => None,
            }
        })
        .unwrap();
        HttpReporter::new(&config).with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        })
    }

    fn running() -> StatusReport {
        StatusReport {
            status: "running".to_string(),
            message: None,
            process_pid: Some(7),
        }
    }

    #[test]
    fn default_policy_backs_off_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn status_report_carries_bearer_token() {
        let up = Upstream::default();
        let url = serve(up.clone()).await;
        reporter(url).report_status(&running()).await.unwrap();
        assert_eq!(up.calls.load(Ordering::SeqCst), 1);
        assert_eq!(up.seen_auth.lock().unwrap().as_slice(), ["Bearer token"]);
    }

    #[tokio::test]
    async fn status_report_retries_until_accepted() {
        let up = Upstream {
            fail_first: 2,
            ..Default::default()
        };
        let url = serve(up.clone()).await;
        reporter(url).report_status(&running()).await.unwrap();
        assert_eq!(up.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn status_report_gives_up_after_max_attempts() {
        let up = Upstream {
            fail_first: 10,
            ..Default::default()
        };
        let url = serve(up.clone()).await;
        let err = reporter(url).report_status(&running()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ReportStatus(StatusCode::SERVICE_UNAVAILABLE)));
        assert_eq!(up.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn heartbeat_is_not_retried() {
        let up = Upstream {
            fail_first: 10,
            ..Default::default()
        };
        let url = serve(up.clone()).await;
        let hb = HeartbeatReport {
            process_pid: 7,
            memory_mb: Some(1),
            cpu_percent: Some(0.0),
        };
        assert!(reporter(url).heartbeat(&hb).await.is_err());
        assert_eq!(up.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_api_is_a_report_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let hb = HeartbeatReport {
            process_pid: 7,
            memory_mb: None,
            cpu_percent: None,
        };
        let err = reporter(format!("http://{addr}")).heartbeat(&hb).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Report(_)));
    }

    #[tokio::test]
    async fn api_path_prefix_is_kept() {
        let up = Upstream::default();
        let app = Router::new()
            .route("/arena/internal/servers/{id}/status", post(status_handler))
            .with_state(up.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        reporter(format!("http://{addr}/arena"))
            .report_status(&running())
            .await
            .unwrap();
        assert_eq!(up.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memory_reporter_records() {
        let reporter = MemoryReporter::new();
        reporter.report_status(&running()).await.unwrap();
        assert_eq!(reporter.status_names(), vec!["running"]);
    }
}
