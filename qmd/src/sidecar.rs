//! HTTP bridge that runs engine commands on behalf of remote callers.
//!
//! `POST /run` takes `{"workspace_dir", "args"}` and answers with the
//! base64 engine output. Requests go through the same invoker (locks,
//! retries, repair) as in-process calls.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::Method;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::any;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::config::QmdConfig;
use crate::error::QmdError;
use crate::error::Result;
use crate::proto::ErrorResponse;
use crate::proto::HEALTH_PATH;
use crate::proto::HealthResponse;
use crate::proto::RUN_PATH;
use crate::proto::RunRequest;
use crate::proto::RunResponse;
use crate::service::QmdService;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8791";
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct SidecarOptions {
    pub listen: SocketAddr,
    pub drain_timeout: Duration,
}

#[derive(Clone)]
struct AppState {
    service: QmdService,
    draining: Arc<AtomicBool>,
}

/// Binds `options.listen` and serves until `shutdown` fires, then closes
/// the service. The sidecar's service always runs the engine locally.
pub async fn run_sidecar(
    config: QmdConfig,
    options: SidecarOptions,
    shutdown: CancellationToken,
) -> Result<()> {
    let config = QmdConfig {
        sidecar_url: None,
        ..config
    };
    let service = QmdService::new(config)?;
    let listener = TcpListener::bind(options.listen).await?;
    info!(
        addr = %listener.local_addr()?,
        workspace_root = %service.config().workspace_root.display(),
        "qmd sidecar starting"
    );
    let result = serve(listener, service.clone(), shutdown, options.drain_timeout).await;
    service.close();
    result
}

/// Serves the bridge on an already bound listener. In-flight requests get
/// `drain_timeout` to finish once `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    service: QmdService,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> Result<()> {
    let draining = Arc::new(AtomicBool::new(false));
    let app = router(AppState {
        service,
        draining: Arc::clone(&draining),
    });

    let signal = {
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            draining.store(true, Ordering::SeqCst);
        }
    };
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .into_future();
    tokio::pin!(server);

    let drain_deadline = async {
        shutdown.cancelled().await;
        tokio::time::sleep(drain_timeout).await;
    };
    tokio::select! {
        result = &mut server => result?,
        () = drain_deadline => {
            warn!(drain_timeout_ms = drain_timeout.as_millis() as u64, "qmd sidecar drain timed out");
        }
    }
    info!("qmd sidecar stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health_handler))
        .route(RUN_PATH, any(run_handler))
        .with_state(state)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

async fn run_handler(
    State(state): State<AppState>,
    method: Method,
    body: Bytes,
) -> std::result::Result<Json<RunResponse>, AppError> {
    if method != Method::POST {
        return Err(AppError::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }
    if state.draining.load(Ordering::SeqCst) {
        return Err(AppError::new(StatusCode::SERVICE_UNAVAILABLE, "sidecar is shutting down"));
    }
    let request: RunRequest = serde_json::from_slice(&body)
        .map_err(|_| AppError::new(StatusCode::BAD_REQUEST, "invalid payload"))?;
    let workspace_dir = state
        .service
        .resolver()
        .validate_workspace_path(&request.workspace_dir)
        .map_err(AppError::bad_request)?;
    if request.args.is_empty() {
        return Err(AppError::new(StatusCode::BAD_REQUEST, "args are required"));
    }

    let deadline = Instant::now() + state.service.config().index_timeout();
    let output = state
        .service
        .run_engine(&workspace_dir, &request.args, deadline)
        .await
        .map_err(AppError::engine)?;
    Ok(Json(RunResponse::from_output(&output)))
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
    detail: Option<String>,
}

impl AppError {
    fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            message: message.to_string(),
            detail: None,
        }
    }

    fn bad_request(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
            detail: None,
        }
    }

    fn engine(err: QmdError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
            detail: Some(err.diagnostic_text()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::NoopAdvisoryLock;
    use crate::runner::CommandOutput;
    use crate::runner::CommandRunner;
    use crate::test_support::FakeRunner;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use serde_json::json;
    use tempfile::TempDir;
    use tempfile::tempdir;

    struct Harness {
        root: TempDir,
        base_url: String,
        runner: Arc<FakeRunner>,
        shutdown: CancellationToken,
        http: reqwest::Client,
    }

    async fn start(runner: Arc<FakeRunner>) -> Harness {
        let root = tempdir().unwrap();
        let service = QmdService::with_parts(
            QmdConfig::new(root.path()),
            runner.clone() as Arc<dyn CommandRunner>,
            Arc::new(NoopAdvisoryLock),
        )
        .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, service, shutdown.clone(), Duration::from_secs(1)));
        Harness {
            root,
            base_url: format!("http://{addr}"),
            runner,
            shutdown,
            http: reqwest::Client::new(),
        }
    }

    impl Harness {
        fn workspace(&self, id: &str) -> String {
            self.root.path().join(id).to_string_lossy().into_owned()
        }

        async fn post(&self, body: Value) -> (StatusCode, Value) {
            let resp = self
                .http
                .post(format!("{}{RUN_PATH}", self.base_url))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
            (status, resp.json().await.unwrap())
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let harness = start(FakeRunner::new(|_| CommandOutput::success(""))).await;
        let body: Value = harness
            .http
            .get(format!("{}{HEALTH_PATH}", harness.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({ "status": "ok" }));
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn run_returns_base64_output() {
        let harness = start(FakeRunner::new(|_| CommandOutput::success("Index: 2 files"))).await;
        let (status, body) = harness
            .post(json!({ "workspace_dir": harness.workspace("team-a"), "args": ["status"] }))
            .await;

        assert_eq!(status, StatusCode::OK);
        let response: RunResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.decode().unwrap(), b"Index: 2 files");
        assert_eq!(harness.runner.engine_calls(), vec![vec!["status".to_string()]]);
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn get_on_run_is_rejected() {
        let harness = start(FakeRunner::new(|_| CommandOutput::success(""))).await;
        let resp = harness
            .http
            .get(format!("{}{RUN_PATH}", harness.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 405);
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn malformed_requests_are_bad_requests() {
        let harness = start(FakeRunner::new(|_| CommandOutput::success(""))).await;

        let resp = harness
            .http
            .post(format!("{}{RUN_PATH}", harness.base_url))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({ "error": "invalid payload" }));

        let (status, body) = harness
            .post(json!({ "workspace_dir": "/etc", "args": ["status"] }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("inside workspace root"));

        let (status, body) = harness
            .post(json!({ "workspace_dir": harness.workspace("a"), "args": [] }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "args are required" }));

        assert!(harness.runner.calls().is_empty());
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn engine_failure_is_internal_error() {
        let harness = start(FakeRunner::new(|_| CommandOutput::failure(2, "bad flag"))).await;
        let (status, body) = harness
            .post(json!({ "workspace_dir": harness.workspace("a"), "args": ["search", "x"] }))
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("bad flag"));
        assert_eq!(body["detail"], json!("exit status: 2 bad flag"));
        harness.shutdown.cancel();
    }

    #[tokio::test]
    async fn draining_sidecar_rejects_work() {
        let root = tempdir().unwrap();
        let runner = FakeRunner::new(|_| CommandOutput::success(""));
        let service = QmdService::with_parts(
            QmdConfig::new(root.path()),
            runner.clone() as Arc<dyn CommandRunner>,
            Arc::new(NoopAdvisoryLock),
        )
        .unwrap();
        let state = AppState {
            service,
            draining: Arc::new(AtomicBool::new(true)),
        };
        let body = serde_json::to_vec(&json!({
            "workspace_dir": root.path().join("a"),
            "args": ["status"],
        }))
        .unwrap();

        let err = run_handler(State(state), Method::POST, Bytes::from(body))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn serve_returns_after_shutdown() {
        let root = tempdir().unwrap();
        let service = QmdService::with_parts(
            QmdConfig::new(root.path()),
            FakeRunner::new(|_| CommandOutput::success("")),
            Arc::new(NoopAdvisoryLock),
        )
        .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(listener, service, shutdown.clone(), Duration::from_secs(1)));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
