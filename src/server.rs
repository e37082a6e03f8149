//! HTTP API, translating requests into executor calls.
//!
//! Routes:
//!   GET  /, /health  agent status and allowed tools
//!   POST /execute    `{command, timeout?}` → execution result
//!   POST /stop       `{process_id}` → stop result
//!   GET  /jobs       currently running jobs
//!
//! Every response carries permissive CORS headers; `OPTIONS` on any
//! path is answered directly by the CORS layer. There is no
//! authentication and no TLS.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::AgentError;
use crate::executor::{ExecutionResult, Executor, JobSummary, StopResult};

#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<Executor>,
    /// Reported as `agent` by `/health`
    pub agent_name: Arc<str>,
    /// Used when an execute request has no `timeout`
    pub default_timeout_secs: u64,
}

#[derive(Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    command: String,
    timeout: Option<u64>,
}

#[derive(Deserialize)]
struct StopRequest {
    process_id: u64,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    agent: String,
    version: &'static str,
    allowed_tools: Vec<String>,
}

#[derive(Serialize)]
struct JobsResponse {
    jobs: Vec<JobSummary>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/execute", post(execute_handler))
        .route("/stop", post(stop_handler))
        .route("/jobs", get(jobs_handler))
        .fallback(not_found_handler)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` resolves.
///
/// Running jobs are then stopped, so pending `/execute` requests
/// complete and the graceful drain does not wait on them.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("Listening on http://{addr}");
    let executor = Arc::clone(&state.executor);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            executor.shutdown();
        })
        .await?;
    Ok(())
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, AgentError> {
    serde_json::from_slice(body)
        .map_err(|e| AgentError::MalformedRequest(format!("Invalid JSON: {e}")))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "online",
        agent: state.agent_name.to_string(),
        version: env!("CARGO_PKG_VERSION"),
        allowed_tools: state.executor.policy().tools().to_vec(),
    })
}

async fn execute_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ExecutionResult>, AgentError> {
    let request: ExecuteRequest = parse_body(&body)?;
    let timeout = Duration::from_secs(request.timeout.unwrap_or(state.default_timeout_secs));

    // Detached so the job is supervised to completion even if the
    // client goes away; a panic here only fails this request.
    let executor = Arc::clone(&state.executor);
    let command = request.command;
    let result = tokio::spawn(async move { executor.execute(&command, timeout).await })
        .await
        .unwrap_or_else(|e| {
            error!("Execute task failed: {e}");
            ExecutionResult::failure(&AgentError::Internal(e.to_string()), None)
        });

    Ok(Json(result))
}

async fn stop_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<StopResult>, AgentError> {
    let request: StopRequest = parse_body(&body)?;
    Ok(Json(state.executor.stop(request.process_id)))
}

async fn jobs_handler(State(state): State<AppState>) -> Json<JobsResponse> {
    Json(JobsResponse {
        jobs: state.executor.jobs(),
    })
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tower::ServiceExt;

    use crate::config::ExecutorConfig;
    use crate::policy::PolicyValidator;

    fn test_state() -> AppState {
        let policy = Arc::new(PolicyValidator::new(["echo", "sleep"]));
        AppState {
            executor: Arc::new(Executor::new(policy, &ExecutorConfig::default())),
            agent_name: Arc::from("test-agent"),
            default_timeout_secs: 300,
        }
    }

    fn post_json(uri: &str, body: impl Into<String>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.into()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    // ── Health ───────────────────────────────────────

    #[tokio::test]
    async fn test_health() {
        let app = router(test_state());
        let response = app.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");

        let json = body_json(response).await;
        assert_eq!(json["status"], "online");
        assert_eq!(json["agent"], "test-agent");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["allowed_tools"], json!(["echo", "sleep"]));
    }

    #[tokio::test]
    async fn test_root_is_health() {
        let app = router(test_state());
        let response = app.oneshot(get_request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "online");
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let app = router(test_state());
        let response = app.oneshot(get_request("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // ── CORS ─────────────────────────────────────────

    #[tokio::test]
    async fn test_options_preflight() {
        let app = router(test_state());
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/execute")
            .header("origin", "http://localhost:5173")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();
        assert_eq!(headers["access-control-allow-origin"], "*");
        let methods = headers["access-control-allow-methods"].to_str().unwrap();
        assert!(methods.contains("GET"));
        assert!(methods.contains("POST"));
        assert!(methods.contains("OPTIONS"));
        let allowed = headers["access-control-allow-headers"]
            .to_str()
            .unwrap()
            .to_lowercase();
        assert!(allowed.contains("content-type"));
    }

    // ── Execute ──────────────────────────────────────

    #[tokio::test]
    async fn test_execute_echo() {
        let app = router(test_state());
        let response = app
            .oneshot(post_json(
                "/execute",
                json!({"command": "echo hello", "timeout": 5}).to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");

        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["stdout"], "hello\n");
        assert_eq!(json["exit_code"], 0);
        assert!(json["job_id"].is_u64());
    }

    #[tokio::test]
    async fn test_execute_rejected_command_is_200() {
        let app = router(test_state());
        let response = app
            .oneshot(post_json("/execute", r#"{"command": "rm -rf /"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("not in allowed list"));
        assert!(json.get("job_id").is_none());
    }

    #[tokio::test]
    async fn test_execute_missing_command_is_rejected_by_policy() {
        let app = router(test_state());
        let response = app.oneshot(post_json("/execute", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], false);
    }

    #[tokio::test]
    async fn test_execute_invalid_json_is_400() {
        let app = router(test_state());
        let response = app
            .oneshot(post_json("/execute", "not json at all"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().starts_with("Invalid JSON"));
    }

    #[tokio::test]
    async fn test_execute_wrong_types_is_400() {
        let app = router(test_state());
        let response = app
            .oneshot(post_json("/execute", r#"{"command": 42}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let app = router(test_state());
        let response = app
            .oneshot(post_json(
                "/execute",
                r#"{"command": "echo hi", "timeout": -1}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let app = router(test_state());
        let response = app
            .oneshot(post_json(
                "/execute",
                r#"{"command": "sleep 5", "timeout": 1}"#,
            ))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("timed out"));
    }

    // ── Stop / jobs ──────────────────────────────────

    #[tokio::test]
    async fn test_stop_unknown_process() {
        let app = router(test_state());
        let response = app
            .oneshot(post_json("/stop", r#"{"process_id": 999}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "Process 999 not found");
    }

    #[tokio::test]
    async fn test_stop_invalid_body_is_400() {
        let app = router(test_state());
        let response = app.oneshot(post_json("/stop", "{oops")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let app = router(test_state());
        let response = app
            .oneshot(post_json("/stop", r#"{"process_id": "abc"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stop_running_job_over_http() {
        let state = test_state();
        let app = router(state.clone());

        let pending = {
            let app = app.clone();
            tokio::spawn(async move {
                app.oneshot(post_json(
                    "/execute",
                    r#"{"command": "sleep 30", "timeout": 60}"#,
                ))
                .await
                .unwrap()
            })
        };

        let mut job_id = None;
        for _ in 0..200 {
            let response = app.clone().oneshot(get_request("/jobs")).await.unwrap();
            let json = body_json(response).await;
            if let Some(id) = json["jobs"][0]["id"].as_u64() {
                assert_eq!(json["jobs"][0]["command"], "sleep 30");
                assert_eq!(json["jobs"][0]["status"], "running");
                job_id = Some(id);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let job_id = job_id.expect("job never showed up in /jobs");

        let response = app
            .clone()
            .oneshot(post_json(
                "/stop",
                json!({"process_id": job_id}).to_string(),
            ))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["success"], true);

        let response = tokio::time::timeout(Duration::from_secs(10), pending)
            .await
            .expect("execute should return after stop")
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["job_id"], job_id);
        assert!(!state.executor.registry().contains(job_id));

        let response = app.oneshot(get_request("/jobs")).await.unwrap();
        assert_eq!(body_json(response).await["jobs"], json!([]));
    }

    // ── Shutdown ─────────────────────────────────────

    #[tokio::test]
    async fn test_shutdown_stops_in_flight_execute() {
        let state = test_state();
        let executor = Arc::clone(&state.executor);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (trigger, signal) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, state, async {
            let _ = signal.await;
        }));

        let body = r#"{"command": "sleep 30", "timeout": 60}"#;
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "POST /execute HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        for _ in 0..200 {
            if !executor.jobs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(executor.jobs().len(), 1);

        trigger.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("shutdown should not wait for the job to run out")
            .unwrap()
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("was stopped"));
        assert!(executor.jobs().is_empty());
    }
}
