use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequest, FromRequestParts, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use http::HeaderValue;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    config::WsConfig,
    error::{AppError, AppResult},
    executor::{CodeExecutor, ExecError},
    metrics::MetricsRegistry,
    models::{
        ExecuteRequest, ExecuteResponse, ExecutionSite, HistoryEntry, HistoryQuery, Language,
        Session, SessionPatch, SessionResponse, validate_session_id,
    },
    rooms::RoomBroadcaster,
    ws,
};

pub const BROWSER_EXECUTION_NOTICE: &str =
    "Code execution happens in the browser. This endpoint is for API compatibility.";

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub rooms: RoomBroadcaster,
    pub executor: Arc<dyn CodeExecutor>,
    pub metrics: Arc<MetricsRegistry>,
    pub execution_timeout_secs: u64,
    pub max_code_bytes: usize,
    pub ws: WsConfig,
}

/// JSON body whose rejections render as `{"detail": ...}`.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);

pub fn routes(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::handler))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session).patch(patch_session))
        .route("/api/sessions/{id}/state", get(get_session_state))
        .route("/api/sessions/{id}/history", get(get_history))
        .route("/api/execute", post(execute))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let allowed = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn create_session(
    State(state): State<AppState>,
) -> AppResult<(StatusCode, Json<SessionResponse>)> {
    let session_id = state.rooms.store().create().await?;
    tracing::info!(session_id = %session_id, "session created");
    Ok((StatusCode::CREATED, Json(SessionResponse { session_id })))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<SessionResponse>> {
    let session = load_session(&state, &id).await?;
    Ok(Json(SessionResponse {
        session_id: session.session_id,
    }))
}

async fn get_session_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Session>> {
    Ok(Json(load_session(&state, &id).await?))
}

async fn patch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(patch): ApiJson<SessionPatch>,
) -> AppResult<Json<Session>> {
    validate_session_id(&id).map_err(AppError::InvalidRequest)?;
    if patch
        .code
        .as_ref()
        .is_some_and(|code| code.len() > state.max_code_bytes)
    {
        return Err(AppError::PayloadTooLarge);
    }
    let language = patch
        .language
        .as_deref()
        .map(str::parse::<Language>)
        .transpose()
        .map_err(|_| AppError::UnsupportedLanguage)?;

    state
        .rooms
        .apply_update(&id, patch.code, language)
        .await?
        .map(Json)
        .ok_or(AppError::SessionNotFound)
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<HistoryQuery>,
) -> AppResult<Json<Vec<HistoryEntry>>> {
    load_session(&state, &id).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(state.rooms.store().history(&id, limit).await?))
}

async fn execute(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ExecuteRequest>,
) -> AppResult<Json<ExecuteResponse>> {
    let language = request
        .language
        .parse::<Language>()
        .map_err(|_| AppError::UnsupportedLanguage)?;
    if request.code.len() > state.max_code_bytes {
        return Err(AppError::PayloadTooLarge);
    }

    if language.execution_site() == ExecutionSite::Browser {
        state.metrics.browser_execution();
        return Ok(Json(ExecuteResponse::output(BROWSER_EXECUTION_NOTICE)));
    }

    // Run detached so a panic inside the executor still yields a result.
    let executor = state.executor.clone();
    let timeout_secs = state.execution_timeout_secs;
    let code = request.code;
    let outcome = tokio::spawn(async move { executor.execute(&code, language, timeout_secs).await })
        .await
        .unwrap_or_else(|err| Err(ExecError::InternalFault(err.to_string())));

    if let Err(err) = &outcome {
        tracing::info!(language = %language, kind = err.kind(), "execution returned an error");
    }
    state.metrics.execution_finished(&outcome);
    Ok(Json(outcome.into()))
}

/// Ids that could never have been stored read as not found.
async fn load_session(state: &AppState, id: &str) -> AppResult<Session> {
    if validate_session_id(id).is_err() {
        return Err(AppError::SessionNotFound);
    }
    state
        .rooms
        .store()
        .get(id)
        .await?
        .ok_or(AppError::SessionNotFound)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::StoreConfig,
        executor::ExecutionResult,
        models::DEFAULT_CODE,
        session::SessionStore,
    };

    pub(crate) struct RecordingExecutor {
        pub calls: AtomicUsize,
        pub reply: ExecutionResult,
    }

    impl RecordingExecutor {
        pub fn replying(reply: ExecutionResult) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply,
            })
        }
    }

    #[async_trait]
    impl CodeExecutor for RecordingExecutor {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn execute(&self, _code: &str, _language: Language, _timeout_secs: u64) -> ExecutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    pub(crate) async fn test_state(
        dir: &std::path::Path,
        executor: Arc<dyn CodeExecutor>,
    ) -> AppState {
        let store = SessionStore::connect(&StoreConfig {
            database_path: dir.join("api.db"),
            pool_size: 2,
            connect_attempts: 1,
            connect_retry_delay: Duration::from_millis(10),
            op_timeout: Duration::from_secs(5),
        })
        .await
        .unwrap();
        let metrics = Arc::new(MetricsRegistry::new());
        AppState {
            rooms: RoomBroadcaster::new(store, metrics.clone()),
            executor,
            metrics,
            execution_timeout_secs: 10,
            max_code_bytes: 1024,
            ws: WsConfig::default(),
        }
    }

    fn app(state: AppState) -> Router {
        routes(state, &["http://localhost:3000".to_string()])
    }

    async fn call(
        app: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn create_then_get_round_trips_the_id() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), RecordingExecutor::replying(Ok(String::new()))).await;

        let (status, body) = call(app(state.clone()), "POST", "/api/sessions", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["session_id"].as_str().unwrap().to_string();
        assert!(!id.is_empty());

        let (status, body) = call(app(state.clone()), "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session_id"], id.as_str());

        let (status, body) =
            call(app(state), "GET", &format!("/api/sessions/{id}/state"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], DEFAULT_CODE);
        assert_eq!(body["language"], "javascript");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), RecordingExecutor::replying(Ok(String::new()))).await;

        let (status, body) = call(app(state.clone()), "GET", "/api/sessions/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "Session not found");

        let (status, _) = call(app(state.clone()), "GET", "/api/sessions/missing/history", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(state.rooms.store().get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected_before_execution() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecordingExecutor::replying(Ok(String::new()));
        let state = test_state(dir.path(), executor.clone()).await;

        let (status, body) = call(
            app(state),
            "POST",
            "/api/execute",
            Some(serde_json::json!({"code": "fn main() {}", "language": "rust"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "Unsupported language");
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn browser_languages_get_the_stub_response() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecordingExecutor::replying(Ok(String::new()));
        let state = test_state(dir.path(), executor.clone()).await;

        for language in ["javascript", "python"] {
            let (status, body) = call(
                app(state.clone()),
                "POST",
                "/api/execute",
                Some(serde_json::json!({"code": "print(1)", "language": language})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["output"], BROWSER_EXECUTION_NOTICE);
            assert!(body["error"].is_null());
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn server_languages_are_delegated_to_the_executor() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecordingExecutor::replying(Err(ExecError::ExecutionTimeout(10)));
        let state = test_state(dir.path(), executor.clone()).await;

        let (status, body) = call(
            app(state.clone()),
            "POST",
            "/api/execute",
            Some(serde_json::json!({"code": "for {}", "language": "go"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["output"].is_null());
        assert_eq!(body["error"], "Code execution timed out after 10 seconds");
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let metrics = state.metrics.render_prometheus();
        assert!(metrics.contains("codepair_executions_timed_out_total 1\n"));
    }

    #[tokio::test]
    async fn oversized_code_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecordingExecutor::replying(Ok(String::new()));
        let state = test_state(dir.path(), executor.clone()).await;

        let (status, _) = call(
            app(state),
            "POST",
            "/api/execute",
            Some(serde_json::json!({"code": "x".repeat(2048), "language": "java"})),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn patch_updates_existing_sessions_only() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), RecordingExecutor::replying(Ok(String::new()))).await;
        state.rooms.store().get_or_create("abc").await.unwrap();

        let (status, body) = call(
            app(state.clone()),
            "PATCH",
            "/api/sessions/abc",
            Some(serde_json::json!({"code": "package main", "language": "go"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], "package main");
        assert_eq!(body["language"], "go");

        let (status, _) = call(
            app(state.clone()),
            "PATCH",
            "/api/sessions/abc",
            Some(serde_json::json!({"language": "cobol"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            app(state.clone()),
            "PATCH",
            "/api/sessions/ghost",
            Some(serde_json::json!({"code": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(state.rooms.store().get("ghost").await.unwrap().is_none());

        let (status, body) =
            call(app(state), "GET", "/api/sessions/abc/history?limit=1", None).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["language"], "go");
    }

    #[tokio::test]
    async fn health_and_metrics_respond() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), RecordingExecutor::replying(Ok(String::new()))).await;

        let (status, body) = call(app(state.clone()), "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let response = app(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&text).contains("codepair_executions_total 0"));
    }

    #[tokio::test]
    async fn malformed_bodies_get_a_detail_error() {
        let dir = tempfile::tempdir().unwrap();
        let executor = RecordingExecutor::replying(Ok(String::new()));
        let state = test_state(dir.path(), executor.clone()).await;

        let (status, body) = call(
            app(state.clone()),
            "POST",
            "/api/execute",
            Some(serde_json::json!({"code": "x"})),
        )
        .await;
        assert!(status.is_client_error());
        assert!(body["detail"].as_str().is_some_and(|d| !d.is_empty()));

        let response = app(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/execute")
                    .body(Body::from("{\"code\": \"x\", \"language\": \"go\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["detail"].is_string());

        state.rooms.store().get_or_create("h").await.unwrap();
        let (status, body) =
            call(app(state), "GET", "/api/sessions/h/history?limit=many", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].is_string());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn impossible_session_ids_read_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), RecordingExecutor::replying(Ok(String::new()))).await;
        let long_id = "x".repeat(256);

        for suffix in ["", "/state", "/history"] {
            let (status, body) = call(
                app(state.clone()),
                "GET",
                &format!("/api/sessions/{long_id}{suffix}"),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["detail"], "Session not found");
        }
    }
}
