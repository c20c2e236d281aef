use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::chat::ChatService;
use crate::config::AppConfig;
use crate::db::Database;
use crate::error::{ChatError, IngestError};
use crate::ingest::{IngestResult, Ingestor};
use crate::models::{ChatRequest, ChatResponse, IngestRequest, IngestResponse, IngestStatus};

/// Sent by clients as `X-API-KEY-Token`; header names are case-insensitive.
pub const API_KEY_HEADER: &str = "x-api-key-token";

#[derive(Clone)]
struct AppState {
    db: Database,
    chat: ChatService,
    ingestor: Ingestor,
    admin_api_key: Option<String>,
    jobs: Arc<Mutex<HashMap<String, IngestStatus>>>,
}

impl AppState {
    fn new(config: &AppConfig, db: Database, chat: ChatService, ingestor: Ingestor) -> Self {
        Self {
            db,
            chat,
            ingestor,
            admin_api_key: config.admin_api_key.clone(),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub async fn run_server(
    config: AppConfig,
    db: Database,
    chat_service: ChatService,
    ingestor: Ingestor,
) -> Result<()> {
    if config.admin_api_key.is_none() {
        tracing::info!("POLICY_CHATBOT_ADMIN_KEY unset; HTTP ingestion disabled");
    }
    let app = router(AppState::new(&config, db, chat_service, ingestor));

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/send", post(send_handler))
        .route("/api/ingest", post(start_ingest))
        .route("/api/ingest/:job_id", get(get_ingest_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn send_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let user_id = authenticate(&state.db, &headers).await?;

    let Json(request) = body.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let question = request
        .message
        .filter(|message| !message.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("message is required"))?;

    let answer = state.chat.answer(user_id, &question).await?;
    Ok(Json(ChatResponse { message: answer }))
}

async fn start_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    authorize_admin(&state, &headers)?;
    let Json(request) = body.map_err(|err| ApiError::bad_request(err.body_text()))?;

    if !FsPath::new(&request.pdf_path).is_file() {
        return Err(IngestError::FileNotFound(request.pdf_path.clone().into()).into());
    }

    let job_id = Uuid::new_v4().to_string();
    let now = Utc::now();

    let initial = IngestStatus {
        job_id: job_id.clone(),
        status: "started".to_string(),
        stage: "queued".to_string(),
        message: None,
        page_count: 0,
        chunk_count: 0,
        started_at: now,
        updated_at: now,
    };

    {
        let mut jobs = state
            .jobs
            .lock()
            .map_err(|_| ApiError::from(anyhow::anyhow!("lock poisoned")))?;
        jobs.insert(job_id.clone(), initial.clone());
    }
    state.db.upsert_ingest_status(&initial).await?;

    let state_for_task = state.clone();
    let job_id_for_task = job_id.clone();
    tokio::spawn(async move {
        let jobs = state_for_task.jobs.clone();

        let callback = |status: IngestStatus| {
            if let Ok(mut guard) = jobs.lock() {
                guard.insert(status.job_id.clone(), status);
            }
        };

        let result: Result<IngestResult> = state_for_task
            .ingestor
            .ingest(&job_id_for_task, request, callback)
            .await;

        if let Err(err) = result {
            let failed_status = IngestStatus {
                job_id: job_id_for_task.clone(),
                status: "failed".to_string(),
                stage: "error".to_string(),
                message: Some(format!("{err:#}")),
                page_count: 0,
                chunk_count: 0,
                started_at: now,
                updated_at: Utc::now(),
            };

            if let Ok(mut guard) = state_for_task.jobs.lock() {
                guard.insert(job_id_for_task.clone(), failed_status.clone());
            }
            if let Err(db_err) = state_for_task.db.upsert_ingest_status(&failed_status).await {
                tracing::warn!("failed to persist status of job {}: {db_err:#}", job_id_for_task);
            }
            tracing::error!("ingest job {} failed: {err:#}", job_id_for_task);
        }
    });

    Ok(Json(IngestResponse {
        job_id,
        status: "started".to_string(),
    }))
}

async fn get_ingest_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<IngestStatus>, ApiError> {
    authorize_admin(&state, &headers)?;

    if let Some(status) = state
        .jobs
        .lock()
        .map_err(|_| ApiError::from(anyhow::anyhow!("lock poisoned")))?
        .get(&job_id)
        .cloned()
    {
        return Ok(Json(status));
    }

    let status = state.db.get_ingest_status(&job_id).await?;
    match status {
        Some(status) => Ok(Json(status)),
        None => Err(ApiError::not_found(format!(
            "ingest job not found: {}",
            job_id
        ))),
    }
}

async fn authenticate(db: &Database, headers: &HeaderMap) -> Result<i64, ApiError> {
    let api_key = api_key_from_headers(headers).ok_or_else(ApiError::unauthorized)?;
    db.resolve_user(api_key)
        .await?
        .ok_or_else(ApiError::unauthorized)
}

/// Ingestion rebuilds the shared index, so it takes the admin key, not a chat key.
fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_api_key.as_deref() else {
        return Err(ApiError::forbidden(
            "HTTP ingestion is disabled; use the ingest binary",
        ));
    };
    match api_key_from_headers(headers) {
        Some(key) if key == expected => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

fn api_key_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "invalid or missing API key".to_string(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(value: ChatError) -> Self {
        match value {
            ChatError::QuestionTooLarge { used, limit } => {
                tracing::info!(used, limit, "rejected oversized question");
                Self::bad_request("question is too long")
            }
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(value: IngestError) -> Self {
        match value {
            IngestError::FileNotFound(_) => Self::not_found(value.to_string()),
            IngestError::Extraction(_) | IngestError::InvalidChunkConfig(_) => {
                Self::bad_request(value.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        let value = match value.downcast::<ChatError>() {
            Ok(chat_err) => return chat_err.into(),
            Err(other) => other,
        };
        let value = match value.downcast::<IngestError>() {
            Ok(ingest_err) => return ingest_err.into(),
            Err(other) => other,
        };

        tracing::error!("request failed: {value:#}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::test_support;

    const ADMIN_KEY: &str = "admin-secret";

    async fn test_app(admin_api_key: Option<&str>, backend_url: &str) -> (TempDir, Database, Router) {
        let (dir, db) = test_support::temp_database().await;
        let mut config = test_support::config(dir.path(), backend_url);
        config.admin_api_key = admin_api_key.map(str::to_string);
        let state = AppState::new(
            &config,
            db.clone(),
            test_support::chat_service(&config, &db),
            test_support::ingestor(&config, &db),
        );
        (dir, db, router(state))
    }

    fn post_json(uri: &str, api_key: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str, api_key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(key) = api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[test]
    fn oversized_question_maps_to_bad_request() {
        let err = anyhow::Error::from(ChatError::QuestionTooLarge {
            used: 4_000,
            limit: 3_686,
        });
        let api_err = ApiError::from(err);
        assert_eq!(api_err.status, StatusCode::BAD_REQUEST);
        assert_eq!(api_err.message, "question is too long");
    }

    #[test]
    fn ingest_errors_map_to_client_statuses() {
        let missing = ApiError::from(anyhow::Error::from(IngestError::FileNotFound(
            "/tmp/nope.pdf".into(),
        )));
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let unreadable = ApiError::from(IngestError::Extraction("no text".to_string()));
        assert_eq!(unreadable.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn other_failures_are_internal_errors() {
        let api_err = ApiError::from(anyhow::anyhow!("ollama unreachable"));
        assert_eq!(api_err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api_err.message, "ollama unreachable");
    }

    #[test]
    fn api_key_header_is_trimmed_and_required() {
        let mut headers = HeaderMap::new();
        assert_eq!(api_key_from_headers(&headers), None);

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("   "));
        assert_eq!(api_key_from_headers(&headers), None);

        headers.insert(API_KEY_HEADER, HeaderValue::from_static(" abc123 "));
        assert_eq!(api_key_from_headers(&headers), Some("abc123"));
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = health().await;
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn send_requires_a_registered_key() {
        let (_dir, _db, app) = test_app(None, test_support::UNREACHABLE_URL).await;
        let body = r#"{"message": "Hello"}"#;

        let (status, json) = call(&app, post_json("/api/send", None, body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json, json!({ "error": "invalid or missing API key" }));

        let (status, _) = call(&app, post_json("/api/send", Some("not-a-key"), body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn send_rejects_missing_blank_or_malformed_messages() {
        let (_dir, db, app) = test_app(None, test_support::UNREACHABLE_URL).await;
        let api_key = db.register_api_key().await.unwrap();
        let user_id = db.resolve_user(&api_key).await.unwrap().unwrap();

        for body in ["{}", r#"{"message": null}"#, r#"{"message": "   "}"#, "not json"] {
            let (status, json) = call(&app, post_json("/api/send", Some(api_key.as_str()), body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {body}");
            assert!(json["error"].is_string());
        }
        assert!(db.load_history(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_rejects_oversized_question_without_recording_it() {
        let (_dir, db, app) = test_app(None, test_support::UNREACHABLE_URL).await;
        let api_key = db.register_api_key().await.unwrap();
        let user_id = db.resolve_user(&api_key).await.unwrap().unwrap();

        let body = json!({ "message": "word ".repeat(5_000) }).to_string();
        let (status, json) = call(&app, post_json("/api/send", Some(api_key.as_str()), &body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json, json!({ "error": "question is too long" }));
        assert!(db.load_history(user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_answers_and_records_the_exchange() {
        let backend =
            test_support::spawn_backend(Some("chunk-1"), "A monthly fee of $5 applies (p0-0).")
                .await;
        let (_dir, db, app) = test_app(None, &backend).await;
        db.replace_chunks(&[test_support::indexed_chunk(
            "chunk-1",
            "A monthly fee of $5 applies.",
        )])
        .await
        .unwrap();
        let api_key = db.register_api_key().await.unwrap();
        let user_id = db.resolve_user(&api_key).await.unwrap().unwrap();

        let body = r#"{"message": "Is there a monthly fee?"}"#;
        let (status, json) = call(&app, post_json("/api/send", Some(api_key.as_str()), body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!({ "message": "A monthly fee of $5 applies (p0-0)." }));
        let history = db.load_history(user_id).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["Is there a monthly fee?", "A monthly fee of $5 applies (p0-0)."]
        );
    }

    #[tokio::test]
    async fn ingestion_is_disabled_without_admin_key() {
        let (_dir, db, app) = test_app(None, test_support::UNREACHABLE_URL).await;
        let chat_key = db.register_api_key().await.unwrap();

        let body = r#"{"pdf_path": "/etc/hostname"}"#;
        let (status, _) = call(&app, post_json("/api/ingest", Some(chat_key.as_str()), body)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn ingestion_requires_the_admin_key() {
        let (_dir, db, app) = test_app(Some(ADMIN_KEY), test_support::UNREACHABLE_URL).await;
        let chat_key = db.register_api_key().await.unwrap();

        let body = r#"{"pdf_path": "/definitely/not/here.pdf"}"#;
        let (status, _) = call(&app, post_json("/api/ingest", Some(chat_key.as_str()), body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&app, get("/api/ingest/some-job", Some(chat_key.as_str()))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app, post_json("/api/ingest", Some(ADMIN_KEY), body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, get("/api/ingest/some-job", Some(ADMIN_KEY))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_route_needs_no_key() {
        let (_dir, _db, app) = test_app(None, test_support::UNREACHABLE_URL).await;
        let (status, json) = call(&app, get("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!({ "status": "ok" }));
    }
}
