//! Admin HTTP server.
//!
//! Operator control surface over a running [`Pipeline`]. Long-running work
//! (processing, retries) is started in the background and acknowledged with
//! `202 Accepted`; progress is then read back through `GET /documents/{id}`.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/documents` | List documents, optional `?status=` filter |
//! | `GET`  | `/documents/{id}` | Document status with per-chunk progress |
//! | `GET`  | `/stuck` | Stuck documents and chunks |
//! | `POST` | `/documents/{id}/process` | Drive a document through the pipeline |
//! | `POST` | `/documents/{id}/retry` | Retry a failed document, body `{"stage": "split"\|"ocr"\|"merge"}` |
//! | `POST` | `/documents/{id}/reset` | Reset a stuck document |
//! | `POST` | `/documents/{id}/validate` | Run the integrity check |
//! | `POST` | `/chunks/{id}/reset` | Reset one stuck chunk |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document 3f2a… not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use casechunk_core::integrity::IntegrityReport;
use casechunk_core::models::{Document, DocumentStatus};

use crate::config::Config;
use crate::monitor::{ResetOutcome, StuckReport};
use crate::pipeline::{Pipeline, Stage};
use crate::status::{document_view, DocumentView};
use crate::unix_now;

type AppState = Arc<Pipeline>;

/// Build the admin router over `pipeline`.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/documents", get(handle_list_documents))
        .route("/documents/{id}", get(handle_get_document))
        .route("/stuck", get(handle_stuck))
        .route("/documents/{id}/process", post(handle_process))
        .route("/documents/{id}/retry", post(handle_retry))
        .route("/documents/{id}/reset", post(handle_reset_document))
        .route("/documents/{id}/validate", post(handle_validate))
        .route("/chunks/{id}/reset", post(handle_reset_chunk))
        .layer(cors)
        .with_state(pipeline)
}

/// Serve the admin API and run the retention sweep, integrity sweep and
/// stuck-job poller until the process is terminated.
pub async fn run_server(config: &Config, pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    pipeline.clone().spawn_redrive(rx);
    pipeline
        .cleanup()
        .clone()
        .spawn_periodic(Duration::from_secs(config.retention.sweep_interval_secs));
    pipeline
        .validator()
        .clone()
        .spawn_periodic(Duration::from_secs(config.monitor.integrity_interval_secs));
    pipeline.monitor().clone().spawn_poller(
        Duration::from_secs(config.monitor.poll_interval_secs),
        config.monitor.auto_reset,
        Some(tx),
    );

    let app = router(pipeline);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "admin server listening");
    println!("casechunk admin server listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    app_error(StatusCode::NOT_FOUND, "not_found", message)
}

fn conflict(message: impl Into<String>) -> AppError {
    app_error(StatusCode::CONFLICT, "conflict", message)
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("not found") {
            not_found(msg)
        } else {
            error!(error = %msg, "admin request failed");
            app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
        }
    }
}

async fn require_document(pipeline: &Pipeline, id: &str) -> Result<Document, AppError> {
    pipeline
        .store()
        .get_document(id)
        .await?
        .ok_or_else(|| not_found(format!("document {} not found", id)))
}

fn spawn_process(pipeline: AppState, document_id: String) {
    tokio::spawn(async move {
        if let Err(e) = pipeline.process(&document_id).await {
            error!(document_id = %document_id, error = %e, "background processing failed");
        }
    });
}

#[derive(Serialize)]
struct Accepted {
    document_id: String,
    accepted: bool,
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /documents ============

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn handle_list_documents(
    State(pipeline): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Document>>, AppError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(DocumentStatus::parse(raw).ok_or_else(|| {
            app_error(
                StatusCode::BAD_REQUEST,
                "bad_request",
                format!("unknown status: {}", raw),
            )
        })?),
        None => None,
    };
    Ok(Json(pipeline.store().list_documents(status).await?))
}

// ============ GET /documents/{id} ============

async fn handle_get_document(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>, AppError> {
    document_view(pipeline.store().as_ref(), &id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("document {} not found", id)))
}

// ============ GET /stuck ============

async fn handle_stuck(State(pipeline): State<AppState>) -> Result<Json<StuckReport>, AppError> {
    Ok(Json(pipeline.monitor().find_stuck(unix_now()).await?))
}

// ============ POST /documents/{id}/process ============

async fn handle_process(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let doc = require_document(&pipeline, &id).await?;
    if doc.status.is_terminal() {
        return Err(conflict(format!("document {} is already {}", id, doc.status)));
    }
    spawn_process(pipeline, id.clone());
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            document_id: id,
            accepted: true,
        }),
    ))
}

// ============ POST /documents/{id}/retry ============

#[derive(Deserialize)]
struct RetryRequest {
    stage: Stage,
}

async fn handle_retry(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RetryRequest>,
) -> Result<(StatusCode, Json<Accepted>), AppError> {
    let doc = require_document(&pipeline, &id).await?;
    if doc.status != DocumentStatus::OcrFailed {
        return Err(conflict(format!(
            "document {} is {}, only ocr_failed documents can be retried",
            id, doc.status
        )));
    }
    let document_id = id.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.retry(&document_id, req.stage).await {
            error!(document_id = %document_id, error = %e, "retry failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            document_id: id,
            accepted: true,
        }),
    ))
}

// ============ POST /documents/{id}/reset ============

async fn handle_reset_document(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResetOutcome>, AppError> {
    require_document(&pipeline, &id).await?;
    let outcome = pipeline.reset_document(&id).await?;
    if outcome.chunks_reset > 0 || !outcome.documents.is_empty() {
        spawn_process(pipeline, id);
    }
    Ok(Json(outcome))
}

// ============ POST /documents/{id}/validate ============

async fn handle_validate(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IntegrityReport>, AppError> {
    require_document(&pipeline, &id).await?;
    Ok(Json(pipeline.validate(&id).await?))
}

// ============ POST /chunks/{id}/reset ============

#[derive(Serialize)]
struct ChunkResetResponse {
    chunk_id: String,
    reset: bool,
}

async fn handle_reset_chunk(
    State(pipeline): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChunkResetResponse>, AppError> {
    let chunk = pipeline
        .store()
        .get_chunk(&id)
        .await?
        .ok_or_else(|| not_found(format!("chunk {} not found", id)))?;
    let reset = pipeline.reset_chunk(&id).await?;
    if reset {
        spawn_process(pipeline, chunk.document_id);
    }
    Ok(Json(ChunkResetResponse { chunk_id: id, reset }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use casechunk_core::objects::InMemoryObjectStore;
    use casechunk_core::store::memory::InMemoryStore;

    use crate::ocr_http::DisabledProvider;

    async fn spawn_app() -> (String, Arc<Pipeline>) {
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(DisabledProvider),
            &Config::with_db_path("unused.db"),
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(pipeline.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), pipeline)
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (base, _) = spawn_app().await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_document_uses_error_contract() {
        let (base, _) = spawn_app().await;
        let resp = reqwest::get(format!("{}/documents/nope", base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn retry_requires_failed_document() {
        let (base, pipeline) = spawn_app().await;
        let now = unix_now();
        pipeline
            .store()
            .insert_document(&Document {
                id: "doc-1".into(),
                matter_id: "m".into(),
                total_pages: 3,
                status: DocumentStatus::Uploaded,
                retry_count: 0,
                source_key: "documents/m/doc-1.pdf".into(),
                full_text: String::new(),
                last_error: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let resp = reqwest::Client::new()
            .post(format!("{}/documents/doc-1/retry", base))
            .json(&serde_json::json!({ "stage": "ocr" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);

        let view: serde_json::Value = reqwest::get(format!("{}/documents/doc-1", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(view["status"], "uploaded");
        assert_eq!(view["chunks_total"], 0);
    }
}
