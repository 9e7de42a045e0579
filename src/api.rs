//! REST API server for the statement reconciler
//!
//! Thin pass-through to blob storage, the document pipeline and the RAG
//! responder. Every response uses the same envelope.

use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, DefaultBodyLimit, Multipart,
        Query, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::{AppConfig, DEFAULT_MAX_UPLOAD_BYTES};
use crate::error::{PipelineError, Stage};
use crate::pipeline::{bounded, DocumentPipeline};
use crate::rag::RagResponder;
use crate::storage::{BlobStore, PDF_CONTENT_TYPE};

const DEFAULT_RAG_TOP: usize = 5;
const MAX_RAG_TOP: usize = 50;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub file_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub blob_names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RagRequest {
    pub query: String,
    #[serde(default)]
    pub top: Option<usize>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(status: StatusCode, data: T) -> ApiResult {
    (status, Json(ApiResponse::success(data)))
}

fn failure(err: PipelineError) -> ApiResult {
    let status = err.status_code();
    if status.is_server_error() {
        error!(%status, "Request failed: {}", err);
    } else {
        warn!(%status, "Request rejected: {}", err);
    }
    (status, Json(ApiResponse::error(err.to_string())))
}

fn bad_request(message: impl Into<String>) -> ApiResult {
    failure(PipelineError::BadRequest(message.into()))
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn BlobStore>,
    pub pipeline: Arc<DocumentPipeline>,
    pub rag: Arc<RagResponder>,
    pub request_timeout: Duration,
}

/// Transport settings for the router
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// `None` allows any origin
    pub allowed_origin: Option<String>,
    pub max_upload_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            allowed_origin: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl From<&AppConfig> for ServerOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            allowed_origin: config.allowed_origin.clone(),
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Blob Endpoints
/// =============================

/// Last path component, so uploads cannot pick their own folder
fn blob_name_for(file_name: &str) -> Option<String> {
    let name = file_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    (!name.is_empty()).then(|| name.to_string())
}

async fn upload_blobs(
    State(state): State<ApiState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult {
    let mut multipart = match multipart {
        Ok(m) => m,
        Err(e) => return bad_request(format!("expected multipart form data: {}", e)),
    };

    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return bad_request(format!("invalid multipart body: {}", e)),
        };
        if field.name() != Some("files") {
            continue;
        }

        let Some(name) = field.file_name().and_then(blob_name_for) else {
            return bad_request("every file needs a file name");
        };
        if !name.to_lowercase().ends_with(".pdf") {
            return bad_request(format!("'{}' is not a PDF", name));
        }

        match field.bytes().await {
            Ok(bytes) => files.push((name, bytes.to_vec())),
            Err(e) => return bad_request(format!("could not read '{}': {}", name, e)),
        }
    }

    if files.is_empty() {
        return bad_request("no files in field 'files'");
    }

    let mut uploaded: Vec<String> = Vec::with_capacity(files.len());
    for (name, bytes) in files {
        if let Err(e) = state.store.upload(&name, bytes, PDF_CONTENT_TYPE).await {
            return partial_upload(e, &name, uploaded);
        }
        uploaded.push(name);
    }

    info!(count = uploaded.len(), "Documents uploaded");
    ok(StatusCode::CREATED, serde_json::json!({ "uploaded": uploaded }))
}

/// Upload error that still reports the files stored before it
fn partial_upload(err: PipelineError, failed: &str, uploaded: Vec<String>) -> ApiResult {
    let status = err.status_code();
    let stored = if uploaded.is_empty() {
        "none".to_string()
    } else {
        uploaded.join(", ")
    };
    error!(%status, failed = %failed, stored = uploaded.len(), "Upload failed: {}", err);

    let mut body = ApiResponse::error(format!(
        "upload of '{}' failed ({}); already stored: {}",
        failed, err, stored
    ));
    body.data = Some(serde_json::json!({ "uploaded": uploaded, "failed": failed }));
    (status, Json(body))
}

async fn list_blobs(State(state): State<ApiState>, Query(query): Query<ListQuery>) -> ApiResult {
    let suffix = query
        .file_type
        .as_deref()
        .map(|t| t.trim().trim_start_matches('.'))
        .filter(|t| !t.is_empty())
        .map(|t| format!(".{}", t));

    match state.store.list(suffix.as_deref()).await {
        Ok(blobs) => ok(StatusCode::OK, serde_json::json!({ "blobs": blobs })),
        Err(e) => failure(e),
    }
}

/// =============================
/// Processing Endpoint
/// =============================

async fn process_documents(
    State(state): State<ApiState>,
    body: Result<Json<ProcessRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => return bad_request(format!("expected {{\"blob_names\": [...]}}: {}", e.body_text())),
    };
    if req.blob_names.is_empty() {
        return bad_request("blob_names must not be empty");
    }

    info!(documents = req.blob_names.len(), "Received processing request");

    match bounded(
        Stage::Request,
        state.request_timeout,
        state.pipeline.process(&req.blob_names),
    )
    .await
    {
        Ok(report) => ok(StatusCode::OK, report),
        Err(e) => failure(e),
    }
}

/// =============================
/// RAG Endpoint
/// =============================

async fn rag_query(
    State(state): State<ApiState>,
    body: Result<Json<RagRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => return bad_request(format!("expected {{\"query\": \"...\"}}: {}", e.body_text())),
    };

    let top = req.top.unwrap_or(DEFAULT_RAG_TOP);
    if top == 0 || top > MAX_RAG_TOP {
        return bad_request(format!("top must be between 1 and {}", MAX_RAG_TOP));
    }

    match state.rag.answer(&req.query, top).await {
        Ok(answer) => ok(StatusCode::OK, answer),
        Err(e) => failure(e),
    }
}

/// =============================
/// Router
/// =============================

fn cors_layer(allowed_origin: Option<&str>) -> CorsLayer {
    let Some(origin) = allowed_origin else {
        return CorsLayer::permissive();
    };

    match HeaderValue::from_str(origin) {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE]),
        Err(_) => {
            warn!(origin = %origin, "Invalid ALLOWED_ORIGIN; cross-origin requests disabled");
            CorsLayer::new()
        }
    }
}

pub fn create_router(state: ApiState, options: &ServerOptions) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/blob/upload", post(upload_blobs))
        .route("/api/blob/list", get(list_blobs))
        .route("/api/documents/process", post(process_documents))
        .route("/api/chatbot/rag_query", post(rag_query))
        .with_state(state)
        .layer(DefaultBodyLimit::max(options.max_upload_bytes))
        .layer(cors_layer(options.allowed_origin.as_deref()))
        .layer(TraceLayer::new_for_http())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    options: ServerOptions,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state, &options);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
