//! HTTP API server.
//!
//! Exposes the knowledge-base lifecycle, file uploads, retrieval, and the
//! chat agent over a JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/v1/chat` | Agent chat over an optional knowledge base |
//! | `GET`  | `/api/v1/health` | Component health (LLM, vector store) |
//! | `GET`  | `/api/v1/knowledge-bases` | Paged KB listing |
//! | `POST` | `/api/v1/knowledge-bases` | Create a KB |
//! | `GET`  | `/api/v1/knowledge-bases/{id}` | Fetch one KB |
//! | `PUT`  | `/api/v1/knowledge-bases/{id}` | Patch tuning config |
//! | `DELETE` | `/api/v1/knowledge-bases/{id}` | Delete KB + collection |
//! | `GET`  | `/api/v1/knowledge-bases/{id}/files` | Paged file listing |
//! | `POST` | `/api/v1/knowledge-bases/{id}/files` | Multipart upload |
//! | `DELETE` | `/api/v1/knowledge-bases/{id}/files/{fid}` | Delete a file |
//! | `POST` | `/api/v1/knowledge-bases/{id}/query` | Direct retrieval |
//!
//! # Status codes
//!
//! `400` validation, `404` missing, `409` duplicate name, `503` backing
//! service unavailable, `504` timeout, `500` otherwise. Chat failures keep
//! diagnostics short; stack traces never reach the caller.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::agent::Agent;
use crate::error::Error;
use crate::kb::{KbManager, KbPatch, KbSpec, QueryOverrides};
use crate::llm::{ChatMessage, LlmProvider};
use crate::models::{FileEntity, FileStatus, KnowledgeBase, SearchHit};
use crate::vectorstore::VectorStore;

/// Shared application state, cheap to clone into handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<KbManager>,
    pub agent: Arc<Agent>,
    pub llm: Arc<dyn LlmProvider>,
    pub store: Arc<dyn VectorStore>,
}

/// Build the router with all API routes and permissive CORS.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/chat", post(handle_chat))
        .route("/api/v1/health", get(handle_health))
        .route(
            "/api/v1/knowledge-bases",
            get(handle_list_kbs).post(handle_create_kb),
        )
        .route(
            "/api/v1/knowledge-bases/{id}",
            get(handle_get_kb)
                .put(handle_update_kb)
                .delete(handle_delete_kb),
        )
        .route(
            "/api/v1/knowledge-bases/{id}/files",
            get(handle_list_files).post(handle_upload_files),
        )
        .route(
            "/api/v1/knowledge-bases/{id}/files/{fid}",
            axum::routing::delete(handle_delete_file),
        )
        .route("/api/v1/knowledge-bases/{id}/query", post(handle_query))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process terminates.
pub async fn run_server(bind: &str, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "http server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error mapping ============

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

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        let (status, code) = match &e {
            Error::Validation(_) | Error::Loader(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Error::Embedding(_) | Error::VectorStore(_) | Error::Llm(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code,
            message: e.to_string(),
        }
    }
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

// ============ POST /api/v1/chat ============

#[derive(Deserialize)]
struct ChatBody {
    query: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
    #[serde(default)]
    kb_id: Option<String>,
}

#[derive(Serialize)]
struct ChatResponseBody {
    answer: String,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Json<ChatResponseBody>, AppError> {
    let answer = state
        .agent
        .chat(&body.query, &body.history, body.kb_id.as_deref())
        .await
        .map_err(|e| match e {
            // Keep backend diagnostics short for chat callers.
            Error::Llm(_) | Error::Embedding(_) | Error::VectorStore(_) | Error::Timeout(_) => {
                AppError {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    code: "service_unavailable",
                    message: "the knowledge service is temporarily unavailable".to_string(),
                }
            }
            other => other.into(),
        })?;
    Ok(Json(ChatResponseBody { answer }))
}

// ============ GET /api/v1/health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    components: HealthComponents,
}

#[derive(Serialize)]
struct HealthComponents {
    llm: String,
    vectorstore: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let llm_up = state.llm.check_available().await;
    let store_up = state.store.check_available().await;

    let up_or_down = |up: bool| if up { "up" } else { "down" }.to_string();
    Json(HealthResponse {
        status: if llm_up && store_up { "ok" } else { "degraded" }.to_string(),
        components: HealthComponents {
            llm: up_or_down(llm_up),
            vectorstore: up_or_down(store_up),
        },
    })
}

// ============ Knowledge bases ============

#[derive(Deserialize)]
struct PageParams {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_size")]
    size: u32,
}

fn default_page() -> u32 {
    1
}
fn default_size() -> u32 {
    20
}

#[derive(Serialize)]
struct PagedKbs {
    items: Vec<KnowledgeBase>,
    total: u64,
    pages: u64,
}

async fn handle_list_kbs(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<PagedKbs>, AppError> {
    let (items, total) = state.manager.list_kbs(params.page, params.size).await?;
    Ok(Json(PagedKbs {
        items,
        total,
        pages: total.div_ceil(params.size.max(1) as u64),
    }))
}

async fn handle_create_kb(
    State(state): State<AppState>,
    Json(spec): Json<KbSpec>,
) -> Result<(StatusCode, Json<KnowledgeBase>), AppError> {
    let kb = state.manager.create_kb(spec).await?;
    Ok((StatusCode::CREATED, Json(kb)))
}

async fn handle_get_kb(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<KnowledgeBase>, AppError> {
    Ok(Json(state.manager.get_kb(&id).await?))
}

async fn handle_update_kb(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(patch): Json<KbPatch>,
) -> Result<Json<KnowledgeBase>, AppError> {
    Ok(Json(state.manager.update_kb(&id, patch).await?))
}

async fn handle_delete_kb(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, AppError> {
    state.manager.delete_kb(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Files ============

#[derive(Deserialize)]
struct FileListParams {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_size")]
    size: u32,
    status: Option<String>,
    query: Option<String>,
}

#[derive(Serialize)]
struct PagedFiles {
    items: Vec<FileEntity>,
    total: u64,
    pages: u64,
}

async fn handle_list_files(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Query(params): Query<FileListParams>,
) -> Result<Json<PagedFiles>, AppError> {
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(s) => Some(FileStatus::parse(s).ok_or_else(|| {
            AppError::from(Error::Validation(format!("unknown file status '{s}'")))
        })?),
    };

    let (items, total) = state
        .manager
        .list_files(&id, status, params.query.as_deref(), params.page, params.size)
        .await?;
    Ok(Json(PagedFiles {
        items,
        total,
        pages: total.div_ceil(params.size.max(1) as u64),
    }))
}

async fn handle_upload_files(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<FileEntity>>), AppError> {
    let mut uploaded = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::from(Error::Validation(format!("malformed multipart body: {e}")))
    })? {
        let Some(file_name) = field.file_name().map(|n| n.to_string()) else {
            continue;
        };
        let bytes = field.bytes().await.map_err(|e| {
            AppError::from(Error::Validation(format!("failed to read upload: {e}")))
        })?;
        let entity = state.manager.upload_file(&id, &file_name, &bytes).await?;
        uploaded.push(entity);
    }

    if uploaded.is_empty() {
        return Err(Error::Validation("no files in upload".to_string()).into());
    }
    Ok((StatusCode::CREATED, Json(uploaded)))
}

async fn handle_delete_file(
    State(state): State<AppState>,
    AxumPath((id, fid)): AxumPath<(String, String)>,
) -> Result<StatusCode, AppError> {
    state.manager.delete_file(&id, &fid).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ POST /api/v1/knowledge-bases/{id}/query ============

#[derive(Deserialize)]
struct QueryBody {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    similarity_threshold: Option<f32>,
}

async fn handle_query(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<QueryBody>,
) -> Result<Json<Vec<SearchHit>>, AppError> {
    let overrides = QueryOverrides {
        mode: None,
        top_k: body.top_k,
        similarity_threshold: body.similarity_threshold,
    };
    let hits = state.manager.query(&id, &body.query, &overrides).await?;
    Ok(Json(hits))
}
