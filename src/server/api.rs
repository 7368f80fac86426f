use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::errors::{MISSING_RELATION_CODE, ROW_NOT_FOUND_CODE, StoreError, UploadError};
use crate::store::blob::{BlobStore, FsBlobStore};
use crate::store::sqlite::SqliteStore;
use crate::store::{ChangeEvent, Filter, RemoteStore, Row};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub blobs: Arc<FsBlobStore>,
    pub changes: broadcast::Sender<ChangeEvent>,
}

impl AppState {
    pub fn new(store: Arc<SqliteStore>, blobs: Arc<FsBlobStore>) -> Self {
        let changes = store.change_sender();
        Self {
            store,
            blobs,
            changes,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Query types ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RowsQuery {
    pub column: Option<String>,
    pub value: Option<String>,
}

impl RowsQuery {
    fn filter(self) -> Result<Filter, ApiError> {
        match (self.column, self.value) {
            (None, None) => Ok(Filter::All),
            (Some(column), Some(value)) => Ok(Filter::eq(column, value)),
            _ => Err(ApiError::BadRequest(
                "column and value must be given together".into(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BlobQuery {
    pub expires: i64,
    pub sig: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound { message: String, code: String },
    BadRequest(String),
    Conflict { message: String, code: String },
    Forbidden(String),
    Internal { message: String, code: String },
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let StoreError { code, message } = err;
        if code == MISSING_RELATION_CODE || code == ROW_NOT_FOUND_CODE {
            ApiError::NotFound { message, code }
        } else if code.starts_with("23") {
            ApiError::Conflict { message, code }
        } else if code.starts_with("42") {
            ApiError::BadRequest(message)
        } else {
            ApiError::Internal { message, code }
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Expired | UploadError::BadSignature => ApiError::Forbidden(err.to_string()),
            UploadError::InvalidPath(_) => ApiError::BadRequest(err.to_string()),
            UploadError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => ApiError::NotFound {
                message: "blob not found".into(),
                code: ROW_NOT_FOUND_CODE.into(),
            },
            other => ApiError::Internal {
                message: other.to_string(),
                code: "internal".into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound { message, code } => (
                StatusCode::NOT_FOUND,
                serde_json::json!({"error": message, "code": code}),
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": message}),
            ),
            ApiError::Conflict { message, code } => (
                StatusCode::CONFLICT,
                serde_json::json!({"error": message, "code": code}),
            ),
            ApiError::Forbidden(message) => (
                StatusCode::FORBIDDEN,
                serde_json::json!({"error": message}),
            ),
            ApiError::Internal { message, code } => {
                tracing::error!(code = %code, error = %message, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({"error": message, "code": code}),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/tables", get(list_tables))
        .route("/api/tables/{table}/rows", get(list_rows).post(insert_row))
        .route(
            "/api/tables/{table}/rows/{id}",
            get(get_row).patch(update_row).delete(delete_row),
        )
        .route("/api/blobs/{*path}", get(download_blob))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn into_row(body: Value) -> Result<Row, ApiError> {
    match body {
        Value::Object(row) => Ok(row),
        _ => Err(ApiError::BadRequest("request body must be a JSON object".into())),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_tables(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let tables = state
        .store
        .db()
        .call(|db| db.list_tables())
        .await
        .map_err(|e| ApiError::from(StoreError::from(e)))?;
    Ok(Json(tables))
}

async fn list_rows(
    State(state): State<SharedState>,
    Path(table): Path<String>,
    Query(query): Query<RowsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = query.filter()?;
    let rows = state.store.select(&table, &filter).await?;
    Ok(Json(rows))
}

async fn get_row(
    State(state): State<SharedState>,
    Path((table, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let row = state
        .store
        .select(&table, &Filter::eq("id", id.clone()))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::from(StoreError::row_not_found(&table, &id)))?;
    Ok(Json(row))
}

async fn insert_row(
    State(state): State<SharedState>,
    Path(table): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let row = into_row(body)?;
    let inserted = state.store.insert(&table, row).await?;
    Ok((StatusCode::CREATED, Json(inserted)))
}

async fn update_row(
    State(state): State<SharedState>,
    Path((table, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let patch = into_row(body)?;
    let updated = state.store.update(&table, &id, patch).await?;
    Ok(Json(updated))
}

async fn delete_row(
    State(state): State<SharedState>,
    Path((table, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.delete(&table, &id).await? {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(StoreError::row_not_found(&table, &id).into()),
    }
}

// ── Signed blob download ──────────────────────────────────────────────

async fn download_blob(
    State(state): State<SharedState>,
    Path(path): Path<String>,
    Query(query): Query<BlobQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .blobs
        .verify(&path, query.expires, &query.sig, Utc::now())?;
    let bytes = state.blobs.read(&path).await?;
    let content_type = mime_guess::from_path(&path).first_or_octet_stream();
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type.essence_str().to_string())],
        bytes,
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────
