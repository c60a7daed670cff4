use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error};

use glico_core::docstore::{DocumentStore, split_document_path, validate_collection_path};

const BODY_LIMIT: usize = 2 * 1024 * 1024; // 2 MB, far above any single day

#[derive(Clone)]
pub(crate) struct AppState {
    docs: Arc<Mutex<DocumentStore>>,
    api_key: Option<String>,
}

impl AppState {
    pub(crate) fn new(docs: DocumentStore, api_key: Option<String>) -> Self {
        Self {
            docs: Arc::new(Mutex::new(docs)),
            api_key,
        }
    }
}

#[derive(Deserialize)]
struct RangeParams {
    start: String,
    end: String,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct RangeItem {
    pub id: String,
    pub data: serde_json::Value,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(err) => {
                error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

fn bad_path(err: &anyhow::Error) -> ApiError {
    ApiError::BadRequest(format!("{err}"))
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn namespace_exists(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> Result<StatusCode, ApiError> {
    let docs = state.docs.lock().unwrap_or_else(PoisonError::into_inner);
    let exists = docs
        .namespace_exists(&namespace)
        .map_err(|e| bad_path(&e))?;
    if exists {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::NotFound(format!("No documents under '{namespace}'")))
    }
}

async fn get_document(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    split_document_path(&path).map_err(|e| bad_path(&e))?;
    let body = {
        let docs = state.docs.lock().unwrap_or_else(PoisonError::into_inner);
        docs.get(&path).context("database error")?
    };
    let body = body.ok_or_else(|| ApiError::NotFound(format!("Document '{path}' not found")))?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

async fn put_document(
    State(state): State<AppState>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    split_document_path(&path).map_err(|e| bad_path(&e))?;
    if serde_json::from_slice::<serde_json::Value>(&body).is_err() {
        return Err(ApiError::BadRequest(
            "Document body must be valid JSON".to_string(),
        ));
    }
    let docs = state.docs.lock().unwrap_or_else(PoisonError::into_inner);
    docs.put(&path, &body).context("database error")?;
    debug!(%path, bytes = body.len(), "document stored");
    Ok(StatusCode::NO_CONTENT)
}

async fn range_query(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<RangeItem>>, ApiError> {
    validate_collection_path(&collection).map_err(|e| bad_path(&e))?;
    let rows = {
        let docs = state.docs.lock().unwrap_or_else(PoisonError::into_inner);
        docs.range(&collection, &params.start, &params.end)
            .context("database error")?
    };
    let items = rows
        .into_iter()
        .map(|(id, body)| {
            let data = serde_json::from_slice(&body)
                .with_context(|| format!("stored document '{collection}/{id}' is not JSON"))?;
            Ok(RangeItem { id, data })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(items))
}

// --- Router builder ---

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/namespaces/{*namespace}", get(namespace_exists))
        .route(
            "/api/documents/{*path}",
            get(get_document).put(put_document),
        )
        .route("/api/collections/{*path}", get(range_query))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

/// First and last four characters of `key`; short keys are fully hidden.
fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 12 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

pub async fn start_server(
    docs: DocumentStore,
    port: u16,
    bind: &str,
    api_key: Option<String>,
    new_api_key: bool,
) -> anyhow::Result<()> {
    let app = build_router(AppState::new(docs, api_key.clone()));

    if let Some(ref key) = api_key {
        if new_api_key {
            eprintln!("Generated new API key: {key}");
            eprintln!("Clients need: GLICO_API_KEY={key}");
        } else {
            eprintln!(
                "API key: {} (see api_key file in data directory)",
                mask_key(key)
            );
        }
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("Failed to bind {bind}:{port}"))?;
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}
