use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use seekr_core::query::ParseNote;
use seekr_core::{Document, IndexMode, IndexStatus, SearchResponse, Seekr, TermTarget};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: String,
    pub limit: Option<usize>,
    /// `name` or `content` to match free words against one field.
    pub field: Option<String>,
}

#[derive(Serialize)]
pub struct SearchReply {
    pub query: String,
    pub notes: Vec<ParseNote>,
    #[serde(flatten)]
    pub response: SearchResponse,
}

#[derive(Deserialize)]
pub struct DocParams {
    pub path: String,
}

#[derive(Deserialize, Default)]
pub struct PathsBody {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub incremental: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub seekr: Arc<Seekr>,
    pub admin_token: Option<String>,
}

/// Router over `seekr`, with the admin token and CORS origins taken from
/// `ADMIN_TOKEN` and `CORS_ALLOW_ORIGIN`.
pub fn build_app(seekr: Arc<Seekr>) -> Router {
    let admin_token = std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty());
    build_router(AppState { seekr, admin_token })
}

pub fn build_router(state: AppState) -> Router {
    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/search", get(search_handler))
        .route("/stats", get(stats_handler))
        .route("/doc", get(doc_handler))
        .route("/index", post(index_handler))
        .route("/index/clear", post(clear_handler))
        .route("/reindex", post(reindex_handler))
        .route("/cancel", post(cancel_handler))
        .route("/watch/start", post(watch_start_handler))
        .route("/watch/stop", post(watch_stop_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub async fn search_handler(State(state): State<AppState>, Query(params): Query<SearchParams>) -> ApiResult<SearchReply> {
    let max = state.seekr.config().max_results;
    let limit = params.limit.unwrap_or(max).clamp(1, max);
    let target = match params.field.as_deref() {
        None | Some("any") => None,
        Some("name") | Some("filename") => Some(TermTarget::Filename),
        Some("content") => Some(TermTarget::Content),
        Some(other) => return Err((StatusCode::BAD_REQUEST, format!("unknown field {other}"))),
    };
    let seekr = state.seekr.clone();
    // Scoring is CPU-bound; keep it off the async workers.
    tokio::task::spawn_blocking(move || {
        let mut query = seekr.parse(&params.q);
        if let (Some(target), Some(root)) = (target, &mut query.root) {
            root.restrict_to(target);
        }
        let response = seekr.search_query(&query, limit);
        Json(SearchReply { query: params.q, notes: query.notes, response })
    })
    .await
    .map_err(internal)
}

pub async fn stats_handler(State(state): State<AppState>) -> Json<IndexStatus> {
    Json(state.seekr.index_stats())
}

pub async fn doc_handler(State(state): State<AppState>, Query(params): Query<DocParams>) -> ApiResult<Document> {
    match state.seekr.file_info(std::path::Path::new(&params.path)) {
        Some(doc) => Ok(Json(doc.as_ref().clone())),
        None => Err((StatusCode::NOT_FOUND, format!("{} is not indexed", params.path))),
    }
}

async fn index_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<PathsBody>>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    authorize(&state, &headers)?;
    let Json(body) = body.unwrap_or_default();
    let paths = if body.paths.is_empty() { state.seekr.config().watch_paths.clone() } else { body.paths };
    if paths.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no paths given and no watch_paths configured".into()));
    }
    if body.incremental {
        let seekr = state.seekr.clone();
        let stats = tokio::task::spawn_blocking(move || seekr.index_now(paths, IndexMode::Incremental))
            .await
            .map_err(internal)?
            .map_err(internal)?;
        return Ok((StatusCode::OK, Json(serde_json::json!({ "stats": stats }))));
    }
    state.seekr.start_index(paths).map_err(internal)?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "queued": true }))))
}

async fn reindex_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    authorize(&state, &headers)?;
    state.seekr.reindex_all().map_err(internal)?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "queued": true }))))
}

async fn clear_handler(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<serde_json::Value> {
    authorize(&state, &headers)?;
    let seekr = state.seekr.clone();
    let generation = tokio::task::spawn_blocking(move || seekr.clear_index())
        .await
        .map_err(internal)?
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "generation": generation })))
}

async fn cancel_handler(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<serde_json::Value> {
    authorize(&state, &headers)?;
    state.seekr.cancel_index();
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

async fn watch_start_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<PathsBody>>,
) -> ApiResult<serde_json::Value> {
    authorize(&state, &headers)?;
    let Json(body) = body.unwrap_or_default();
    state
        .seekr
        .watch_start(body.paths)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(serde_json::json!({ "watcher": state.seekr.watcher_state() })))
}

async fn watch_stop_handler(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<serde_json::Value> {
    authorize(&state, &headers)?;
    state.seekr.watch_stop();
    Ok(Json(serde_json::json!({ "watcher": state.seekr.watcher_state() })))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let required = match &state.admin_token {
        Some(t) => t,
        None => return Err((StatusCode::UNAUTHORIZED, "ADMIN_TOKEN not set".into())),
    };
    let provided = headers.get("X-ADMIN-TOKEN").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided == required {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "invalid admin token".into()))
    }
}
