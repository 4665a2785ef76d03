//! Image build HTTP routes.

pub mod api;
pub mod error;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::models::build::{Build, BuildWithRecords};
use crate::models::record::Record;
use crate::services::worker::Worker;
use crate::storage::ArtifactStore;
use crate::store::BuildStore;

use self::api::RecordRef;
use self::error::ApiError;

/// Largest record body accepted by the attach route.
const MAX_RECORD_BYTES: usize = 512 * 1024 * 1024;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BuildStore>,
    pub storage: Arc<dyn ArtifactStore>,
    pub worker: Worker,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Builds
        .route("/api/builds", get(list_builds).post(start_build))
        .route("/api/builds/last", get(last_build))
        .route("/api/builds/{build_id}", get(get_build))
        // Records
        .route(
            "/api/builds/{build_id}/records",
            post(attach_record).layer(DefaultBodyLimit::max(MAX_RECORD_BYTES)),
        )
        .route(
            "/api/builds/{build_id}/records/{file_name}",
            get(download_named_record),
        )
        .route(
            "/api/builds/{build_id}/records/{file_name}/url",
            get(named_record_url),
        )
        .route("/api/records/{record_id}", get(download_record))
        .route("/api/records/{record_id}/url", get(record_url))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ── Builds ──

async fn list_builds(State(state): State<AppState>) -> Result<Json<Vec<Build>>, ApiError> {
    api::list_builds(state.store.as_ref()).await.map(Json)
}

async fn start_build(
    State(state): State<AppState>,
    Json(req): Json<api::StartRequest>,
) -> Result<(StatusCode, Json<Build>), ApiError> {
    api::start_build(state.store.as_ref(), &state.worker, req)
        .await
        .map(|build| (StatusCode::CREATED, Json(build)))
}

#[derive(serde::Deserialize)]
pub struct LastBuildQuery {
    pub name: Option<String>,
}

async fn last_build(
    State(state): State<AppState>,
    Query(query): Query<LastBuildQuery>,
) -> Result<Json<Build>, ApiError> {
    let name = query.name.unwrap_or_default();
    api::last_build(state.store.as_ref(), &name).await.map(Json)
}

async fn get_build(
    State(state): State<AppState>,
    Path(build_id): Path<i64>,
) -> Result<Json<BuildWithRecords>, ApiError> {
    api::get_build(state.store.as_ref(), build_id).await.map(Json)
}

// ── Records ──

#[derive(serde::Deserialize)]
pub struct AttachQuery {
    pub file_name: Option<String>,
}

async fn attach_record(
    State(state): State<AppState>,
    Path(build_id): Path<i64>,
    Query(query): Query<AttachQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<Record>), ApiError> {
    let file_name = query.file_name.unwrap_or_default();
    api::attach_record(
        state.store.as_ref(),
        state.storage.as_ref(),
        build_id,
        &file_name,
        body.to_vec(),
    )
    .await
    .map(|record| (StatusCode::CREATED, Json(record)))
}

async fn download_named_record(
    State(state): State<AppState>,
    Path((build_id, file_name)): Path<(i64, String)>,
) -> Result<impl IntoResponse, ApiError> {
    download(&state, RecordRef::Named { build_id, file_name }).await
}

async fn download_record(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    download(&state, RecordRef::Id(record_id)).await
}

async fn download(state: &AppState, record: RecordRef) -> Result<impl IntoResponse, ApiError> {
    let download =
        api::download_record(state.store.as_ref(), state.storage.as_ref(), record).await?;

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (
            header::CONTENT_DISPOSITION,
            content_disposition(&download.record.file_name),
        ),
    ];
    Ok((headers, download.contents))
}

/// `attachment` disposition with the file name quoted and escaped.
fn content_disposition(file_name: &str) -> String {
    let escaped: String = file_name
        .chars()
        .filter(|c| !c.is_control())
        .flat_map(|c| match c {
            '"' | '\\' => vec!['\\', c],
            c => vec![c],
        })
        .collect();
    format!("attachment; filename=\"{escaped}\"")
}

async fn named_record_url(
    State(state): State<AppState>,
    Path((build_id, file_name)): Path<(i64, String)>,
) -> Result<Json<api::RecordUrl>, ApiError> {
    let record = RecordRef::Named { build_id, file_name };
    api::record_url(state.store.as_ref(), state.storage.as_ref(), record)
        .await
        .map(Json)
}

async fn record_url(
    State(state): State<AppState>,
    Path(record_id): Path<i64>,
) -> Result<Json<api::RecordUrl>, ApiError> {
    api::record_url(
        state.store.as_ref(),
        state.storage.as_ref(),
        RecordRef::Id(record_id),
    )
    .await
    .map(Json)
}
