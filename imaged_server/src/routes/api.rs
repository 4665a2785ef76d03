//! Build and record operations behind the HTTP routes.
//!
//! Each function validates its input, talks to the store, storage, or worker,
//! and returns a typed result; rendering lives in the handlers.

use serde::{Deserialize, Serialize};

use crate::models::build::{is_valid_template_name, Build, BuildWithRecords};
use crate::models::record::{is_valid_record_name, Record};
use crate::services::harvest;
use crate::services::worker::{Job, Worker};
use crate::storage::{ArtifactStore, PUBLIC_URL_TTL};
use crate::store::BuildStore;

use super::error::ApiError;

/// The 20 most recent builds, newest first.
pub async fn list_builds(store: &dyn BuildStore) -> Result<Vec<Build>, ApiError> {
    Ok(store.recent_builds().await?)
}

pub async fn get_build(store: &dyn BuildStore, id: i64) -> Result<BuildWithRecords, ApiError> {
    Ok(store.get_build_full(id).await?)
}

/// Most recently created build of a template.
pub async fn last_build(store: &dyn BuildStore, name: &str) -> Result<Build, ApiError> {
    if name.is_empty() {
        return Err(ApiError::InvalidArgument("name is required".into()));
    }

    store
        .last_build(name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("template {name} does not have any builds yet")))
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub name: String,
    pub revision: String,
}

/// Create a build and hand it to the worker.
///
/// The worker slot is claimed first, so a busy worker leaves no build behind.
pub async fn start_build(
    store: &dyn BuildStore,
    worker: &Worker,
    req: StartRequest,
) -> Result<Build, ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::InvalidArgument("name is required".into()));
    }
    if !is_valid_template_name(&req.name) {
        return Err(ApiError::InvalidArgument(format!(
            "invalid template name '{}'",
            req.name
        )));
    }
    if req.revision.is_empty() {
        return Err(ApiError::InvalidArgument("revision is required".into()));
    }

    let slot = worker.reserve()?;
    let build = store.create_build(&req.name, &req.revision).await?;
    slot.send(Job::new(build.clone()));

    tracing::info!(
        build_id = build.id,
        template = %build.name,
        revision = %build.revision,
        "Build submitted"
    );
    Ok(build)
}

/// How a caller names a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordRef {
    Id(i64),
    Named { build_id: i64, file_name: String },
}

async fn fetch_record(store: &dyn BuildStore, record: &RecordRef) -> Result<Record, ApiError> {
    match record {
        RecordRef::Id(id) if *id <= 0 => Err(ApiError::InvalidArgument(format!(
            "invalid record id {id}"
        ))),
        RecordRef::Id(id) => Ok(store.get_record(*id).await?),
        RecordRef::Named { file_name, .. } if file_name.is_empty() => {
            Err(ApiError::InvalidArgument("file_name is required".into()))
        }
        RecordRef::Named {
            build_id,
            file_name,
        } => Ok(store.get_record_named(*build_id, file_name).await?),
    }
}

/// A record together with its stored bytes.
#[derive(Debug)]
pub struct Download {
    pub record: Record,
    pub contents: Vec<u8>,
}

pub async fn download_record(
    store: &dyn BuildStore,
    storage: &dyn ArtifactStore,
    record: RecordRef,
) -> Result<Download, ApiError> {
    let record = fetch_record(store, &record).await?;
    let contents = storage.download_bytes(&record.s3_key).await?;
    Ok(Download { record, contents })
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RecordUrl {
    pub url: String,
}

/// Presigned URL for a record, valid for an hour.
pub async fn record_url(
    store: &dyn BuildStore,
    storage: &dyn ArtifactStore,
    record: RecordRef,
) -> Result<RecordUrl, ApiError> {
    let record = fetch_record(store, &record).await?;
    let url = storage.public_url(&record.s3_key, PUBLIC_URL_TTL).await?;
    Ok(RecordUrl { url })
}

/// Upload a file produced outside the worker and record it against a build.
pub async fn attach_record(
    store: &dyn BuildStore,
    storage: &dyn ArtifactStore,
    build_id: i64,
    file_name: &str,
    contents: Vec<u8>,
) -> Result<Record, ApiError> {
    if file_name.is_empty() {
        return Err(ApiError::InvalidArgument("file_name is required".into()));
    }
    if !is_valid_record_name(file_name) {
        return Err(ApiError::InvalidArgument(format!(
            "invalid file name '{file_name}'"
        )));
    }

    let build = store.get_build(build_id).await?;
    let record = harvest::attach_record(store, storage, &build, file_name, contents).await?;
    crate::metrics::record_attached(true);

    tracing::info!(build_id, file_name, record_id = record.id, "Record attached");
    Ok(record)
}
