//! Build store: persistence boundary for builds and their records.
//!
//! The executor and the API only talk to [`BuildStore`]; the PostgreSQL
//! implementation lives in `services::build_service`.

use async_trait::async_trait;

use crate::models::build::{Build, BuildStatus, BuildWithRecords};
use crate::models::record::Record;

/// Number of builds returned by [`BuildStore::recent_builds`].
pub const RECENT_BUILDS_LIMIT: i64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("build {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: BuildStatus,
        to: BuildStatus,
    },

    #[error("database pool: {0}")]
    Pool(String),

    #[error("database: {0}")]
    Database(#[from] diesel::result::Error),
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Most recent builds, newest first.
    async fn recent_builds(&self) -> Result<Vec<Build>, StoreError>;

    async fn get_build(&self, id: i64) -> Result<Build, StoreError>;

    /// A build and all of its records.
    async fn get_build_full(&self, id: i64) -> Result<BuildWithRecords, StoreError>;

    /// Most recently created build of a template, if any.
    async fn last_build(&self, name: &str) -> Result<Option<Build>, StoreError>;

    /// Insert a build in the `created` state.
    async fn create_build(&self, name: &str, revision: &str) -> Result<Build, StoreError>;

    /// Persist `started` with a start timestamp. Refreshes `build` in place.
    async fn start_build(&self, build: &mut Build) -> Result<(), StoreError>;

    /// Persist the terminal status carried by `build` with a finish timestamp.
    ///
    /// `build.status` must be `succeeded` or `failed` and the persisted build
    /// must be `started`; otherwise nothing is written. Refreshes `build` in
    /// place.
    async fn finish_build(&self, build: &mut Build) -> Result<(), StoreError>;

    /// Persist mutable fields. Currently only the resolved full revision.
    async fn update_build(&self, build: &Build) -> Result<(), StoreError>;

    async fn create_record(
        &self,
        build: &Build,
        file_name: &str,
        s3_key: &str,
    ) -> Result<Record, StoreError>;

    async fn get_record(&self, id: i64) -> Result<Record, StoreError>;

    async fn get_record_named(&self, build_id: i64, file_name: &str)
        -> Result<Record, StoreError>;
}

/// Validate the status carried by `build` for a finish transition.
pub(crate) fn check_finish(build: &Build) -> Result<(), StoreError> {
    if build.status.is_terminal() {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            id: build.id,
            from: BuildStatus::Started,
            to: build.status,
        })
    }
}
