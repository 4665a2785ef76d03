//! Build persistence: PostgreSQL implementation of the build store.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::models::build::{Build, BuildStatus, BuildWithRecords, NewBuild};
use crate::models::record::Record;
use crate::schema::builds;
use crate::services::record_service;
use crate::store::{check_finish, BuildStore, StoreError, RECENT_BUILDS_LIMIT};

pub type DbPool = Pool<AsyncPgConnection>;

/// Create a connection pool for the given database URL.
pub fn create_pool(database_url: &str, max_size: usize) -> anyhow::Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager).max_size(max_size).build()?;
    Ok(pool)
}

/// List the most recent builds, newest first.
pub async fn recent_builds(conn: &mut AsyncPgConnection) -> Result<Vec<Build>, StoreError> {
    let results = builds::table
        .order(builds::id.desc())
        .limit(RECENT_BUILDS_LIMIT)
        .load::<Build>(conn)
        .await?;
    Ok(results)
}

/// Get a build by ID.
pub async fn get_build(conn: &mut AsyncPgConnection, build_id: i64) -> Result<Build, StoreError> {
    builds::table
        .find(build_id)
        .first::<Build>(conn)
        .await
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("build {build_id}")))
}

/// Get the latest build of a template.
pub async fn last_build(
    conn: &mut AsyncPgConnection,
    name: &str,
) -> Result<Option<Build>, StoreError> {
    let result = builds::table
        .filter(builds::name.eq(name))
        .order(builds::id.desc())
        .first::<Build>(conn)
        .await
        .optional()?;
    Ok(result)
}

/// Create a new build in the `created` state.
pub async fn create_build(
    conn: &mut AsyncPgConnection,
    name: &str,
    revision: &str,
) -> Result<Build, StoreError> {
    let build = diesel::insert_into(builds::table)
        .values(&NewBuild {
            name,
            revision,
            status: BuildStatus::Created.as_str(),
        })
        .get_result::<Build>(conn)
        .await?;

    crate::metrics::build_status_changed(BuildStatus::Created.as_str());
    tracing::info!(
        build_id = build.id,
        template = %build.name,
        revision = %build.revision,
        "Build created"
    );

    Ok(build)
}

/// Move a build from `expected` to `next`, stamping the matching timestamp.
///
/// The update only matches rows still in `expected`, so a stale caller can
/// never move persisted state backwards.
async fn transition(
    conn: &mut AsyncPgConnection,
    build_id: i64,
    expected: BuildStatus,
    next: BuildStatus,
) -> Result<Build, StoreError> {
    if !expected.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            id: build_id,
            from: expected,
            to: next,
        });
    }

    let target = builds::table
        .filter(builds::id.eq(build_id))
        .filter(builds::status.eq(expected.as_str()));
    let now = Utc::now();

    let updated = if next == BuildStatus::Started {
        diesel::update(target)
            .set((builds::status.eq(next.as_str()), builds::started_at.eq(now)))
            .get_result::<Build>(conn)
            .await
            .optional()?
    } else {
        diesel::update(target)
            .set((builds::status.eq(next.as_str()), builds::finished_at.eq(now)))
            .get_result::<Build>(conn)
            .await
            .optional()?
    };

    match updated {
        Some(build) => Ok(build),
        None => {
            let current = get_build(conn, build_id).await?;
            Err(StoreError::InvalidTransition {
                id: build_id,
                from: current.status,
                to: next,
            })
        }
    }
}

/// Persist the resolved full revision. A revision is never cleared once set.
pub async fn update_full_revision(
    conn: &mut AsyncPgConnection,
    build: &Build,
) -> Result<(), StoreError> {
    let Some(full_revision) = build.full_revision.as_deref() else {
        return Ok(());
    };

    let rows = diesel::update(builds::table.find(build.id))
        .set(builds::full_revision.eq(full_revision))
        .execute(conn)
        .await?;

    if rows == 0 {
        return Err(StoreError::NotFound(format!("build {}", build.id)));
    }
    Ok(())
}

/// Build store backed by a diesel-async connection pool.
#[derive(Clone)]
pub struct PgBuildStore {
    pool: DbPool,
}

impl PgBuildStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

#[async_trait]
impl BuildStore for PgBuildStore {
    async fn recent_builds(&self) -> Result<Vec<Build>, StoreError> {
        let mut conn = self.conn().await?;
        recent_builds(&mut conn).await
    }

    async fn get_build(&self, id: i64) -> Result<Build, StoreError> {
        let mut conn = self.conn().await?;
        get_build(&mut conn, id).await
    }

    async fn get_build_full(&self, id: i64) -> Result<BuildWithRecords, StoreError> {
        let mut conn = self.conn().await?;
        let build = get_build(&mut conn, id).await?;
        let records = record_service::list_for_build(&mut conn, id).await?;
        Ok(BuildWithRecords { build, records })
    }

    async fn last_build(&self, name: &str) -> Result<Option<Build>, StoreError> {
        let mut conn = self.conn().await?;
        last_build(&mut conn, name).await
    }

    async fn create_build(&self, name: &str, revision: &str) -> Result<Build, StoreError> {
        let mut conn = self.conn().await?;
        create_build(&mut conn, name, revision).await
    }

    async fn start_build(&self, build: &mut Build) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        *build = transition(&mut conn, build.id, BuildStatus::Created, BuildStatus::Started).await?;
        Ok(())
    }

    async fn finish_build(&self, build: &mut Build) -> Result<(), StoreError> {
        check_finish(build)?;
        let mut conn = self.conn().await?;
        *build = transition(&mut conn, build.id, BuildStatus::Started, build.status).await?;
        Ok(())
    }

    async fn update_build(&self, build: &Build) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        update_full_revision(&mut conn, build).await
    }

    async fn create_record(
        &self,
        build: &Build,
        file_name: &str,
        s3_key: &str,
    ) -> Result<Record, StoreError> {
        let mut conn = self.conn().await?;
        record_service::create_record(&mut conn, build.id, file_name, s3_key).await
    }

    async fn get_record(&self, id: i64) -> Result<Record, StoreError> {
        let mut conn = self.conn().await?;
        record_service::get_record(&mut conn, id).await
    }

    async fn get_record_named(
        &self,
        build_id: i64,
        file_name: &str,
    ) -> Result<Record, StoreError> {
        let mut conn = self.conn().await?;
        record_service::get_record_named(&mut conn, build_id, file_name).await
    }
}
