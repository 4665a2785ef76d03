//! Schema migration for the builds and records tables.

use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};

/// SQL migration for the build history.
///
/// Idempotent: safe to run on every start with `--migrate`.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS builds (
    id              BIGSERIAL PRIMARY KEY,
    name            VARCHAR(255) NOT NULL,
    revision        VARCHAR(255) NOT NULL,
    full_revision   VARCHAR(64),
    status          VARCHAR(16) NOT NULL DEFAULT 'created'
                    CHECK (status IN ('created', 'started', 'succeeded', 'failed')),
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at      TIMESTAMPTZ,
    finished_at     TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_builds_name ON builds (name, id DESC);

CREATE TABLE IF NOT EXISTS records (
    id              BIGSERIAL PRIMARY KEY,
    build_id        BIGINT NOT NULL REFERENCES builds(id),
    file_name       VARCHAR(255) NOT NULL,
    s3_key          VARCHAR(512) NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_records_build_file ON records (build_id, file_name);
"#;

/// Apply the migration on a single connection.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL).await?;
    Ok(())
}
