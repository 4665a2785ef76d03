//! Record persistence.

use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::models::record::{NewRecord, Record};
use crate::schema::records;
use crate::store::StoreError;

/// Record a file that has already been uploaded to storage.
pub async fn create_record(
    conn: &mut AsyncPgConnection,
    build_id: i64,
    file_name: &str,
    s3_key: &str,
) -> Result<Record, StoreError> {
    let result = diesel::insert_into(records::table)
        .values(&NewRecord {
            build_id,
            file_name,
            s3_key,
        })
        .get_result::<Record>(conn)
        .await?;
    Ok(result)
}

/// List records for a build.
pub async fn list_for_build(
    conn: &mut AsyncPgConnection,
    build_id: i64,
) -> Result<Vec<Record>, StoreError> {
    let results = records::table
        .filter(records::build_id.eq(build_id))
        .order(records::id.asc())
        .load::<Record>(conn)
        .await?;
    Ok(results)
}

/// Get a record by ID.
pub async fn get_record(conn: &mut AsyncPgConnection, id: i64) -> Result<Record, StoreError> {
    records::table
        .find(id)
        .first::<Record>(conn)
        .await
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("record {id}")))
}

/// Get a build's record by file name.
pub async fn get_record_named(
    conn: &mut AsyncPgConnection,
    build_id: i64,
    file_name: &str,
) -> Result<Record, StoreError> {
    records::table
        .filter(records::build_id.eq(build_id))
        .filter(records::file_name.eq(file_name))
        .first::<Record>(conn)
        .await
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("record '{file_name}' of build {build_id}")))
}
