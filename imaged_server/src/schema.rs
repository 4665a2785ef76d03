//! Diesel table definitions for the image build worker.
//!
//! Tables: builds, records.

diesel::table! {
    builds (id) {
        id -> Int8,
        name -> Varchar,
        revision -> Varchar,
        full_revision -> Nullable<Varchar>,
        status -> Varchar,
        created_at -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        finished_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    records (id) {
        id -> Int8,
        build_id -> Int8,
        file_name -> Varchar,
        s3_key -> Varchar,
    }
}

diesel::joinable!(records -> builds (build_id));

diesel::allow_tables_to_appear_in_same_query!(builds, records);
