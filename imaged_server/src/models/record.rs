//! records: files kept from a build (the build log and tool-produced artifacts).

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::records;

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = records)]
pub struct Record {
    pub id: i64,
    pub build_id: i64,
    pub file_name: String,
    pub s3_key: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = records)]
pub struct NewRecord<'a> {
    pub build_id: i64,
    pub file_name: &'a str,
    pub s3_key: &'a str,
}

/// Storage key for a build's record file.
///
/// Pure function of the build ID and the file name, so the location of any
/// record can be rebuilt without a lookup.
pub fn record_key(build_id: i64, file_name: &str) -> String {
    format!("records/{build_id}/{file_name}")
}

/// Record names are a single path component that can be quoted in a header.
pub fn is_valid_record_name(name: &str) -> bool {
    crate::models::build::is_valid_template_name(name)
        && !name.contains('"')
        && !name.chars().any(char::is_control)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_names_are_single_quotable_components() {
        assert!(is_valid_record_name("manifest.json"));
        assert!(is_valid_record_name("image id.txt"));
        assert!(!is_valid_record_name(""));
        assert!(!is_valid_record_name(".."));
        assert!(!is_valid_record_name("a/b"));
        assert!(!is_valid_record_name("a\\b"));
        assert!(!is_valid_record_name("say\"hi\".txt"));
        assert!(!is_valid_record_name("line\nbreak"));
    }

    #[test]
    fn record_key_is_derived_from_build_and_file() {
        assert_eq!(record_key(42, "x.log"), "records/42/x.log");
        assert_eq!(record_key(1, "build.log"), "records/1/build.log");
    }

    #[test]
    fn record_key_is_stable() {
        assert_eq!(record_key(7, "manifest.json"), record_key(7, "manifest.json"));
        assert_ne!(record_key(7, "manifest.json"), record_key(8, "manifest.json"));
    }
}
