//! builds: a requested execution of a named template at a revision.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::record::{record_key, Record};
use crate::schema::builds;

/// Lifecycle of a build. Moves strictly forward:
/// `created → started → {succeeded | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Created,
    Started,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Created => "created",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Succeeded | BuildStatus::Failed)
    }

    /// Whether a persisted build in `self` may move to `next`.
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        matches!(
            (self, next),
            (BuildStatus::Created, BuildStatus::Started)
                | (BuildStatus::Started, BuildStatus::Succeeded)
                | (BuildStatus::Started, BuildStatus::Failed)
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown build status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for BuildStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(BuildStatus::Created),
            "started" => Ok(BuildStatus::Started),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for BuildStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = builds)]
pub struct Build {
    pub id: i64,
    pub name: String,
    pub revision: String,
    pub full_revision: Option<String>,
    #[diesel(deserialize_as = String)]
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    /// Storage key for one of this build's record files.
    pub fn record_key(&self, file_name: &str) -> String {
        record_key(self.id, file_name)
    }

    /// Wall-clock time between start and finish, once both are known.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(finish)) => Some((finish - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = builds)]
pub struct NewBuild<'a> {
    pub name: &'a str,
    pub revision: &'a str,
    pub status: &'a str,
}

/// A build together with every record attached to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildWithRecords {
    #[serde(flatten)]
    pub build: Build,
    pub records: Vec<Record>,
}

/// Template names are a single path component inside `templates/`.
pub fn is_valid_template_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}
