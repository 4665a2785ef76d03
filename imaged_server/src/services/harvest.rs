//! Record harvest: upload files left by a build and record them.

use std::path::{Path, PathBuf};

use crate::models::build::Build;
use crate::models::record::Record;
use crate::storage::{ArtifactStore, StorageError};
use crate::store::{BuildStore, StoreError};

/// File name the captured build log is recorded under.
pub const BUILD_LOG: &str = "build.log";

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not upload record: {0}")]
    Upload(#[from] StorageError),

    #[error("could not save record: {0}")]
    Save(#[from] StoreError),
}

/// Upload `contents` under the build's key for `file_name` and create its record.
pub async fn attach_record(
    store: &dyn BuildStore,
    storage: &dyn ArtifactStore,
    build: &Build,
    file_name: &str,
    contents: Vec<u8>,
) -> Result<Record, AttachError> {
    let key = build.record_key(file_name);
    storage.upload(&key, contents).await?;
    let record = store.create_record(build, file_name, &key).await?;
    Ok(record)
}

async fn attach_file(
    store: &dyn BuildStore,
    storage: &dyn ArtifactStore,
    build: &Build,
    file_name: &str,
    path: &Path,
) -> Result<Record, AttachError> {
    let contents = tokio::fs::read(path)
        .await
        .map_err(|source| AttachError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    attach_record(store, storage, build, file_name, contents).await
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HarvestSummary {
    pub attached: usize,
    pub failed: usize,
}

impl HarvestSummary {
    fn tally(&mut self, build: &Build, file_name: &str, result: Result<Record, AttachError>) {
        match result {
            Ok(record) => {
                self.attached += 1;
                crate::metrics::record_attached(true);
                tracing::debug!(
                    build_id = build.id,
                    record_id = record.id,
                    file_name,
                    "Record attached"
                );
            }
            Err(e) => {
                self.failed += 1;
                crate::metrics::record_attached(false);
                tracing::warn!(build_id = build.id, file_name, "Skipping record: {e}");
            }
        }
    }
}

/// Attach every regular file in `records_dir`, then the build log.
///
/// A records file named like the build log is skipped so it cannot replace
/// the captured log.
///
/// A file that cannot be read, uploaded, or recorded is logged and skipped;
/// the rest of the batch still runs.
pub async fn harvest(
    store: &dyn BuildStore,
    storage: &dyn ArtifactStore,
    build: &Build,
    records_dir: &Path,
    log_path: &Path,
) -> HarvestSummary {
    let mut summary = HarvestSummary::default();

    for (file_name, path) in list_files(build, records_dir).await {
        if file_name == BUILD_LOG {
            tracing::warn!(
                build_id = build.id,
                file_name = %file_name,
                "Skipping record that would replace the build log"
            );
            crate::metrics::record_attached(false);
            summary.failed += 1;
            continue;
        }
        let result = attach_file(store, storage, build, &file_name, &path).await;
        summary.tally(build, &file_name, result);
    }

    let result = attach_file(store, storage, build, BUILD_LOG, log_path).await;
    summary.tally(build, BUILD_LOG, result);

    summary
}

/// Regular files directly inside `dir`, sorted by name.
async fn list_files(build: &Build, dir: &Path) -> Vec<(String, PathBuf)> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(build_id = build.id, dir = %dir.display(), "Could not list records: {e}");
            return Vec::new();
        }
    };

    let mut files = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(build_id = build.id, "Could not read records entry: {e}");
                break;
            }
        };

        // Symlinks are skipped, not followed.
        match entry.file_type().await {
            Ok(file_type) if file_type.is_file() => {}
            _ => continue,
        }
        let path = entry.path();

        match entry.file_name().into_string() {
            Ok(name) => files.push((name, path)),
            Err(name) => {
                tracing::warn!(build_id = build.id, file_name = ?name, "Skipping non UTF-8 record name");
            }
        }
    }

    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::build::BuildStatus;
    use crate::storage::memory::MemoryArtifactStore;
    use crate::store::memory::MemoryBuildStore;

    async fn started_build(store: &MemoryBuildStore) -> Build {
        let mut build = store.create_build("base", "main").await.unwrap();
        store.start_build(&mut build).await.unwrap();
        build
    }

    fn write_outputs(dir: &Path, names: &[&str]) -> (PathBuf, PathBuf) {
        let records = dir.join("records");
        std::fs::create_dir_all(&records).unwrap();
        for name in names {
            std::fs::write(records.join(name), format!("contents of {name}")).unwrap();
        }
        let log = dir.join(BUILD_LOG);
        std::fs::write(&log, "packer output\n").unwrap();
        (records, log)
    }

    #[tokio::test]
    async fn attaches_every_file_and_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryBuildStore::new();
        let storage = MemoryArtifactStore::new();
        let build = started_build(&store).await;
        let (records, log) = write_outputs(dir.path(), &["b.json", "a.txt"]);
        std::fs::create_dir(records.join("nested")).unwrap();

        let summary = harvest(&store, &storage, &build, &records, &log).await;
        assert_eq!(summary, HarvestSummary { attached: 3, failed: 0 });

        let names: Vec<String> = store
            .records_for(build.id)
            .into_iter()
            .map(|r| r.file_name)
            .collect();
        assert_eq!(names, ["a.txt", "b.json", BUILD_LOG]);
        assert_eq!(
            storage.object(&build.record_key("a.txt")).unwrap(),
            b"contents of a.txt"
        );
        assert_eq!(
            storage.object(&build.record_key(BUILD_LOG)).unwrap(),
            b"packer output\n"
        );
    }

    #[tokio::test]
    async fn one_failed_upload_does_not_stop_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryBuildStore::new();
        let storage = MemoryArtifactStore::new();
        let build = started_build(&store).await;
        let (records, log) = write_outputs(dir.path(), &["a.txt", "b.txt", "c.txt"]);
        storage.fail_uploads_to(&build.record_key("b.txt"));

        let summary = harvest(&store, &storage, &build, &records, &log).await;
        assert_eq!(summary, HarvestSummary { attached: 3, failed: 1 });

        let names: Vec<String> = store
            .records_for(build.id)
            .into_iter()
            .map(|r| r.file_name)
            .collect();
        assert_eq!(names, ["a.txt", "c.txt", BUILD_LOG]);
    }

    #[tokio::test]
    async fn records_file_cannot_replace_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryBuildStore::new();
        let storage = MemoryArtifactStore::new();
        let build = started_build(&store).await;
        let (records, log) = write_outputs(dir.path(), &["a.txt", BUILD_LOG]);

        let summary = harvest(&store, &storage, &build, &records, &log).await;
        assert_eq!(summary, HarvestSummary { attached: 2, failed: 1 });

        let names: Vec<String> = store
            .records_for(build.id)
            .into_iter()
            .map(|r| r.file_name)
            .collect();
        assert_eq!(names, ["a.txt", BUILD_LOG]);
        assert_eq!(
            storage.object(&build.record_key(BUILD_LOG)).unwrap(),
            b"packer output\n"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryBuildStore::new();
        let storage = MemoryArtifactStore::new();
        let build = started_build(&store).await;
        let (records, log) = write_outputs(dir.path(), &["a.txt"]);

        let secret = dir.path().join("host-secret");
        std::fs::write(&secret, "do not upload").unwrap();
        std::os::unix::fs::symlink(&secret, records.join("link.txt")).unwrap();

        let summary = harvest(&store, &storage, &build, &records, &log).await;
        assert_eq!(summary, HarvestSummary { attached: 2, failed: 0 });
        assert!(storage.object(&build.record_key("link.txt")).is_none());
    }

    #[tokio::test]
    async fn missing_records_dir_still_attaches_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryBuildStore::new();
        let storage = MemoryArtifactStore::new();
        let build = started_build(&store).await;
        let log = dir.path().join(BUILD_LOG);
        std::fs::write(&log, "log").unwrap();

        let summary = harvest(&store, &storage, &build, &dir.path().join("absent"), &log).await;
        assert_eq!(summary, HarvestSummary { attached: 1, failed: 0 });
    }

    #[tokio::test]
    async fn attach_record_uses_deterministic_key() {
        let store = MemoryBuildStore::new();
        let storage = MemoryArtifactStore::new();
        let build = Build {
            id: 1,
            name: "base".into(),
            revision: "main".into(),
            full_revision: None,
            status: BuildStatus::Succeeded,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let record = attach_record(&store, &storage, &build, "x.log", b"hi".to_vec())
            .await
            .unwrap();
        assert_eq!(record.s3_key, "records/1/x.log");
        assert_eq!(storage.keys(), ["records/1/x.log"]);
    }
}
