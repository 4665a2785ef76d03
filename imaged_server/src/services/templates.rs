//! Template synchronizer: the worker's single clone of the Packer templates.
//!
//! One working tree is shared by every build. That is only safe because the
//! worker runs one job at a time; concurrent builds would need a checkout per
//! job instead.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use git2::build::CheckoutBuilder;
use git2::{ErrorCode, Oid, Repository};

use crate::config::WorkerConfig;

const REMOTE: &str = "origin";

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("a templates path is required")]
    MissingPath,

    #[error("a templates URL is required when templates are not already cloned")]
    MissingUrl,

    #[error("could not open existing templates repo: {0}")]
    Open(#[source] git2::Error),

    #[error("could not clone templates repo: {0}")]
    Clone(#[source] git2::Error),

    #[error("could not fetch latest commits for templates repo: {0}")]
    Fetch(#[source] git2::Error),

    #[error("could not resolve revision '{revision}': {source}")]
    Resolve {
        revision: String,
        #[source]
        source: git2::Error,
    },

    #[error("could not check out {commit}: {source}")]
    Checkout {
        commit: Oid,
        #[source]
        source: git2::Error,
    },

    #[error("templates repo lock poisoned")]
    Poisoned,
}

pub struct TemplateRepo {
    path: PathBuf,
    repo: Mutex<Repository>,
}

impl TemplateRepo {
    pub fn from_config(config: &WorkerConfig) -> Result<Self, TemplateError> {
        Self::open_or_clone(&config.templates_path, config.templates_url.as_deref())
    }

    /// Open the clone at `path`, cloning it from `url` first if it does not
    /// exist, then fetch the latest commits.
    pub fn open_or_clone(path: &Path, url: Option<&str>) -> Result<Self, TemplateError> {
        if path.as_os_str().is_empty() {
            return Err(TemplateError::MissingPath);
        }

        let repo = match Repository::open(path) {
            Ok(repo) => repo,
            Err(e) if e.code() == ErrorCode::NotFound => {
                let url = url.ok_or(TemplateError::MissingUrl)?;
                tracing::info!(path = %path.display(), url, "Cloning templates");
                Repository::clone(url, path).map_err(TemplateError::Clone)?
            }
            Err(e) => return Err(TemplateError::Open(e)),
        };

        fetch(&repo)?;

        Ok(Self {
            path: path.to_path_buf(),
            repo: Mutex::new(repo),
        })
    }

    /// Root of the shared working tree.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync, resolve, and check out `revision`, returning the full commit hash.
    ///
    /// Blocking; call from a blocking context.
    pub fn prepare(&self, revision: &str) -> Result<String, TemplateError> {
        let repo = self.lock()?;
        fetch(&repo)?;
        let commit = resolve(&repo, revision)?;
        checkout(&repo, commit)?;
        tracing::info!(revision, commit = %commit, "Checked out templates");
        Ok(commit.to_string())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Repository>, TemplateError> {
        self.repo.lock().map_err(|_| TemplateError::Poisoned)
    }
}

fn fetch(repo: &Repository) -> Result<(), TemplateError> {
    let mut remote = repo.find_remote(REMOTE).map_err(TemplateError::Fetch)?;
    remote
        .fetch(&[] as &[&str], None, None)
        .map_err(TemplateError::Fetch)
}

/// Remote branches win; anything else (tags, hashes) resolves as given.
fn resolve(repo: &Repository, revision: &str) -> Result<Oid, TemplateError> {
    let resolve_err = |source| TemplateError::Resolve {
        revision: revision.to_string(),
        source,
    };

    let object = match repo.revparse_single(&format!("{REMOTE}/{revision}")) {
        Ok(object) => object,
        Err(e) if e.code() == ErrorCode::NotFound => {
            repo.revparse_single(revision).map_err(resolve_err)?
        }
        Err(e) => return Err(resolve_err(e)),
    };

    let commit = object.peel_to_commit().map_err(resolve_err)?;
    Ok(commit.id())
}

fn checkout(repo: &Repository, commit: Oid) -> Result<(), TemplateError> {
    let checkout_err = |source| TemplateError::Checkout { commit, source };

    let object = repo.find_object(commit, None).map_err(checkout_err)?;
    let mut opts = CheckoutBuilder::new();
    opts.force();
    repo.checkout_tree(&object, Some(&mut opts))
        .map_err(checkout_err)?;
    repo.set_head_detached(commit).map_err(checkout_err)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Throw-away origin repositories for template tests.

    use std::fs;
    use std::path::Path;

    use git2::{Commit, Oid, Repository, RepositoryInitOptions, Signature};

    pub fn init_origin(path: &Path) -> Repository {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        Repository::init_opts(path, &opts).unwrap()
    }

    /// Write `contents` to `file` in the origin's working tree and commit it on HEAD.
    pub fn commit_file(repo: &Repository, file: &str, contents: &str, message: &str) -> Oid {
        let workdir = repo.workdir().unwrap();
        let full = workdir.join(file);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, contents).unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new(file)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();

        let sig = Signature::now("imaged", "imaged@example.com").unwrap();
        let parents: Vec<Commit<'_>> = repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();

        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::testing::{commit_file, init_origin};
    use super::*;

    fn origin_url(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    impl TemplateRepo {
        fn sync(&self) -> Result<(), TemplateError> {
            fetch(&*self.lock()?)
        }

        fn resolve(&self, revision: &str) -> Result<Oid, TemplateError> {
            resolve(&*self.lock()?, revision)
        }
    }

    #[test]
    fn clone_requires_url() {
        let dir = tempfile::tempdir().unwrap();
        let err = TemplateRepo::open_or_clone(&dir.path().join("templates"), None)
            .err()
            .unwrap();
        assert!(matches!(err, TemplateError::MissingUrl));
    }

    #[test]
    fn empty_path_is_rejected() {
        let err = TemplateRepo::open_or_clone(Path::new(""), Some("unused"))
            .err()
            .unwrap();
        assert!(matches!(err, TemplateError::MissingPath));
    }

    #[test]
    fn branch_resolves_to_remote_tip() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(&dir.path().join("origin"));
        commit_file(&origin, "templates/base.yml", "a: 1\n", "first");
        let tip = commit_file(&origin, "templates/base.yml", "a: 2\n", "second");

        let checkout = dir.path().join("checkout");
        let repo =
            TemplateRepo::open_or_clone(&checkout, Some(&origin_url(&dir.path().join("origin"))))
                .unwrap();

        assert_eq!(repo.resolve("main").unwrap(), tip);
    }

    #[test]
    fn raw_hash_falls_back_to_direct_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(&dir.path().join("origin"));
        let first = commit_file(&origin, "templates/base.yml", "a: 1\n", "first");
        commit_file(&origin, "templates/base.yml", "a: 2\n", "second");

        let repo = TemplateRepo::open_or_clone(
            &dir.path().join("checkout"),
            Some(&origin_url(&dir.path().join("origin"))),
        )
        .unwrap();

        assert_eq!(repo.resolve(&first.to_string()).unwrap(), first);
    }

    #[test]
    fn tags_resolve_to_their_commit() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(&dir.path().join("origin"));
        let tagged = commit_file(&origin, "templates/base.yml", "a: 1\n", "first");
        let sig = git2::Signature::now("imaged", "imaged@example.com").unwrap();
        let target = origin.find_object(tagged, None).unwrap();
        origin.tag("v1.0", &target, &sig, "release", false).unwrap();
        commit_file(&origin, "templates/base.yml", "a: 2\n", "second");

        let repo = TemplateRepo::open_or_clone(
            &dir.path().join("checkout"),
            Some(&origin_url(&dir.path().join("origin"))),
        )
        .unwrap();

        assert_eq!(repo.resolve("v1.0").unwrap(), tagged);
    }

    #[test]
    fn unknown_revision_fails() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(&dir.path().join("origin"));
        commit_file(&origin, "templates/base.yml", "a: 1\n", "first");

        let repo = TemplateRepo::open_or_clone(
            &dir.path().join("checkout"),
            Some(&origin_url(&dir.path().join("origin"))),
        )
        .unwrap();

        assert!(matches!(
            repo.resolve("no-such-branch"),
            Err(TemplateError::Resolve { .. })
        ));
    }

    #[test]
    fn sync_picks_up_new_commits() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(&dir.path().join("origin"));
        let first = commit_file(&origin, "templates/base.yml", "a: 1\n", "first");

        let repo = TemplateRepo::open_or_clone(
            &dir.path().join("checkout"),
            Some(&origin_url(&dir.path().join("origin"))),
        )
        .unwrap();
        assert_eq!(repo.resolve("main").unwrap(), first);

        let second = commit_file(&origin, "templates/base.yml", "a: 2\n", "second");
        assert_eq!(repo.resolve("main").unwrap(), first);

        repo.sync().unwrap();
        assert_eq!(repo.resolve("main").unwrap(), second);

        // Nothing new to fetch is still fine.
        repo.sync().unwrap();
    }

    #[test]
    fn existing_clone_is_reopened() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(&dir.path().join("origin"));
        let tip = commit_file(&origin, "templates/base.yml", "a: 1\n", "first");
        let checkout = dir.path().join("checkout");

        drop(
            TemplateRepo::open_or_clone(&checkout, Some(&origin_url(&dir.path().join("origin"))))
                .unwrap(),
        );
        let reopened = TemplateRepo::open_or_clone(&checkout, None).unwrap();
        assert_eq!(reopened.resolve("main").unwrap(), tip);
    }

    #[test]
    fn prepare_checks_out_and_discards_local_changes() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(&dir.path().join("origin"));
        let first = commit_file(&origin, "templates/base.yml", "a: 1\n", "first");
        let second = commit_file(&origin, "templates/base.yml", "a: 2\n", "second");

        let checkout = dir.path().join("checkout");
        let repo =
            TemplateRepo::open_or_clone(&checkout, Some(&origin_url(&dir.path().join("origin"))))
                .unwrap();
        let template = checkout.join("templates/base.yml");

        let resolved = repo.prepare(&first.to_string()).unwrap();
        assert_eq!(resolved, first.to_string());
        assert_eq!(fs::read_to_string(&template).unwrap(), "a: 1\n");

        fs::write(&template, "local edit\n").unwrap();
        let resolved = repo.prepare("main").unwrap();
        assert_eq!(resolved, second.to_string());
        assert_eq!(fs::read_to_string(&template).unwrap(), "a: 2\n");
    }
}
