//! Build executor: drives one build from checkout to a terminal status.
//!
//! Order of work for a job:
//! start → sync/resolve/checkout templates → save full revision → create
//! output dir and log → install secrets → `packer version` → translate
//! template → `packer build` → harvest records → finish.
//!
//! A build that reaches `started` always gets a terminal status: errors end
//! as `failed`, and so does an executor future dropped mid-build. The output
//! directory is removed on every path.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::models::build::{Build, BuildStatus};
use crate::services::harvest::{self, BUILD_LOG};
use crate::services::packer::{Packer, ToolRun};
use crate::services::secrets::{self, SecretsError};
use crate::services::templates::{TemplateError, TemplateRepo};
use crate::services::translate::{self, TranslateError};
use crate::services::worker::{Job, JobRunner};
use crate::storage::ArtifactStore;
use crate::store::{BuildStore, StoreError};

const RECORDS_DIR: &str = "records";

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("could not persist build: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Templates(#[from] TemplateError),

    #[error("template sync task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("build output directory: {0}")]
    Workspace(#[source] io::Error),

    #[error(transparent)]
    Secrets(#[from] SecretsError),

    #[error("could not run {program}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not print Packer version: exited with {0}")]
    VersionCheck(ExitStatus),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error("build cancelled")]
    Cancelled,
}

impl JobError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Store(_) => "store",
            JobError::Templates(_) | JobError::Join(_) => "templates",
            JobError::Workspace(_) => "workspace",
            JobError::Secrets(_) => "secrets",
            JobError::Launch { .. } | JobError::VersionCheck(_) => "launch",
            JobError::Translate(_) => "translate",
            JobError::Cancelled => "cancelled",
        }
    }
}

/// Private output directory for one job: the build log plus the records
/// directory handed to Packer. Deleted when dropped.
struct Workspace {
    dir: TempDir,
    log: File,
    log_path: PathBuf,
}

impl Workspace {
    fn create() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("imaged-build").tempdir()?;
        let log_path = dir.path().join(BUILD_LOG);
        let log = File::create(&log_path)?;
        Ok(Self { dir, log, log_path })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn records_dir(&self) -> io::Result<PathBuf> {
        let records = self.dir.path().join(RECORDS_DIR);
        std::fs::create_dir(&records)?;
        Ok(records)
    }

    /// Append a line of our own to the build log.
    fn note(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.log, "{line}")
    }

    fn sync_log(&mut self) -> io::Result<()> {
        self.log.flush()?;
        self.log.sync_all()
    }
}

/// A started build that still owes the store its terminal status.
///
/// [`PendingFinish::finish`] persists the outcome. If the guard is dropped
/// first, a task is spawned to persist `failed` instead.
struct PendingFinish {
    store: Arc<dyn BuildStore>,
    build: Build,
    armed: bool,
}

impl PendingFinish {
    fn new(store: Arc<dyn BuildStore>, build: Build) -> Self {
        Self {
            store,
            build,
            armed: true,
        }
    }

    async fn finish(mut self, status: BuildStatus) {
        self.armed = false;
        self.build.status = status;
        persist_finish(self.store.as_ref(), &mut self.build).await;
    }
}

impl Drop for PendingFinish {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let store = Arc::clone(&self.store);
        let mut build = self.build.clone();
        build.status = BuildStatus::Failed;
        tracing::warn!(build_id = build.id, "Build abandoned, recording failure");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    persist_finish(store.as_ref(), &mut build).await;
                });
            }
            Err(_) => {
                crate::metrics::persistence_error("finish");
                tracing::error!(build_id = build.id, "No runtime to record abandoned build");
            }
        }
    }
}

async fn persist_finish(store: &dyn BuildStore, build: &mut Build) {
    let status = build.status;
    match store.finish_build(build).await {
        Ok(()) => {
            crate::metrics::build_status_changed(status.as_str());
            if let Some(ms) = build.duration_ms() {
                crate::metrics::build_duration(ms.max(0) as u64);
            }
            tracing::info!(
                build_id = build.id,
                status = %status,
                duration_ms = build.duration_ms(),
                "Build finished"
            );
        }
        Err(e) => {
            crate::metrics::persistence_error("finish");
            tracing::error!(build_id = build.id, status = %status, "Could not finish build: {e}");
        }
    }
}

pub struct Executor {
    store: Arc<dyn BuildStore>,
    storage: Arc<dyn ArtifactStore>,
    templates: Arc<TemplateRepo>,
    packer: Packer,
    secrets_path: Option<PathBuf>,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        store: Arc<dyn BuildStore>,
        storage: Arc<dyn ArtifactStore>,
        templates: Arc<TemplateRepo>,
        config: &WorkerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            storage,
            templates,
            packer: Packer::new(&config.packer_path).with_grace(config.packer_grace),
            secrets_path: config.secrets_path.clone(),
            cancel,
        }
    }

    /// Run one build to a terminal status.
    ///
    /// A non-zero Packer exit is a failed build, not an error. Errors mean
    /// the job could not be carried out; the build is then recorded as
    /// failed.
    pub async fn execute(&self, job: Job) -> Result<(), JobError> {
        let mut build = job.build;
        tracing::info!(
            build_id = build.id,
            template = %build.name,
            revision = %build.revision,
            "Building template"
        );

        if let Err(e) = self.store.start_build(&mut build).await {
            crate::metrics::persistence_error("start");
            return Err(e.into());
        }
        crate::metrics::build_status_changed(BuildStatus::Started.as_str());

        let mut pending = PendingFinish::new(Arc::clone(&self.store), build);
        let result = self.run(&mut pending.build).await;

        let status = match &result {
            Ok(status) => *status,
            Err(_) => BuildStatus::Failed,
        };
        pending.finish(status).await;

        result.map(|_| ())
    }

    async fn run(&self, build: &mut Build) -> Result<BuildStatus, JobError> {
        let templates = Arc::clone(&self.templates);
        let revision = build.revision.clone();
        let full_revision =
            tokio::task::spawn_blocking(move || templates.prepare(&revision)).await??;

        build.full_revision = Some(full_revision);
        self.store
            .update_build(build)
            .await
            .inspect_err(|_| crate::metrics::persistence_error("update"))?;

        let mut workspace = Workspace::create().map_err(JobError::Workspace)?;
        let templates_root = self.templates.path();

        if let Some(source) = &self.secrets_path {
            secrets::install(source, templates_root).await?;
        }

        match self.packer.version(&workspace.log, &self.cancel).await {
            ToolRun::Exited(status) if status.success() => {}
            ToolRun::Exited(status) => return Err(JobError::VersionCheck(status)),
            ToolRun::LaunchFailed(source) => return Err(self.launch_error(source)),
            ToolRun::Cancelled => return Err(JobError::Cancelled),
        }
        workspace.sync_log().map_err(JobError::Workspace)?;

        let template =
            translate::write_template(templates_root, &build.name, workspace.path()).await?;
        let records_dir = workspace.records_dir().map_err(JobError::Workspace)?;

        let exit = match self
            .packer
            .build(
                &template,
                &records_dir,
                templates_root,
                &workspace.log,
                &self.cancel,
            )
            .await
        {
            ToolRun::Exited(status) => status,
            ToolRun::LaunchFailed(source) => return Err(self.launch_error(source)),
            ToolRun::Cancelled => return Err(JobError::Cancelled),
        };

        if !exit.success() {
            tracing::warn!(build_id = build.id, %exit, "Packer build failed");
            workspace
                .note(&format!("packer exited with non-zero status: {exit}"))
                .map_err(JobError::Workspace)?;
        }
        workspace.sync_log().map_err(JobError::Workspace)?;

        let summary = harvest::harvest(
            self.store.as_ref(),
            self.storage.as_ref(),
            build,
            &records_dir,
            &workspace.log_path,
        )
        .await;
        tracing::info!(
            build_id = build.id,
            attached = summary.attached,
            failed = summary.failed,
            "Records harvested"
        );

        Ok(if exit.success() {
            BuildStatus::Succeeded
        } else {
            BuildStatus::Failed
        })
    }

    fn launch_error(&self, source: io::Error) -> JobError {
        JobError::Launch {
            program: self.packer.path().to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl JobRunner for Executor {
    async fn execute(&self, job: Job) -> Result<(), JobError> {
        Executor::execute(self, job).await
    }
}
