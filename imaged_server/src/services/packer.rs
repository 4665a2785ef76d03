//! Packer invocation.
//!
//! A run either never got going ([`ToolRun::LaunchFailed`]), ran to an exit
//! status ([`ToolRun::Exited`], zero or not), or was stopped by shutdown
//! ([`ToolRun::Cancelled`]). Only the first and last are infrastructure
//! failures; a non-zero exit is an ordinary failed build.

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// How long Packer gets to clean up after SIGINT before it is killed.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub enum ToolRun {
    LaunchFailed(io::Error),
    Exited(ExitStatus),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Packer {
    path: PathBuf,
    grace: Duration,
}

impl Packer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `packer version`, as a cheap check that the binary runs at all.
    pub async fn version(&self, log: &File, cancel: &CancellationToken) -> ToolRun {
        self.run(vec!["version".into()], None, log, cancel).await
    }

    /// `packer build -var records_path=<dir> <template>` from the template checkout.
    pub async fn build(
        &self,
        template: &Path,
        records_dir: &Path,
        workdir: &Path,
        log: &File,
        cancel: &CancellationToken,
    ) -> ToolRun {
        let mut records_var = OsString::from("records_path=");
        records_var.push(records_dir);

        let args = vec![
            OsString::from("build"),
            OsString::from("-var"),
            records_var,
            template.as_os_str().to_owned(),
        ];
        self.run(args, Some(workdir), log, cancel).await
    }

    async fn run(
        &self,
        args: Vec<OsString>,
        workdir: Option<&Path>,
        log: &File,
        cancel: &CancellationToken,
    ) -> ToolRun {
        let (stdout, stderr) = match (log.try_clone(), log.try_clone()) {
            (Ok(out), Ok(err)) => (out, err),
            (Err(e), _) | (_, Err(e)) => return ToolRun::LaunchFailed(e),
        };

        let mut cmd = Command::new(&self.path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ToolRun::LaunchFailed(e),
        };

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ToolRun::Exited(status),
                Err(e) => ToolRun::LaunchFailed(e),
            },
            _ = cancel.cancelled() => {
                tracing::warn!(program = %self.path.display(), "Interrupting Packer");
                self.interrupt(&mut child).await;
                ToolRun::Cancelled
            }
        }
    }

    /// SIGINT the whole process group so Packer can tear down remote
    /// resources, then kill it if it outlives the grace period.
    async fn interrupt(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: kill(2) with a negated pid targets the process group this
            // child leads (process_group(0) above); it touches no memory.
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGINT);
            }
        }

        if tokio::time::timeout(self.grace, child.wait()).await.is_err() {
            tracing::warn!(program = %self.path.display(), "Packer ignored SIGINT, killing");
            if let Err(e) = child.kill().await {
                tracing::error!("Failed to kill Packer: {e}");
            }
        }
    }
}
