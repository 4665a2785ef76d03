//! Build worker: runs at most one build at a time.
//!
//! [`Worker`] is the cloneable submission handle held by request handlers;
//! [`WorkerLoop`] is the single task that executes jobs. A submission only
//! succeeds while the loop is idle and waiting; otherwise it fails at once
//! with [`WorkerError::Busy`]. Nothing is ever queued behind a running job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio_util::sync::CancellationToken;

use crate::models::build::Build;
use crate::services::executor::JobError;

/// One build for the worker to run.
#[derive(Debug, Clone)]
pub struct Job {
    pub build: Build,
}

impl Job {
    pub fn new(build: Build) -> Self {
        Self { build }
    }
}

#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn execute(&self, job: Job) -> Result<(), JobError>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("a job is already running on this worker")]
    Busy,

    #[error("the worker has stopped")]
    Stopped,
}

#[derive(Clone)]
pub struct Worker {
    jobs: mpsc::Sender<Job>,
    idle: Arc<AtomicBool>,
}

/// The worker's single slot, claimed but not yet filled.
///
/// Dropping it without sending hands the slot back.
pub struct SubmitSlot {
    permit: Option<OwnedPermit<Job>>,
    idle: Arc<AtomicBool>,
}

impl SubmitSlot {
    pub fn send(mut self, job: Job) {
        if let Some(permit) = self.permit.take() {
            permit.send(job);
        }
    }
}

impl Drop for SubmitSlot {
    fn drop(&mut self) {
        if self.permit.take().is_some() {
            self.idle.store(true, Ordering::Release);
        }
    }
}

impl Worker {
    /// Create a worker handle and the loop that serves it.
    pub fn new<R: JobRunner>(runner: R, cancel: CancellationToken) -> (Self, WorkerLoop<R>) {
        let (tx, rx) = mpsc::channel(1);
        let idle = Arc::new(AtomicBool::new(false));

        let worker = Self {
            jobs: tx,
            idle: idle.clone(),
        };
        let run_loop = WorkerLoop {
            jobs: rx,
            idle,
            runner: Arc::new(runner),
            cancel,
        };
        (worker, run_loop)
    }

    /// Whether the loop is waiting for a job right now.
    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Claim the slot without blocking. Fails with `Busy` unless the loop is
    /// idle and waiting. Submitting a job is `reserve()?.send(job)`.
    pub fn reserve(&self) -> Result<SubmitSlot, WorkerError> {
        if self
            .idle
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            crate::metrics::submission_rejected();
            return Err(WorkerError::Busy);
        }

        match self.jobs.clone().try_reserve_owned() {
            Ok(permit) => Ok(SubmitSlot {
                permit: Some(permit),
                idle: self.idle.clone(),
            }),
            Err(TrySendError::Closed(_)) => Err(WorkerError::Stopped),
            Err(TrySendError::Full(_)) => {
                crate::metrics::submission_rejected();
                Err(WorkerError::Busy)
            }
        }
    }
}

pub struct WorkerLoop<R> {
    jobs: mpsc::Receiver<Job>,
    idle: Arc<AtomicBool>,
    runner: Arc<R>,
    cancel: CancellationToken,
}

impl<R: JobRunner> WorkerLoop<R> {
    /// Wait for jobs and run them one by one until cancelled.
    ///
    /// Job errors and panics are logged; they never end the loop.
    pub async fn run(mut self) {
        tracing::info!("Build worker started");

        loop {
            self.idle.store(true, Ordering::Release);

            let job = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                job = self.jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let build_id = job.build.id;
            let runner = Arc::clone(&self.runner);
            match tokio::spawn(async move { runner.execute(job).await }).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    crate::metrics::job_error(e.kind());
                    tracing::error!(build_id, "Error running job: {e}");
                }
                Err(e) => {
                    crate::metrics::job_error("panic");
                    tracing::error!(build_id, "Job task failed: {e}");
                }
            }
        }

        self.idle.store(false, Ordering::Release);
        self.jobs.close();
        tracing::info!("Build worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::models::build::BuildStatus;

    fn build(id: i64, name: &str) -> Build {
        Build {
            id,
            name: name.into(),
            revision: "main".into(),
            full_revision: None,
            status: BuildStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Runner that reports each job and then waits for a permit.
    struct GatedRunner {
        started: mpsc::UnboundedSender<i64>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl JobRunner for GatedRunner {
        async fn execute(&self, job: Job) -> Result<(), JobError> {
            let _ = self.started.send(job.build.id);
            self.gate.acquire().await.unwrap().forget();
            match job.build.name.as_str() {
                "fail" => Err(JobError::Cancelled),
                "panic" => panic!("runner panicked"),
                _ => Ok(()),
            }
        }
    }

    fn gated() -> (GatedRunner, mpsc::UnboundedReceiver<i64>, Arc<Semaphore>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let runner = GatedRunner {
            started: tx,
            gate: gate.clone(),
        };
        (runner, rx, gate)
    }

    impl Worker {
        fn submit(&self, job: Job) -> Result<(), WorkerError> {
            self.reserve()?.send(job);
            Ok(())
        }
    }

    async fn wait_idle(worker: &Worker) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !worker.is_idle() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker never became idle");
    }

    #[tokio::test]
    async fn submit_without_running_loop_is_busy() {
        let (runner, _started, _gate) = gated();
        let (worker, _run_loop) = Worker::new(runner, CancellationToken::new());

        assert_eq!(worker.submit(Job::new(build(1, "base"))), Err(WorkerError::Busy));
    }

    #[tokio::test]
    async fn submit_while_running_is_busy() {
        let (runner, mut started, gate) = gated();
        let (worker, run_loop) = Worker::new(runner, CancellationToken::new());
        tokio::spawn(run_loop.run());
        wait_idle(&worker).await;

        worker.submit(Job::new(build(1, "base"))).unwrap();
        assert_eq!(started.recv().await, Some(1));

        let rejected = tokio::time::timeout(
            Duration::from_millis(100),
            async { worker.submit(Job::new(build(2, "base"))) },
        )
        .await
        .expect("submit blocked");
        assert_eq!(rejected, Err(WorkerError::Busy));

        gate.add_permits(1);
        wait_idle(&worker).await;
        worker.submit(Job::new(build(3, "base"))).unwrap();
        assert_eq!(started.recv().await, Some(3));
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn dropped_reservation_frees_the_slot() {
        let (runner, mut started, gate) = gated();
        let (worker, run_loop) = Worker::new(runner, CancellationToken::new());
        tokio::spawn(run_loop.run());
        wait_idle(&worker).await;

        let slot = worker.reserve().unwrap();
        assert_eq!(worker.reserve().err(), Some(WorkerError::Busy));
        drop(slot);

        worker.submit(Job::new(build(1, "base"))).unwrap();
        assert_eq!(started.recv().await, Some(1));
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn job_errors_and_panics_do_not_stop_the_loop() {
        let (runner, mut started, gate) = gated();
        let (worker, run_loop) = Worker::new(runner, CancellationToken::new());
        tokio::spawn(run_loop.run());

        for (id, name) in [(1, "fail"), (2, "panic"), (3, "base")] {
            wait_idle(&worker).await;
            worker.submit(Job::new(build(id, name))).unwrap();
            assert_eq!(started.recv().await, Some(id));
            gate.add_permits(1);
        }
        wait_idle(&worker).await;
    }

    #[tokio::test]
    async fn cancellation_ends_the_loop() {
        let (runner, _started, _gate) = gated();
        let cancel = CancellationToken::new();
        let (worker, run_loop) = Worker::new(runner, cancel.clone());
        let handle = tokio::spawn(run_loop.run());
        wait_idle(&worker).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!worker.is_idle());
        assert_eq!(worker.submit(Job::new(build(1, "base"))), Err(WorkerError::Busy));
    }
}
