use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::classifier::ExecutionResult;
use crate::config::Config;
use crate::error::SubmitError;
use crate::language::LanguageRegistry;
use crate::orchestrator::Orchestrator;
use crate::queue::JobQueue;
use crate::submission::Submission;
use crate::worker::{QueuedJob, WorkerContext, worker};
use crate::workspace::{SweepReport, WorkspaceManager};

/// Pending result of an accepted submission
#[derive(Debug)]
pub struct JobHandle {
    submission_id: u64,
    receiver: oneshot::Receiver<ExecutionResult>,
}

impl JobHandle {
    pub fn submission_id(&self) -> u64 {
        self.submission_id
    }

    /// Resolves once a worker finished the job
    pub async fn wait(self) -> Result<ExecutionResult, SubmitError> {
        self.receiver.await.map_err(|_| SubmitError::ShuttingDown)
    }
}

/// Bounded worker pool in front of the orchestrator
///
/// Submissions are dequeued in arrival order but may complete in any order;
/// correlate results by submission id.
pub struct Scheduler {
    queue: Arc<JobQueue<QueuedJob>>,
    /// One permit per job that is waiting or running
    admission: Arc<Semaphore>,
    registry: Arc<LanguageRegistry>,
    manager: Arc<WorkspaceManager>,
    workers: JoinSet<()>,
    token: CancellationToken,
    sweep: SweepReport,
}

impl Scheduler {
    /// Starts a pool using the languages declared in `config`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &Config) -> anyhow::Result<Self> {
        let registry = LanguageRegistry::from_config(&config.languages)?;
        Self::start_with_registry(config, registry)
    }

    pub fn start_with_registry(config: &Config, registry: LanguageRegistry) -> anyhow::Result<Self> {
        config.validate()?;

        let root = config.workspace.root_dir()?;
        let manager = Arc::new(
            WorkspaceManager::new(&root)
                .with_context(|| format!("Failed to prepare workspace root {}", root.display()))?,
        );
        let sweep = manager.sweep_orphans(config.workspace.orphan_staleness_threshold_ms.into());

        // Idle workers take jobs straight off the queue, so it may briefly
        // hold a whole burst before they wake up.
        let in_flight = config.scheduler.max_concurrent_jobs + config.scheduler.max_queue_depth;
        let queue = Arc::new(JobQueue::new(in_flight));
        let ctx = Arc::new(WorkerContext {
            manager: Arc::clone(&manager),
            orchestrator: Arc::new(Orchestrator::from_config(config)),
            queue: Arc::clone(&queue),
        });
        let token = CancellationToken::new();

        let mut workers = JoinSet::new();
        for i in 1..=config.scheduler.max_concurrent_jobs {
            workers.spawn(worker(i, Arc::clone(&ctx), token.clone()));
        }
        log::info!(
            "Scheduler started with {} workers and queue depth {}",
            config.scheduler.max_concurrent_jobs,
            config.scheduler.max_queue_depth
        );

        Ok(Self {
            queue,
            admission: Arc::new(Semaphore::new(in_flight)),
            registry: Arc::new(registry),
            manager,
            workers,
            token,
            sweep,
        })
    }

    /// Queues a submission, or rejects it right away when every worker is
    /// busy and the wait queue is full
    pub fn submit(&self, submission: Submission) -> Result<JobHandle, SubmitError> {
        if self.token.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        let language = self
            .registry
            .get(submission.language())
            .ok_or_else(|| SubmitError::UnsupportedLanguage(submission.language().to_string()))?;

        let submission_id = submission.id();
        let permit = Arc::clone(&self.admission)
            .try_acquire_owned()
            .map_err(|_| SubmitError::Overloaded {
                depth: self.queue.len(),
            })
            .inspect_err(|e| log::warn!("Submission {submission_id} rejected: {e}"))?;

        let (responder, receiver) = oneshot::channel();
        self.queue
            .try_push(QueuedJob {
                submission,
                language,
                responder,
                permit,
            })
            .inspect_err(|e| log::warn!("Submission {submission_id} rejected: {e}"))?;

        log::debug!("Submission {submission_id} queued");
        Ok(JobHandle {
            submission_id,
            receiver,
        })
    }

    /// Submits and waits for the result
    pub async fn run(&self, submission: Submission) -> Result<ExecutionResult, SubmitError> {
        self.submit(submission)?.wait().await
    }

    /// Number of submissions waiting for a worker
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn workspace_manager(&self) -> &WorkspaceManager {
        &self.manager
    }

    /// What the startup orphan sweep cleaned up
    pub fn startup_sweep(&self) -> SweepReport {
        self.sweep
    }

    /// Stops the pool: jobs already running finish, waiting ones are dropped
    /// and their handles resolve to [`SubmitError::ShuttingDown`].
    pub async fn shutdown(mut self) {
        self.token.cancel();
        let dropped = self.queue.drain().len();
        log::info!("Shutdown signal sent to workers, {dropped} queued submissions dropped");

        while let Some(res) = self.workers.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    log::error!("Worker handle panicked: {e:?}");
                } else {
                    log::error!("Worker handle finished with error: {e:?}");
                }
            }
        }
        log::info!("Shutdown complete");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
