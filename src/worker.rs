use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tokio_util::sync::CancellationToken;

use crate::classifier::ExecutionResult;
use crate::language::LanguageStrategy;
use crate::orchestrator::{Orchestrator, RawExecution};
use crate::queue::JobQueue;
use crate::submission::Submission;
use crate::workspace::WorkspaceManager;

/// A submission waiting in the queue together with its reply channel
pub struct QueuedJob {
    pub submission: Submission,
    pub language: Arc<dyn LanguageStrategy>,
    pub responder: oneshot::Sender<ExecutionResult>,
    /// Held until the result is sent; frees a slot in the scheduler
    pub permit: OwnedSemaphorePermit,
}

/// What every worker needs; shared read-only across the pool
pub struct WorkerContext {
    pub manager: Arc<WorkspaceManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub queue: Arc<JobQueue<QueuedJob>>,
}

pub async fn worker(id: usize, ctx: Arc<WorkerContext>, token: CancellationToken) {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            job = ctx.queue.pop() => {
                let QueuedJob { submission, language, responder, permit } = job;
                let submission_id = submission.id();
                log::info!("Worker {id} got submission {submission_id} from queue");

                let result = execute_job(id, &ctx, submission, language).await;
                log::info!(
                    "Submission {submission_id} finished on worker {id}: {} in {}ms",
                    result.outcome,
                    result.duration_ms
                );

                if responder.send(result).is_err() {
                    log::warn!("Caller of submission {submission_id} went away before its result");
                }
                drop(permit);
            }
        }
    }

    log::info!("Worker {id} has shut down gracefully");
}

/// allocate → orchestrate → classify → reclaim, for one submission
///
/// The workspace is reclaimed on every path. Orchestration runs in its own
/// task, so even a panic there unwinds through the workspace's drop.
async fn execute_job(
    worker_id: usize,
    ctx: &WorkerContext,
    submission: Submission,
    language: Arc<dyn LanguageStrategy>,
) -> ExecutionResult {
    let started = Instant::now();
    let submission_id = submission.id();

    let mut workspace = match ctx.manager.allocate(submission_id) {
        Ok(workspace) => workspace,
        Err(e) => {
            log::error!("Worker {worker_id} could not allocate a workspace for submission {submission_id}: {e}");
            return ExecutionResult::internal_error(submission_id, started.elapsed(), "no-workspace");
        }
    };
    let workspace_id = workspace.id().to_string();

    let orchestrator = Arc::clone(&ctx.orchestrator);
    let handle = tokio::spawn(async move {
        let raw = orchestrator
            .execute(&mut workspace, &submission, language.as_ref())
            .await;
        (workspace, raw)
    });

    match handle.await {
        Ok((mut workspace, raw)) => {
            if let RawExecution::Faulted { stage, error } = &raw {
                log::error!(
                    "Internal error for submission {submission_id} in workspace {workspace_id} during {stage:?}: {error:#}"
                );
            }
            ctx.manager.reclaim(&mut workspace);
            ExecutionResult::from_raw(submission_id, raw, &workspace_id)
        }
        Err(e) => {
            log::error!(
                "Execution task for submission {submission_id} in workspace {workspace_id} failed: {e}"
            );
            ExecutionResult::internal_error(submission_id, started.elapsed(), &workspace_id)
        }
    }
}
