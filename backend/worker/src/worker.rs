use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowline_core::{Task, BATCH_QUEUE};
use flowline_tasks::{TaskContext, TaskRegistry};

/// Bound on one blocking pop; a worker that times out just polls again.
const POP_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a worker backs off after a queue error before retrying.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A fixed-size pool of batch workers. Each worker owns nothing mutable;
/// all shared state lives in the store and queue, so workers in other
/// processes coexist with these.
pub struct WorkerPool {
    size: usize,
    registry: Arc<TaskRegistry>,
    ctx: TaskContext,
}

impl WorkerPool {
    pub fn new(size: usize, registry: Arc<TaskRegistry>, ctx: TaskContext) -> Self {
        Self { size, registry, ctx }
    }

    /// Spawn the workers; they run until the process exits.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        info!(workers = self.size, "starting batch worker pool");
        (0..self.size)
            .map(|n| {
                let registry = self.registry.clone();
                let ctx = self.ctx.clone();
                tokio::spawn(worker_loop(n, registry, ctx))
            })
            .collect()
    }
}

async fn worker_loop(worker: usize, registry: Arc<TaskRegistry>, ctx: TaskContext) {
    debug!(worker, "batch worker started");
    loop {
        match ctx.queue.pop_wait(BATCH_QUEUE, POP_TIMEOUT).await {
            Ok(Some(task)) => handle_task(worker, &registry, &ctx, task).await,
            Ok(None) => {}
            Err(e) => {
                error!(worker, error = %e, "queue pop failed");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

/// Execute one popped task. Executor failures are recorded and the task is
/// acked anyway: redelivery exists to survive worker crashes, not to retry
/// work that deterministically fails.
async fn handle_task(worker: usize, registry: &TaskRegistry, ctx: &TaskContext, task: Task) {
    let started = Instant::now();
    debug!(
        worker,
        task_type = %task.task_type,
        org_id = %task.org_id,
        attempts = task.attempts,
        "popped task"
    );

    match registry.read_task(&task.task_type, &task.task) {
        Ok(typed) => match typed.perform(ctx, task.org_id).await {
            Ok(()) => info!(
                worker,
                task_type = %task.task_type,
                org_id = %task.org_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "task complete"
            ),
            Err(e) if e.is_claim_conflict() => {
                debug!(worker, task_type = %task.task_type, "task lost its claim, skipping")
            }
            Err(e) => error!(
                worker,
                task_type = %task.task_type,
                org_id = %task.org_id,
                error = %e,
                "task failed"
            ),
        },
        Err(e) => error!(worker, error = %e, "dropping unreadable task"),
    }

    if let Err(e) = ctx.queue.ack(task.id) {
        warn!(worker, error = %e, "failed to ack task");
    }
}
