//! Queue consumer: one task id at a time, adapter dispatch by URL, and the
//! conversion of download outcomes into terminal task states.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::providers::{DownloadCtx, ProviderRegistry};
use crate::task::TaskStatus;

/// Upper bound for a single download job.
const JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Queue poll interval; bounds how long shutdown takes to be observed.
const POP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Worker {
    ctx: DownloadCtx,
    registry: Arc<ProviderRegistry>,
}

impl Worker {
    pub fn new(ctx: DownloadCtx, registry: Arc<ProviderRegistry>) -> Self {
        Self { ctx, registry }
    }

    /// Consume the queue until `shutdown` fires. Every failure is absorbed
    /// into a task state or a log line; the loop itself never dies.
    pub async fn run(&self, shutdown: CancellationToken) {
        log::info!("[worker] consuming queue");
        loop {
            let popped = tokio::select! {
                _ = shutdown.cancelled() => break,
                popped = self.ctx.store.dequeue(POP_TIMEOUT) => popped,
            };
            match popped {
                Ok(Some(task_id)) => self.process(&task_id).await,
                Ok(None) => {}
                Err(err) => {
                    log::error!("[worker] queue pop failed: {err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        log::info!("[worker] stopped");
    }

    async fn process(&self, task_id: &str) {
        let task = match self.ctx.store.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                log::warn!("[worker] dequeued unknown task {task_id}");
                return;
            }
            Err(err) => {
                log::error!("[worker] task {task_id} unreadable: {err}");
                return;
            }
        };
        if task.is_terminal() {
            // Canceled (or otherwise finished) before a worker picked it up.
            return;
        }
        let Some(request) = task.request.clone() else {
            self.finish(task_id, TaskStatus::Error, "task parameters lost").await;
            return;
        };
        let Some(provider) = self.registry.find(&request.url) else {
            self.finish(task_id, TaskStatus::Error, "unsupported video service").await;
            return;
        };

        log::info!(
            "[worker] task {task_id}: {} download of {}",
            provider.name(),
            request.url
        );
        let outcome =
            tokio::time::timeout(JOB_TIMEOUT, provider.download(&self.ctx, task_id, &request))
                .await;

        match outcome {
            Ok(Ok(path)) => {
                log::info!("[worker] task {task_id} completed: {}", path.display());
                self.complete(task_id, &path).await;
            }
            Ok(Err(err)) if err.is_canceled() => {
                log::info!("[worker] task {task_id} canceled");
                self.finish(task_id, TaskStatus::Canceled, "canceled by user").await;
            }
            Ok(Err(err)) => {
                log::error!("[worker] task {task_id} failed: {err}");
                self.finish(task_id, TaskStatus::Error, &err.to_string()).await;
            }
            Err(_elapsed) => {
                log::error!("[worker] task {task_id} exceeded the job timeout");
                self.finish(task_id, TaskStatus::Error, &DownloadError::Timeout.to_string())
                    .await;
            }
        }
    }

    async fn complete(&self, task_id: &str, path: &std::path::Path) {
        let Ok(Some(mut task)) = self.ctx.store.get_task(task_id).await else {
            log::error!("[worker] completed task {task_id} vanished from the store");
            return;
        };
        task.filepath = path.to_string_lossy().into_owned();
        task.set_percent(100.0);
        task.finish(TaskStatus::Completed, TaskStatus::Completed.as_str());
        if let Err(err) = self.ctx.store.put_task(&task).await {
            log::error!("[worker] final write for {task_id} failed: {err}");
        }
    }

    /// Reload-then-write so the terminal state lands on top of the latest
    /// progress fields.
    async fn finish(&self, task_id: &str, status: TaskStatus, description: &str) {
        let Ok(Some(mut task)) = self.ctx.store.get_task(task_id).await else {
            return;
        };
        task.finish(status, description);
        if let Err(err) = self.ctx.store.put_task(&task).await {
            log::error!("[worker] terminal write for {task_id} failed: {err}");
        }
    }
}
