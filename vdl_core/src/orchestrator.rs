//! Task lifecycle engine: admission, creation, cancellation and restart
//! recovery. The HTTP layer only ever talks to this type; the orchestrator
//! owns the store.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::DownloadError;
use crate::providers::{DownloadCtx, ProviderRegistry};
use crate::store::TaskStore;
use crate::task::{DownloadRequest, MediaSnapshot, StatusBlock, TaskRecord, TaskStatus};

/// Shared id for clients without a cookie; exempt from the per-user lock.
pub const ANONYMOUS_USER: &str = "0";

pub struct Orchestrator {
    ctx: DownloadCtx,
    registry: Arc<ProviderRegistry>,
}

impl Orchestrator {
    pub fn new(ctx: DownloadCtx, registry: Arc<ProviderRegistry>) -> Self {
        Self { ctx, registry }
    }

    pub fn store(&self) -> &TaskStore {
        &self.ctx.store
    }

    /// Media snapshot for a URL, cache first. Successful resolutions are
    /// cached with the short advisory TTL.
    pub async fn resolve_formats(&self, url: &str) -> Result<MediaSnapshot, DownloadError> {
        if let Some(cached) = self.ctx.store.get_meta(url).await? {
            return Ok(cached);
        }
        let provider = self
            .registry
            .find(url)
            .ok_or(DownloadError::UnsupportedUrl)?;
        log::info!("[orchestrator] resolving formats via {} for {url}", provider.name());
        let media = provider.resolve_formats(&self.ctx, url).await?;
        if let Err(err) = self.ctx.store.put_meta(url, &media).await {
            log::warn!("[orchestrator] meta cache write failed: {err}");
        }
        Ok(media)
    }

    /// Admit and enqueue a new download for `user_id`.
    ///
    /// A present lock is honored only while it points at a live, resumable
    /// task; anything else (record gone, terminal, PENDING without its
    /// request) counts as stale and is force-released.
    pub async fn start_download(
        &self,
        user_id: &str,
        request: DownloadRequest,
    ) -> Result<StatusBlock, DownloadError> {
        let store = &self.ctx.store;

        if user_id != ANONYMOUS_USER {
            if let Some(active_id) = store.get_user_active_task(user_id).await? {
                let live = match store.get_task(&active_id).await? {
                    Some(active) => !active.is_terminal() && active.request.is_some(),
                    None => false,
                };
                if live {
                    return Err(DownloadError::LockConflict);
                }
                log::info!("[orchestrator] releasing stale lock for user {user_id} (task {active_id})");
                store.release_lock(user_id, None).await?;
            }
        }

        let media = self.resolve_formats(&request.url).await?;
        let task_id = Uuid::new_v4().to_string();
        let record = TaskRecord::new(task_id.clone(), media, request);

        store.put_task(&record).await?;
        store.append_user_task(user_id, &task_id).await?;

        if user_id != ANONYMOUS_USER && !store.acquire_lock(user_id, &task_id).await? {
            // Lost the race against a concurrent start; leave no orphan.
            let _ = store.delete_task(&task_id).await;
            return Err(DownloadError::LockConflict);
        }
        store.set_task_user(&task_id, user_id).await?;
        store.enqueue(&task_id).await?;

        log::info!("[orchestrator] task {task_id} queued for user {user_id}");
        Ok(record.status)
    }

    /// Flag a task for cancellation and mark it CANCELED if still live.
    /// Safe to call repeatedly; terminal tasks only get their flag set.
    pub async fn cancel_download(&self, task_id: &str) -> Result<(), DownloadError> {
        let store = &self.ctx.store;
        let mut task = store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))?;

        store.set_canceled(task_id).await?;
        task.finish(TaskStatus::Canceled, "canceled by user");
        store.put_task(&task).await?;
        log::info!("[orchestrator] task {task_id} canceled");
        Ok(())
    }

    pub async fn get_status(&self, task_id: &str) -> Result<Option<StatusBlock>, DownloadError> {
        Ok(self
            .ctx
            .store
            .get_task(task_id)
            .await?
            .map(|task| task.status))
    }

    /// Up to six most recent status blocks for a user, newest first.
    pub async fn user_history(&self, user_id: &str) -> Result<Vec<StatusBlock>, DownloadError> {
        let mut history = Vec::new();
        for task_id in self.ctx.store.user_tasks(user_id).await? {
            if let Some(task) = self.ctx.store.get_task(&task_id).await? {
                history.push(task.status);
            }
        }
        Ok(history)
    }

    /// Flip a streamed-out task from COMPLETED to DONE and publish the
    /// terminal snapshot.
    pub async fn mark_delivered(&self, task_id: &str) -> Result<(), DownloadError> {
        let store = &self.ctx.store;
        let Some(mut task) = store.get_task(task_id).await? else {
            return Ok(());
        };
        if task.status.status == TaskStatus::Completed {
            task.finish(TaskStatus::Done, "done");
            store.put_task(&task).await?;
        }
        Ok(())
    }

    /// Startup pass over every stored task: re-enqueue resumable PENDING
    /// work, fail the unresumable leftovers and release locks held by
    /// finished tasks.
    pub async fn recover(&self) -> Result<(), DownloadError> {
        let store = &self.ctx.store;
        let tasks = store.scan_tasks().await?;
        log::info!("[orchestrator] recovery: {} stored task(s)", tasks.len());

        for (task_id, mut task) in tasks {
            if task.is_terminal() {
                if let Ok(Some(user_id)) = store.get_task_user(&task_id).await {
                    if let Err(err) = store.release_lock(&user_id, Some(&task_id)).await {
                        log::warn!("[recover] lock release for {task_id} failed: {err}");
                    }
                }
                continue;
            }

            if task.request.is_none() {
                task.finish(
                    TaskStatus::Error,
                    "server restarted; task parameters lost. Start a new download.",
                );
                store.put_task(&task).await?;
                continue;
            }

            // Reconcile the lock before handing the task back to the queue.
            let user_id = store.get_task_user(&task_id).await?;
            if let Some(user_id) = user_id.filter(|u| u != ANONYMOUS_USER) {
                match store.get_user_active_task(&user_id).await? {
                    None => {
                        let _ = store.acquire_lock(&user_id, &task_id).await;
                    }
                    Some(active) if active != task_id => {
                        log::warn!(
                            "[recover] task {task_id} skipped: user {user_id} busy with {active}"
                        );
                        continue;
                    }
                    Some(_) => {}
                }
            }

            if let Err(err) = store.enqueue(&task_id).await {
                log::error!("[recover] re-enqueue of {task_id} failed: {err}");
                task.finish(TaskStatus::Error, "Failed to resume after restart");
                store.put_task(&task).await?;
                continue;
            }
            log::info!("[recover] task {task_id} re-enqueued");
        }
        Ok(())
    }
}
