//! Typed gateway over the shared key-value store.
//!
//! Key layout under the configured prefix: `task:{id}`, `user:{uuid}`
//! (history list), `active:{uuid}` (single-flight lock), `task_user:{id}`,
//! `cancel:{id}`, `meta:{url}`, `events:{id}` (pub/sub channel) and `queue`
//! (the work list).

pub mod kv;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::Settings;
use crate::error::DownloadError;
use crate::task::{MediaSnapshot, TaskRecord};

pub use self::kv::Kv;
pub use self::memory::MemoryKv;
pub use self::redis::RedisKv;

/// Rolling per-user history window; older records are evicted and deleted.
pub const HISTORY_LIMIT: usize = 6;

#[derive(Clone)]
pub struct TaskStore {
    kv: Arc<dyn Kv>,
    prefix: String,
    meta_ttl: Duration,
    lock_ttl: Duration,
}

impl TaskStore {
    pub fn new(kv: Arc<dyn Kv>, settings: &Settings) -> Self {
        Self {
            kv,
            prefix: settings.key_prefix.clone(),
            meta_ttl: settings.meta_ttl,
            lock_ttl: settings.lock_ttl,
        }
    }

    fn key(&self, rest: &str) -> String {
        format!("{}{}", self.prefix, rest)
    }

    fn task_key(&self, task_id: &str) -> String {
        self.key(&format!("task:{task_id}"))
    }

    /// Pub/Sub channel carrying status-block snapshots for one task.
    pub fn channel_for_task(&self, task_id: &str) -> String {
        self.key(&format!("events:{task_id}"))
    }

    // ── task records ────────────────────────────────────────────────────────

    /// Write the record (no TTL — history must outlive one session), then
    /// publish its status block and, on a terminal status, release the
    /// owner's lock. Publish and release failures are logged, never allowed
    /// to mask the successful write.
    pub async fn put_task(&self, task: &TaskRecord) -> Result<(), DownloadError> {
        let json = task.to_json()?;
        self.kv.set(&self.task_key(task.id()), &json, None, false).await?;

        match serde_json::to_string(&task.status) {
            Ok(snapshot) => {
                if let Err(err) = self
                    .kv
                    .publish(&self.channel_for_task(task.id()), &snapshot)
                    .await
                {
                    log::warn!("[store] publish failed for task {}: {err}", task.id());
                }
            }
            Err(err) => log::warn!("[store] snapshot serialize failed: {err}"),
        }

        if task.is_terminal() {
            match self.get_task_user(task.id()).await {
                Ok(Some(user_id)) => {
                    if let Err(err) = self.release_lock(&user_id, Some(task.id())).await {
                        log::warn!("[store] lock release failed for user {user_id}: {err}");
                    }
                }
                Ok(None) => {}
                Err(err) => log::warn!("[store] task_user lookup failed: {err}"),
            }
        }
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, DownloadError> {
        match self.kv.get(&self.task_key(task_id)).await? {
            Some(raw) => Ok(Some(TaskRecord::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn task_exists(&self, task_id: &str) -> Result<bool, DownloadError> {
        self.kv.exists(&self.task_key(task_id)).await
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<(), DownloadError> {
        self.kv.del(&self.task_key(task_id)).await
    }

    /// All stored records, for restart recovery.
    pub async fn scan_tasks(&self) -> Result<Vec<(String, TaskRecord)>, DownloadError> {
        let key_prefix = self.key("task:");
        let mut tasks = Vec::new();
        for key in self.kv.scan_prefix(&key_prefix).await? {
            let Some(task_id) = key.strip_prefix(&key_prefix) else {
                continue;
            };
            match self.get_task(task_id).await {
                Ok(Some(task)) => tasks.push((task_id.to_string(), task)),
                Ok(None) => {}
                Err(err) => log::warn!("[store] skipping unreadable task {task_id}: {err}"),
            }
        }
        Ok(tasks)
    }

    // ── user history ────────────────────────────────────────────────────────

    /// Prepend to the user's history, trim to [`HISTORY_LIMIT`] and delete
    /// the displaced records (best-effort).
    pub async fn append_user_task(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<(), DownloadError> {
        let key = self.key(&format!("user:{user_id}"));
        let displaced = self
            .kv
            .lrange(&key, HISTORY_LIMIT as i64 - 1, -1)
            .await
            .unwrap_or_default();

        self.kv.lpush(&key, task_id).await?;
        self.kv.ltrim(&key, 0, HISTORY_LIMIT as i64 - 1).await?;

        for old_id in displaced {
            if let Err(err) = self.delete_task(&old_id).await {
                log::warn!("[store] evicted task {old_id} not deleted: {err}");
            }
        }
        Ok(())
    }

    pub async fn user_tasks(&self, user_id: &str) -> Result<Vec<String>, DownloadError> {
        self.kv
            .lrange(&self.key(&format!("user:{user_id}")), 0, -1)
            .await
    }

    // ── single-flight lock ──────────────────────────────────────────────────

    /// Create-only acquire with the lock TTL. Idempotent under retry: the
    /// call also succeeds when the lock already names this task.
    pub async fn acquire_lock(&self, user_id: &str, task_id: &str) -> Result<bool, DownloadError> {
        let key = self.key(&format!("active:{user_id}"));
        if self.kv.set(&key, task_id, Some(self.lock_ttl), true).await? {
            return Ok(true);
        }
        Ok(self.kv.get(&key).await?.as_deref() == Some(task_id))
    }

    /// Release the lock. With a task id, only clears when the lock still
    /// names that task; with `None`, force-clears (stale recovery).
    pub async fn release_lock(
        &self,
        user_id: &str,
        task_id: Option<&str>,
    ) -> Result<(), DownloadError> {
        let key = self.key(&format!("active:{user_id}"));
        match task_id {
            Some(task_id) => {
                self.kv.compare_and_delete(&key, task_id).await?;
            }
            None => self.kv.del(&key).await?,
        }
        Ok(())
    }

    pub async fn get_user_active_task(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, DownloadError> {
        self.kv.get(&self.key(&format!("active:{user_id}"))).await
    }

    // ── reverse map & cancel flag ───────────────────────────────────────────

    pub async fn set_task_user(&self, task_id: &str, user_id: &str) -> Result<(), DownloadError> {
        self.kv
            .set(
                &self.key(&format!("task_user:{task_id}")),
                user_id,
                Some(self.lock_ttl),
                false,
            )
            .await?;
        Ok(())
    }

    pub async fn get_task_user(&self, task_id: &str) -> Result<Option<String>, DownloadError> {
        self.kv.get(&self.key(&format!("task_user:{task_id}"))).await
    }

    pub async fn set_canceled(&self, task_id: &str) -> Result<(), DownloadError> {
        self.kv
            .set(
                &self.key(&format!("cancel:{task_id}")),
                "1",
                Some(self.lock_ttl),
                false,
            )
            .await?;
        Ok(())
    }

    pub async fn clear_canceled(&self, task_id: &str) -> Result<(), DownloadError> {
        self.kv.del(&self.key(&format!("cancel:{task_id}"))).await
    }

    pub async fn is_canceled(&self, task_id: &str) -> Result<bool, DownloadError> {
        self.kv.exists(&self.key(&format!("cancel:{task_id}"))).await
    }

    // ── metadata cache ──────────────────────────────────────────────────────

    pub async fn get_meta(&self, url: &str) -> Result<Option<MediaSnapshot>, DownloadError> {
        match self.kv.get(&self.key(&format!("meta:{url}"))).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub async fn put_meta(&self, url: &str, meta: &MediaSnapshot) -> Result<(), DownloadError> {
        let json = serde_json::to_string(meta)?;
        self.kv
            .set(
                &self.key(&format!("meta:{url}")),
                &json,
                Some(self.meta_ttl),
                false,
            )
            .await?;
        Ok(())
    }

    // ── work queue & events ─────────────────────────────────────────────────

    pub async fn enqueue(&self, task_id: &str) -> Result<(), DownloadError> {
        self.kv.queue_push(&self.key("queue"), task_id).await
    }

    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<String>, DownloadError> {
        self.kv.queue_pop(&self.key("queue"), timeout).await
    }

    pub async fn subscribe_events(
        &self,
        task_id: &str,
    ) -> Result<mpsc::Receiver<String>, DownloadError> {
        self.kv.subscribe(&self.channel_for_task(task_id)).await
    }
}
