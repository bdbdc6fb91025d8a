use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use vdl_core::providers::{DownloadCtx, Provider, ProviderRegistry};
use vdl_core::store::{MemoryKv, TaskStore};
use vdl_core::task::{
    DownloadRequest, MediaSnapshot, MediaVariant, TaskRecord, TaskStatus,
};
use vdl_core::{DownloadError, Orchestrator, Settings, Worker};

// ---------------------------------------------------------------
// Test fixture: an in-memory store plus a scriptable provider
// ---------------------------------------------------------------

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    WaitForCancel,
}

struct StubProvider {
    behavior: Behavior,
}

fn stub_media(url: &str) -> MediaSnapshot {
    MediaSnapshot {
        url: url.to_string(),
        title: "Stub Title".into(),
        author: "Stub Author".into(),
        duration: Some(5),
        preview_url: None,
        variants: vec![MediaVariant {
            quality: "720p".into(),
            video_variant_id: "v1".into(),
            audio_variant_id: "a1".into(),
            filesize: Some(64),
        }],
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &'static str {
        "Stub"
    }

    async fn resolve_formats(
        &self,
        _ctx: &DownloadCtx,
        url: &str,
    ) -> Result<MediaSnapshot, DownloadError> {
        Ok(stub_media(url))
    }

    async fn download(
        &self,
        ctx: &DownloadCtx,
        task_id: &str,
        _request: &DownloadRequest,
    ) -> Result<std::path::PathBuf, DownloadError> {
        match self.behavior {
            Behavior::Succeed => {
                let dest = ctx.settings.download_dir.join(format!("{task_id}_out.mp4"));
                tokio::fs::write(&dest, b"media bytes").await?;
                Ok(dest)
            }
            Behavior::Fail => Err(DownloadError::Provider("upstream said no".into())),
            Behavior::WaitForCancel => {
                for _ in 0..500 {
                    if ctx.store.is_canceled(task_id).await? {
                        return Err(DownloadError::Canceled);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                panic!("cancel flag never arrived");
            }
        }
    }
}

struct Fixture {
    orchestrator: Arc<Orchestrator>,
    store: TaskStore,
    ctx: DownloadCtx,
    registry: Arc<ProviderRegistry>,
    _tmp: tempfile::TempDir,
}

fn fixture(behavior: Behavior) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let settings = Arc::new(Settings {
        download_dir: tmp.path().to_path_buf(),
        ffmpeg_path: "ffmpeg".into(),
        redis_url: String::new(),
        key_prefix: "test:".into(),
        meta_ttl: Duration::from_secs(60),
        lock_ttl: Duration::from_secs(3600),
        min_video_height: 360,
        instagram_csrftoken: String::new(),
        instagram_sessionid: String::new(),
    });
    let store = TaskStore::new(Arc::new(MemoryKv::new()), &settings);
    let mut registry = ProviderRegistry::new();
    registry.register(vec!["example.com"], Arc::new(StubProvider { behavior }));
    let registry = Arc::new(registry);
    let ctx = DownloadCtx::new(store.clone(), settings);
    let orchestrator = Arc::new(Orchestrator::new(ctx.clone(), Arc::clone(&registry)));
    Fixture {
        orchestrator,
        store,
        ctx,
        registry,
        _tmp: tmp,
    }
}

fn request() -> DownloadRequest {
    DownloadRequest {
        url: "https://example.com/watch/1".into(),
        video_variant_id: "v1".into(),
        audio_variant_id: "a1".into(),
        start_seconds: None,
        end_seconds: None,
    }
}

async fn wait_for_status(
    orchestrator: &Orchestrator,
    task_id: &str,
    wanted: TaskStatus,
) -> vdl_core::StatusBlock {
    for _ in 0..200 {
        let status = orchestrator.get_status(task_id).await.unwrap().unwrap();
        if status.status == wanted {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached {wanted:?}");
}

// ---------------------------------------------------------------
// Admission
// ---------------------------------------------------------------

#[tokio::test]
async fn start_creates_a_pending_task_and_enqueues_it() {
    let fx = fixture(Behavior::Succeed);
    let status = fx.orchestrator.start_download("u-1", request()).await.unwrap();

    assert_eq!(status.status, TaskStatus::Pending);
    assert_eq!(status.percent, 0.0);
    assert!(status.created_at.is_some());
    assert_eq!(status.media.title, "Stub Title");

    let queued = fx.store.dequeue(Duration::from_millis(100)).await.unwrap();
    assert_eq!(queued.as_deref(), Some(status.task_id.as_str()));
    assert_eq!(
        fx.store.get_user_active_task("u-1").await.unwrap().as_deref(),
        Some(status.task_id.as_str())
    );
    assert_eq!(fx.store.user_tasks("u-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn second_start_conflicts_while_first_is_live() {
    let fx = fixture(Behavior::Succeed);
    fx.orchestrator.start_download("u-1", request()).await.unwrap();

    let err = fx.orchestrator.start_download("u-1", request()).await.unwrap_err();
    assert!(matches!(err, DownloadError::LockConflict));
}

#[tokio::test]
async fn anonymous_user_bypasses_the_lock() {
    let fx = fixture(Behavior::Succeed);
    fx.orchestrator.start_download("0", request()).await.unwrap();
    fx.orchestrator.start_download("0", request()).await.unwrap();
    assert_eq!(fx.store.user_tasks("0").await.unwrap().len(), 2);
}

#[tokio::test]
async fn stale_lock_is_force_released() {
    let fx = fixture(Behavior::Succeed);
    // Lock pointing at a task the store no longer has.
    assert!(fx.store.acquire_lock("u-1", "ghost").await.unwrap());

    let status = fx.orchestrator.start_download("u-1", request()).await.unwrap();
    assert_eq!(
        fx.store.get_user_active_task("u-1").await.unwrap().as_deref(),
        Some(status.task_id.as_str())
    );
}

#[tokio::test]
async fn unknown_provider_is_rejected() {
    let fx = fixture(Behavior::Succeed);
    let mut bad = request();
    bad.url = "https://nobody-knows.test/v".into();
    let err = fx.orchestrator.start_download("u-1", bad).await.unwrap_err();
    assert!(matches!(err, DownloadError::UnsupportedUrl));
}

#[tokio::test]
async fn formats_are_cached_after_first_resolve() {
    let fx = fixture(Behavior::Succeed);
    let media = fx.orchestrator.resolve_formats("https://example.com/w").await.unwrap();
    assert_eq!(media.variants.len(), 1);
    assert!(fx.store.get_meta("https://example.com/w").await.unwrap().is_some());
}

// ---------------------------------------------------------------
// Worker lifecycle
// ---------------------------------------------------------------

#[tokio::test]
async fn worker_drives_a_task_to_completed() {
    let fx = fixture(Behavior::Succeed);
    let status = fx.orchestrator.start_download("u-1", request()).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = Worker::new(fx.ctx.clone(), Arc::clone(&fx.registry));
    let guard = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(guard).await });

    let done = wait_for_status(&fx.orchestrator, &status.task_id, TaskStatus::Completed).await;
    assert_eq!(done.percent, 100.0);
    assert_eq!(done.description.as_deref(), Some("completed"));

    let record = fx.store.get_task(&status.task_id).await.unwrap().unwrap();
    assert!(record.filepath.ends_with("_out.mp4"));
    assert!(PathBuf::from(&record.filepath).exists());
    // Terminal write released the single-flight lock.
    assert_eq!(fx.store.get_user_active_task("u-1").await.unwrap(), None);

    shutdown.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn provider_failure_becomes_terminal_error() {
    let fx = fixture(Behavior::Fail);
    let status = fx.orchestrator.start_download("u-1", request()).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = Worker::new(fx.ctx.clone(), Arc::clone(&fx.registry));
    let guard = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(guard).await });

    let failed = wait_for_status(&fx.orchestrator, &status.task_id, TaskStatus::Error).await;
    assert_eq!(failed.description.as_deref(), Some("upstream said no"));
    assert_eq!(fx.store.get_user_active_task("u-1").await.unwrap(), None);

    shutdown.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn cancel_mid_transfer_ends_in_canceled() {
    let fx = fixture(Behavior::WaitForCancel);
    let status = fx.orchestrator.start_download("u-1", request()).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = Worker::new(fx.ctx.clone(), Arc::clone(&fx.registry));
    let guard = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(guard).await });

    // Give the worker a moment to pick the task up, then pull the plug.
    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.orchestrator.cancel_download(&status.task_id).await.unwrap();

    let canceled = wait_for_status(&fx.orchestrator, &status.task_id, TaskStatus::Canceled).await;
    assert_eq!(canceled.description.as_deref(), Some("canceled by user"));
    assert_eq!(fx.store.get_user_active_task("u-1").await.unwrap(), None);

    shutdown.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn cancel_before_pickup_is_final() {
    let fx = fixture(Behavior::Succeed);
    let status = fx.orchestrator.start_download("u-1", request()).await.unwrap();
    fx.orchestrator.cancel_download(&status.task_id).await.unwrap();

    let canceled = fx.orchestrator.get_status(&status.task_id).await.unwrap().unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);
    assert!(fx.store.is_canceled(&status.task_id).await.unwrap());

    // A worker arriving later must not resurrect the task.
    let shutdown = CancellationToken::new();
    let worker = Worker::new(fx.ctx.clone(), Arc::clone(&fx.registry));
    let guard = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(guard).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let still = fx.orchestrator.get_status(&status.task_id).await.unwrap().unwrap();
    assert_eq!(still.status, TaskStatus::Canceled);

    shutdown.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let fx = fixture(Behavior::Succeed);
    let status = fx.orchestrator.start_download("u-1", request()).await.unwrap();
    fx.orchestrator.cancel_download(&status.task_id).await.unwrap();
    fx.orchestrator.cancel_download(&status.task_id).await.unwrap();
    let canceled = fx.orchestrator.get_status(&status.task_id).await.unwrap().unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);
}

// ---------------------------------------------------------------
// Delivery transition & history
// ---------------------------------------------------------------

#[tokio::test]
async fn delivered_task_flips_completed_to_done_only() {
    let fx = fixture(Behavior::Succeed);
    let status = fx.orchestrator.start_download("u-1", request()).await.unwrap();

    // Not yet completed: nothing happens.
    fx.orchestrator.mark_delivered(&status.task_id).await.unwrap();
    assert_eq!(
        fx.orchestrator.get_status(&status.task_id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );

    let mut record = fx.store.get_task(&status.task_id).await.unwrap().unwrap();
    record.finish(TaskStatus::Completed, "completed");
    fx.store.put_task(&record).await.unwrap();

    fx.orchestrator.mark_delivered(&status.task_id).await.unwrap();
    assert_eq!(
        fx.orchestrator.get_status(&status.task_id).await.unwrap().unwrap().status,
        TaskStatus::Done
    );
}

#[tokio::test]
async fn history_returns_newest_first() {
    let fx = fixture(Behavior::Succeed);
    let first = fx.orchestrator.start_download("0", request()).await.unwrap();
    let second = fx.orchestrator.start_download("0", request()).await.unwrap();

    let history = fx.orchestrator.user_history("0").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].task_id, second.task_id);
    assert_eq!(history[1].task_id, first.task_id);
}

// ---------------------------------------------------------------
// Restart recovery
// ---------------------------------------------------------------

fn pending_record(task_id: &str, with_request: bool) -> TaskRecord {
    let mut record = TaskRecord::new(
        task_id.into(),
        stub_media("https://example.com/watch/1"),
        request(),
    );
    if !with_request {
        record.request = None;
    }
    record
}

#[tokio::test]
async fn recovery_requeues_resumable_pending_tasks() {
    let fx = fixture(Behavior::Succeed);
    let record = pending_record("11111111-1111-1111-1111-111111111111", true);
    fx.store.put_task(&record).await.unwrap();
    fx.store.set_task_user(record.id(), "u-1").await.unwrap();

    fx.orchestrator.recover().await.unwrap();

    let queued = fx.store.dequeue(Duration::from_millis(100)).await.unwrap();
    assert_eq!(queued.as_deref(), Some(record.id()));
    // The lock was re-acquired for the resumed task.
    assert_eq!(
        fx.store.get_user_active_task("u-1").await.unwrap().as_deref(),
        Some(record.id())
    );
    assert_eq!(
        fx.orchestrator.get_status(record.id()).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn recovery_fails_pending_tasks_without_request() {
    let fx = fixture(Behavior::Succeed);
    let record = pending_record("22222222-2222-2222-2222-222222222222", false);
    fx.store.put_task(&record).await.unwrap();

    fx.orchestrator.recover().await.unwrap();

    let status = fx.orchestrator.get_status(record.id()).await.unwrap().unwrap();
    assert_eq!(status.status, TaskStatus::Error);
    assert!(status.description.unwrap().contains("task parameters lost"));
    assert_eq!(fx.store.dequeue(Duration::from_millis(50)).await.unwrap(), None);
}

#[tokio::test]
async fn recovery_releases_locks_of_finished_tasks() {
    let fx = fixture(Behavior::Succeed);
    let mut record = pending_record("33333333-3333-3333-3333-333333333333", true);
    record.finish(TaskStatus::Completed, "completed");
    fx.store.put_task(&record).await.unwrap();
    fx.store.set_task_user(record.id(), "u-1").await.unwrap();
    assert!(fx.store.acquire_lock("u-1", record.id()).await.unwrap());

    fx.orchestrator.recover().await.unwrap();

    assert_eq!(fx.store.get_user_active_task("u-1").await.unwrap(), None);
    assert_eq!(fx.store.dequeue(Duration::from_millis(50)).await.unwrap(), None);
}

#[tokio::test]
async fn recovery_skips_tasks_whose_user_is_busy() {
    let fx = fixture(Behavior::Succeed);
    let record = pending_record("44444444-4444-4444-4444-444444444444", true);
    fx.store.put_task(&record).await.unwrap();
    fx.store.set_task_user(record.id(), "u-1").await.unwrap();
    assert!(fx.store.acquire_lock("u-1", "some-other-task").await.unwrap());

    fx.orchestrator.recover().await.unwrap();

    assert_eq!(fx.store.dequeue(Duration::from_millis(50)).await.unwrap(), None);
}
