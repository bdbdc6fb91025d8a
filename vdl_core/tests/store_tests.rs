use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vdl_core::store::{MemoryKv, TaskStore, HISTORY_LIMIT};
use vdl_core::task::{
    DownloadRequest, MediaSnapshot, MediaVariant, StatusBlock, TaskRecord, TaskStatus,
};
use vdl_core::Settings;

fn test_settings() -> Settings {
    Settings {
        download_dir: PathBuf::from("."),
        ffmpeg_path: "ffmpeg".into(),
        redis_url: String::new(),
        key_prefix: "test:".into(),
        meta_ttl: Duration::from_millis(50),
        lock_ttl: Duration::from_secs(3600),
        min_video_height: 360,
        instagram_csrftoken: String::new(),
        instagram_sessionid: String::new(),
    }
}

fn store() -> TaskStore {
    TaskStore::new(Arc::new(MemoryKv::new()), &test_settings())
}

fn record(task_id: &str) -> TaskRecord {
    let media = MediaSnapshot {
        url: "https://youtube.com/watch?v=X".into(),
        title: "Title".into(),
        author: "Author".into(),
        duration: Some(10),
        preview_url: None,
        variants: vec![MediaVariant {
            quality: "720p".into(),
            video_variant_id: "22".into(),
            audio_variant_id: "140".into(),
            filesize: None,
        }],
    };
    let request = DownloadRequest {
        url: media.url.clone(),
        video_variant_id: "22".into(),
        audio_variant_id: "140".into(),
        start_seconds: None,
        end_seconds: None,
    };
    TaskRecord::new(task_id.into(), media, request)
}

#[tokio::test]
async fn put_then_get_round_trips() {
    let store = store();
    let task = record("t-1");
    store.put_task(&task).await.unwrap();

    let loaded = store.get_task("t-1").await.unwrap().unwrap();
    assert_eq!(loaded.id(), "t-1");
    assert_eq!(loaded.status.status, TaskStatus::Pending);
    assert_eq!(loaded.status.media.title, "Title");
    assert!(store.task_exists("t-1").await.unwrap());
    assert!(store.get_task("t-2").await.unwrap().is_none());
}

#[tokio::test]
async fn put_publishes_the_status_block() {
    let store = store();
    let mut rx = store.subscribe_events("t-1").await.unwrap();

    let mut task = record("t-1");
    task.set_percent(42.0);
    store.put_task(&task).await.unwrap();

    let payload = rx.recv().await.unwrap();
    let snapshot: StatusBlock = serde_json::from_str(&payload).unwrap();
    assert_eq!(snapshot.task_id, "t-1");
    assert_eq!(snapshot.percent, 42.0);
}

#[tokio::test]
async fn terminal_put_releases_the_owning_lock() {
    let store = store();
    let mut task = record("t-1");
    store.put_task(&task).await.unwrap();
    assert!(store.acquire_lock("u-1", "t-1").await.unwrap());
    store.set_task_user("t-1", "u-1").await.unwrap();

    task.finish(TaskStatus::Error, "boom");
    store.put_task(&task).await.unwrap();

    assert_eq!(store.get_user_active_task("u-1").await.unwrap(), None);
}

#[tokio::test]
async fn terminal_put_leaves_a_newer_lock_alone() {
    let store = store();
    let mut task = record("t-1");
    store.put_task(&task).await.unwrap();
    store.set_task_user("t-1", "u-1").await.unwrap();
    // The user has already moved on to another task.
    assert!(store.acquire_lock("u-1", "t-2").await.unwrap());

    task.finish(TaskStatus::Canceled, "canceled by user");
    store.put_task(&task).await.unwrap();

    assert_eq!(
        store.get_user_active_task("u-1").await.unwrap().as_deref(),
        Some("t-2")
    );
}

#[tokio::test]
async fn lock_acquire_is_create_only_but_idempotent() {
    let store = store();
    assert!(store.acquire_lock("u-1", "t-1").await.unwrap());
    assert!(store.acquire_lock("u-1", "t-1").await.unwrap(), "same task retries fine");
    assert!(!store.acquire_lock("u-1", "t-2").await.unwrap(), "other task is rejected");

    store.release_lock("u-1", Some("t-2")).await.unwrap();
    assert!(
        store.get_user_active_task("u-1").await.unwrap().is_some(),
        "mismatched release is a no-op"
    );
    store.release_lock("u-1", Some("t-1")).await.unwrap();
    assert_eq!(store.get_user_active_task("u-1").await.unwrap(), None);
}

#[tokio::test]
async fn force_release_clears_any_holder() {
    let store = store();
    assert!(store.acquire_lock("u-1", "t-1").await.unwrap());
    store.release_lock("u-1", None).await.unwrap();
    assert_eq!(store.get_user_active_task("u-1").await.unwrap(), None);
}

#[tokio::test]
async fn history_is_truncated_and_evicted_records_deleted() {
    let store = store();
    for i in 0..8 {
        let task_id = format!("t-{i}");
        store.put_task(&record(&task_id)).await.unwrap();
        store.append_user_task("u-1", &task_id).await.unwrap();
    }

    let history = store.user_tasks("u-1").await.unwrap();
    assert_eq!(history.len(), HISTORY_LIMIT);
    assert_eq!(history[0], "t-7", "newest first");
    assert_eq!(history[HISTORY_LIMIT - 1], "t-2");

    // The two displaced records are gone from the store entirely.
    assert!(!store.task_exists("t-0").await.unwrap());
    assert!(!store.task_exists("t-1").await.unwrap());
    assert!(store.task_exists("t-2").await.unwrap());
}

#[tokio::test]
async fn cancel_flag_is_independent_of_status() {
    let store = store();
    assert!(!store.is_canceled("t-1").await.unwrap());
    store.set_canceled("t-1").await.unwrap();
    assert!(store.is_canceled("t-1").await.unwrap());
    store.clear_canceled("t-1").await.unwrap();
    assert!(!store.is_canceled("t-1").await.unwrap());
}

#[tokio::test]
async fn meta_cache_expires() {
    let store = store();
    let media = record("t-x").status.media;
    store.put_meta("https://u", &media).await.unwrap();
    assert!(store.get_meta("https://u").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(store.get_meta("https://u").await.unwrap().is_none());
}

#[tokio::test]
async fn scan_finds_every_task() {
    let store = store();
    store.put_task(&record("t-1")).await.unwrap();
    store.put_task(&record("t-2")).await.unwrap();

    let mut ids: Vec<String> = store
        .scan_tasks()
        .await
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["t-1", "t-2"]);
}

#[tokio::test]
async fn queue_delivers_each_id_once() {
    let store = store();
    store.enqueue("t-1").await.unwrap();
    store.enqueue("t-2").await.unwrap();

    let first = store.dequeue(Duration::from_millis(50)).await.unwrap();
    let second = store.dequeue(Duration::from_millis(50)).await.unwrap();
    let third = store.dequeue(Duration::from_millis(50)).await.unwrap();
    assert_eq!(first.as_deref(), Some("t-1"));
    assert_eq!(second.as_deref(), Some("t-2"));
    assert_eq!(third, None);
}
