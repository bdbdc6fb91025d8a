//! Provider adapters: variant discovery and byte-level download for each
//! supported source. Selection is by URL substring match; registration
//! order defines priority.

pub mod http;
pub mod instagram;
pub mod rutube;
pub mod tiktok;
pub mod vk;
pub mod youtube;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Settings;
use crate::error::DownloadError;
use crate::pipeline::MediaPipeline;
use crate::progress::{percent_of, SpeedMeter};
use crate::store::TaskStore;
use crate::task::{DownloadRequest, MediaSnapshot, TaskRecord};

/// Everything an adapter needs to run a download: the store for progress
/// and cancel checks, the media pipeline, a shared HTTP client and the
/// process configuration.
#[derive(Clone)]
pub struct DownloadCtx {
    pub store: TaskStore,
    pub settings: Arc<Settings>,
    pub pipeline: MediaPipeline,
    pub http: reqwest::Client,
}

impl DownloadCtx {
    pub fn new(store: TaskStore, settings: Arc<Settings>) -> Self {
        let pipeline = MediaPipeline::new(&settings.ffmpeg_path);
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            store,
            settings,
            pipeline,
            http,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce the media snapshot for a URL: title, author, duration,
    /// preview and the selectable variants.
    async fn resolve_formats(&self, ctx: &DownloadCtx, url: &str)
        -> Result<MediaSnapshot, DownloadError>;

    /// Perform the transfer for an existing PENDING task and return the
    /// produced file. Progress is written to the store at every chunk
    /// boundary; the cancel flag aborts with [`DownloadError::Canceled`].
    async fn download(
        &self,
        ctx: &DownloadCtx,
        task_id: &str,
        request: &DownloadRequest,
    ) -> Result<PathBuf, DownloadError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ProviderRegistry {
    entries: Vec<(Vec<&'static str>, Arc<dyn Provider>)>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// All built-in providers in priority order.
    pub fn with_defaults(settings: &Settings) -> Self {
        let mut registry = Self::new();
        registry.register(
            vec!["youtube", "youtu.be", "shorts"],
            Arc::new(youtube::YouTubeProvider::new(settings.min_video_height)),
        );
        registry.register(
            vec!["instagram", "reels"],
            Arc::new(instagram::InstagramProvider::new(
                &settings.instagram_csrftoken,
                &settings.instagram_sessionid,
            )),
        );
        registry.register(
            vec!["vkvideo", "vk.com/video", "vk.com/club", "vk.com/clip"],
            Arc::new(vk::VkProvider::new()),
        );
        registry.register(
            vec![
                "rutube.ru",
                "rutube.ru/video",
                "rutube",
                "rutube.ru/play",
                "rutube.ru/embed",
            ],
            Arc::new(rutube::RutubeProvider::new()),
        );
        registry.register(
            vec!["tiktok.com", "www.tiktok.com", "vt.tiktok.com"],
            Arc::new(tiktok::TikTokProvider::new()),
        );
        registry
    }

    pub fn register(&mut self, keywords: Vec<&'static str>, provider: Arc<dyn Provider>) {
        self.entries.push((keywords, provider));
    }

    /// First registered provider whose keyword occurs in the URL.
    pub fn find(&self, url: &str) -> Option<Arc<dyn Provider>> {
        self.entries
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|kw| url.contains(kw)))
            .map(|(_, provider)| Arc::clone(provider))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Progress sink
// ---------------------------------------------------------------------------

/// Owns the task record during a download and funnels every mutation
/// through one place: clamp percent, smooth the speed, derive the ETA,
/// write the record (which also publishes it) and poll the cancel flag.
pub struct ProgressSink {
    store: TaskStore,
    task: TaskRecord,
    meter: SpeedMeter,
    received: u64,
    total: Option<u64>,
}

impl ProgressSink {
    pub fn new(store: TaskStore, task: TaskRecord, total: Option<u64>) -> Self {
        Self {
            store,
            task,
            meter: SpeedMeter::new(),
            received: 0,
            total,
        }
    }

    pub fn set_total(&mut self, total: Option<u64>) {
        self.total = total;
    }

    /// Record `bytes` received at a chunk boundary.
    pub async fn advance(&mut self, bytes: u64) -> Result<(), DownloadError> {
        self.received += bytes;
        let speed = self.meter.record(bytes);
        self.task.set_percent(percent_of(self.received, self.total));
        self.task.status.speed_bps = Some(speed);
        self.task.status.eta_seconds = self
            .total
            .and_then(|total| self.meter.eta_seconds(total.saturating_sub(self.received)));
        self.write_and_check().await
    }

    /// Progress expressed directly as a percentage (HLS ingestion).
    pub async fn advance_percent(&mut self, percent: f64) -> Result<(), DownloadError> {
        self.task.set_percent(percent);
        self.write_and_check().await
    }

    /// Update the narration line ("Downloading audio track", …).
    pub async fn describe(&mut self, text: &str) -> Result<(), DownloadError> {
        self.task.set_description(text);
        self.write_and_check().await
    }

    /// Record where the producer is writing, so delivery and recovery can
    /// find the file.
    pub async fn set_filepath(&mut self, path: &Path) -> Result<(), DownloadError> {
        self.task.filepath = path.to_string_lossy().into_owned();
        self.write_and_check().await
    }

    async fn write_and_check(&mut self) -> Result<(), DownloadError> {
        self.store.put_task(&self.task).await?;
        if self.store.is_canceled(self.task.id()).await? {
            return Err(DownloadError::Canceled);
        }
        Ok(())
    }
}

/// Fetch the task record an adapter is about to produce for.
pub(crate) async fn load_task(
    ctx: &DownloadCtx,
    task_id: &str,
) -> Result<TaskRecord, DownloadError> {
    ctx.store
        .get_task(task_id)
        .await?
        .ok_or_else(|| DownloadError::TaskNotFound(task_id.to_string()))
}

/// Clip the produced file in place when the request asks for it. Returns
/// the path of the file to deliver.
pub(crate) async fn apply_clip(
    ctx: &DownloadCtx,
    sink: &mut ProgressSink,
    request: &DownloadRequest,
    path: PathBuf,
) -> Result<PathBuf, DownloadError> {
    if !request.wants_clip() {
        return Ok(path);
    }
    sink.describe("Clipping selected fragment").await?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let clipped = path.with_file_name(format!("{stem}_clip{ext}"));

    ctx.pipeline
        .clip(&path, &clipped, request.start_seconds, request.end_seconds)
        .await?;
    let _ = tokio::fs::remove_file(&path).await;
    sink.set_filepath(&clipped).await?;
    Ok(clipped)
}
