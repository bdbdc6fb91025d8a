use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::DownloadError;

/// Lifecycle of one download task.
///
/// PENDING moves to exactly one of COMPLETED / ERROR / CANCELED; COMPLETED
/// may move once to DONE after the file has been streamed out. ERROR,
/// CANCELED and DONE are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
    Error,
    Canceled,
    Done,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }

    /// Wire string, also reused as the terminal `description` text.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Done => "done",
        }
    }
}

/// One selectable (quality, video stream, audio stream) tuple offered by a
/// provider. An empty `video_variant_id` marks the audio-only pseudo-variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaVariant {
    pub quality: String,
    pub video_variant_id: String,
    pub audio_variant_id: String,
    #[serde(default)]
    pub filesize: Option<u64>,
}

/// Resolved metadata for a source URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSnapshot {
    pub url: String,
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub preview_url: Option<String>,
    pub variants: Vec<MediaVariant>,
}

impl MediaSnapshot {
    /// Placeholder used when a task is created before (or without) a cache
    /// hit, so the status block always carries a media object.
    pub fn placeholder(url: &str) -> Self {
        Self {
            url: url.to_string(),
            title: String::new(),
            author: String::new(),
            duration: None,
            preview_url: None,
            variants: Vec::new(),
        }
    }
}

/// The original download parameters. Immutable after task creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub video_variant_id: String,
    pub audio_variant_id: String,
    #[serde(default)]
    pub start_seconds: Option<u64>,
    #[serde(default)]
    pub end_seconds: Option<u64>,
}

impl DownloadRequest {
    pub fn is_audio_only(&self) -> bool {
        self.video_variant_id.is_empty()
    }

    pub fn wants_clip(&self) -> bool {
        self.start_seconds.is_some() || self.end_seconds.is_some()
    }
}

/// The user-visible status block. Published on every mutation and returned
/// by the status endpoints verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBlock {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub speed_bps: Option<f64>,
    #[serde(default)]
    pub eta_seconds: Option<u64>,
    #[serde(default)]
    pub created_at: Option<u64>,
    pub media: MediaSnapshot,
}

/// Authoritative snapshot of one download, stored under `task:{id}`.
///
/// `request` is optional on the wire: records written before the field
/// existed deserialize fine but can never be resumed after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: StatusBlock,
    #[serde(default)]
    pub filepath: String,
    #[serde(default)]
    pub request: Option<DownloadRequest>,
}

impl TaskRecord {
    pub fn new(task_id: String, media: MediaSnapshot, request: DownloadRequest) -> Self {
        Self {
            status: StatusBlock {
                task_id,
                status: TaskStatus::Pending,
                description: None,
                percent: 0.0,
                speed_bps: None,
                eta_seconds: None,
                created_at: Some(epoch_seconds()),
                media,
            },
            filepath: String::new(),
            request: Some(request),
        }
    }

    pub fn id(&self) -> &str {
        &self.status.task_id
    }

    pub fn is_terminal(&self) -> bool {
        self.status.status.is_terminal()
    }

    /// Clamp to [0, 100] and never move backwards while the task is live.
    pub fn set_percent(&mut self, percent: f64) {
        let clamped = percent.clamp(0.0, 100.0);
        if clamped > self.status.percent {
            self.status.percent = clamped;
        }
    }

    pub fn set_description(&mut self, text: &str) {
        self.status.description = Some(text.to_string());
    }

    /// Move to a terminal state. The status DAG only allows
    /// PENDING → {COMPLETED, ERROR, CANCELED} and COMPLETED → DONE;
    /// anything else is ignored so racing writers cannot roll a task back.
    pub fn finish(&mut self, status: TaskStatus, description: &str) {
        let allowed = matches!(
            (self.status.status, status),
            (
                TaskStatus::Pending,
                TaskStatus::Completed | TaskStatus::Error | TaskStatus::Canceled
            ) | (TaskStatus::Completed, TaskStatus::Done)
        );
        if allowed {
            self.status.status = status;
            self.status.description = Some(description.to_string());
        }
    }

    pub fn to_json(&self) -> Result<String, DownloadError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, DownloadError> {
        Ok(serde_json::from_str(raw)?)
    }
}

pub fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
