use std::path::PathBuf;

/// Error taxonomy for the whole download path.
///
/// Boundary code (the HTTP layer) maps these onto status codes; the worker
/// maps them onto terminal task states. Everything in between propagates
/// with `?`.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unsupported video service")]
    UnsupportedUrl,

    #[error("task with id {0} not found")]
    TaskNotFound(String),

    #[error("user already has an active download")]
    LockConflict,

    #[error("canceled by user")]
    Canceled,

    /// Upstream scrape / resolve / transfer failure with a human description.
    #[error("{0}")]
    Provider(String),

    /// Media tool exited non-zero; the payload is the captured stderr.
    #[error("media tool failed: {0}")]
    Pipeline(String),

    #[error("file not found: {0}")]
    FileMissing(PathBuf),

    #[error("job timed out")]
    Timeout,
}

impl From<redis::RedisError> for DownloadError {
    fn from(err: redis::RedisError) -> Self {
        DownloadError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(err: serde_json::Error) -> Self {
        DownloadError::Store(format!("serialization: {err}"))
    }
}

impl DownloadError {
    /// True for the cancel signal, which must surface as CANCELED rather
    /// than ERROR.
    pub fn is_canceled(&self) -> bool {
        matches!(self, DownloadError::Canceled)
    }
}
