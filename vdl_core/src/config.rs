use std::path::PathBuf;
use std::time::Duration;

use crate::error::DownloadError;

/// Process-wide configuration, built once at startup from `VDL_*` environment
/// variables and passed down explicitly. Nothing in the crate reads the
/// environment after this point.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for produced files (`<root>/<author>/<task>_<title>.<ext>`).
    pub download_dir: PathBuf,
    /// Path to the external media tool binary.
    pub ffmpeg_path: String,
    /// Store connection string.
    pub redis_url: String,
    /// Prefix applied to every store key.
    pub key_prefix: String,
    /// TTL of the advisory metadata cache.
    pub meta_ttl: Duration,
    /// TTL of the per-user active lock and auxiliary keys. Never below one
    /// hour, otherwise long downloads would lose their lock mid-transfer.
    pub lock_ttl: Duration,
    /// Minimum video height offered by the YouTube adapter.
    pub min_video_height: u32,
    pub instagram_csrftoken: String,
    pub instagram_sessionid: String,
}

const MIN_LOCK_TTL_SECS: u64 = 3600;

impl Settings {
    pub fn from_env() -> Result<Self, DownloadError> {
        let download_dir = PathBuf::from(env_or("VDL_DOWNLOAD_DIR", "./downloads"));
        std::fs::create_dir_all(&download_dir)?;

        let meta_ttl = Duration::from_secs(parse_env("VDL_META_TTL_SECS", 600)?);
        let lock_ttl = Duration::from_secs(
            parse_env("VDL_LOCK_TTL_SECS", MIN_LOCK_TTL_SECS)?.max(MIN_LOCK_TTL_SECS),
        );

        Ok(Self {
            download_dir,
            ffmpeg_path: env_or("VDL_FFMPEG_PATH", "ffmpeg"),
            redis_url: env_or("VDL_REDIS_URL", "redis://127.0.0.1:6379/0"),
            key_prefix: env_or("VDL_REDIS_PREFIX", "vdl:"),
            meta_ttl,
            lock_ttl,
            min_video_height: parse_env("VDL_MIN_VIDEO_HEIGHT", 360)?,
            instagram_csrftoken: env_or("VDL_INSTAGRAM_CSRFTOKEN", ""),
            instagram_sessionid: env_or("VDL_INSTAGRAM_SESSIONID", ""),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, DownloadError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| DownloadError::Config(format!("invalid value for {key}: {raw}"))),
        Err(_) => Ok(default),
    }
}
