//! TikTok adapter.
//!
//! Resolution goes through the tikwm.com resolver API, which returns direct
//! media URLs (`hdplay` preferred) plus a separate music track; the transfer
//! is a single streamed GET with per-chunk progress.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DownloadError;
use crate::paths::{download_path, temp_path};
use crate::providers::http::{head_content_length, stream_to_file};
use crate::providers::{apply_clip, load_task, DownloadCtx, ProgressSink, Provider};
use crate::task::{DownloadRequest, MediaSnapshot, MediaVariant};

const API_URL: &str = "https://www.tikwm.com/api/";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const AUDIO_BPS: u64 = 128_000;
const TITLE_LIMIT: usize = 50;

pub struct TikTokProvider;

#[derive(Debug)]
struct TikTokVideo {
    video_url: Option<String>,
    audio_url: Option<String>,
    title: String,
    author: String,
    duration: Option<u64>,
    preview_url: Option<String>,
    video_size: Option<u64>,
    audio_size: Option<u64>,
}

impl TikTokProvider {
    pub fn new() -> Self {
        Self
    }

    fn api_headers() -> Vec<(String, String)> {
        vec![
            ("User-Agent".into(), USER_AGENT.into()),
            ("Referer".into(), "https://www.tikwm.com/".into()),
            ("Accept".into(), "application/json, text/plain, */*".into()),
        ]
    }

    fn media_headers() -> Vec<(String, String)> {
        vec![("User-Agent".into(), USER_AGENT.into())]
    }

    async fn fetch_video(&self, ctx: &DownloadCtx, url: &str) -> Result<TikTokVideo, DownloadError> {
        // The resolver behaves best with an explicit language parameter.
        let url = if url.contains("lang=") {
            url.to_string()
        } else if url.contains('?') {
            format!("{url}&lang=en")
        } else {
            format!("{url}?lang=en")
        };

        let mut request = ctx
            .http
            .get(API_URL)
            .query(&[("url", url.as_str()), ("hd", "1")]);
        for (name, value) in Self::api_headers() {
            request = request.header(name, value);
        }
        let payload: Value = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut video = parse_api_response(&payload)?;

        let media_headers = Self::media_headers();
        if let Some(video_url) = &video.video_url {
            video.video_size = head_content_length(&ctx.http, video_url, &media_headers).await?;
        }
        if let Some(audio_url) = &video.audio_url {
            video.audio_size = head_content_length(&ctx.http, audio_url, &media_headers).await?;
        }
        if video.audio_size.is_none() {
            video.audio_size = video.duration.map(|d| AUDIO_BPS / 8 * d);
        }
        Ok(video)
    }
}

impl Default for TikTokProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for TikTokProvider {
    fn name(&self) -> &'static str {
        "TikTok"
    }

    async fn resolve_formats(
        &self,
        ctx: &DownloadCtx,
        url: &str,
    ) -> Result<MediaSnapshot, DownloadError> {
        let video = self.fetch_video(ctx, url).await?;
        let variants = vec![
            MediaVariant {
                quality: "MP4".into(),
                video_variant_id: "video".into(),
                audio_variant_id: "audio".into(),
                filesize: video.video_size,
            },
            MediaVariant {
                quality: "Audio only".into(),
                video_variant_id: String::new(),
                audio_variant_id: "audio".into(),
                filesize: video.audio_size,
            },
        ];
        Ok(MediaSnapshot {
            url: url.to_string(),
            title: video.title,
            author: video.author,
            duration: video.duration,
            preview_url: video.preview_url,
            variants,
        })
    }

    async fn download(
        &self,
        ctx: &DownloadCtx,
        task_id: &str,
        request: &DownloadRequest,
    ) -> Result<PathBuf, DownloadError> {
        let task = load_task(ctx, task_id).await?;
        let video = self.fetch_video(ctx, &request.url).await?;

        let is_audio_only = request.is_audio_only();
        let ext = if is_audio_only { ".mp3" } else { ".mp4" };
        let dest = download_path(
            &ctx.settings.download_dir,
            &video.author,
            task_id,
            &video.title,
            ext,
        );

        // Audio-only with no dedicated music track falls back to ripping the
        // audio out of the video stream.
        let (source_url, needs_convert, expected) = if is_audio_only {
            match &video.audio_url {
                Some(audio_url) => (audio_url.clone(), false, video.audio_size),
                None => {
                    let video_url = video.video_url.clone().ok_or_else(|| {
                        DownloadError::Provider("TikTok: no suitable media stream".into())
                    })?;
                    (video_url, true, video.video_size)
                }
            }
        } else {
            let video_url = video
                .video_url
                .clone()
                .ok_or_else(|| DownloadError::Provider("TikTok: no suitable media stream".into()))?;
            (video_url, false, video.video_size)
        };

        let fetch_target = if needs_convert { temp_path(&dest) } else { dest.clone() };

        let mut sink = ProgressSink::new(ctx.store.clone(), task, expected);
        sink.set_filepath(&fetch_target).await?;
        sink.describe(if is_audio_only {
            "Downloading audio track"
        } else {
            "Downloading video track"
        })
        .await?;

        stream_to_file(
            &ctx.http,
            &source_url,
            &Self::media_headers(),
            &fetch_target,
            &mut sink,
        )
        .await?;

        if needs_convert {
            sink.describe("Converting to MP3").await?;
            let converted = ctx.pipeline.to_audio(&fetch_target, &dest).await;
            let _ = tokio::fs::remove_file(&fetch_target).await;
            converted?;
        }

        sink.set_filepath(&dest).await?;
        apply_clip(ctx, &mut sink, request, dest).await
    }
}

fn parse_api_response(payload: &Value) -> Result<TikTokVideo, DownloadError> {
    if payload["code"].as_i64() != Some(0) || payload["data"].is_null() {
        return Err(DownloadError::Provider(
            "TikTok: cannot parse video url".into(),
        ));
    }
    let data = &payload["data"];

    let video_url = ["hdplay", "wmplay", "play"]
        .iter()
        .find_map(|key| data[*key].as_str())
        .map(str::to_string);
    let audio_url = data["music"].as_str().map(str::to_string);

    let mut title = data["title"].as_str().unwrap_or("tiktok_video").to_string();
    if title.chars().count() > TITLE_LIMIT {
        title = title.chars().take(TITLE_LIMIT).collect::<String>() + "...";
    }

    let author = match &data["author"] {
        Value::Object(author) => author
            .get("unique_id")
            .or_else(|| author.get("nickname"))
            .and_then(|v| v.as_str())
            .unwrap_or("tiktok")
            .to_string(),
        Value::String(author) if !author.is_empty() => author.clone(),
        _ => "tiktok".to_string(),
    };

    Ok(TikTokVideo {
        video_url,
        audio_url,
        title,
        author,
        duration: data["duration"].as_u64().filter(|d| *d > 0),
        preview_url: data["cover"]
            .as_str()
            .or_else(|| data["origin_cover"].as_str())
            .map(str::to_string),
        video_size: None,
        audio_size: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_fixture() -> Value {
        serde_json::json!({
            "code": 0,
            "data": {
                "hdplay": "https://cdn.tw.test/hd.mp4",
                "play": "https://cdn.tw.test/sd.mp4",
                "music": "https://cdn.tw.test/music.mp3",
                "title": "a".repeat(60),
                "duration": 30,
                "cover": "https://cdn.tw.test/cover.jpg",
                "author": {"unique_id": "creator", "nickname": "The Creator"}
            }
        })
    }

    #[test]
    fn hd_url_preferred_and_title_truncated() {
        let video = parse_api_response(&api_fixture()).unwrap();
        assert_eq!(video.video_url.as_deref(), Some("https://cdn.tw.test/hd.mp4"));
        assert_eq!(video.author, "creator");
        assert_eq!(video.title.chars().count(), TITLE_LIMIT + 3);
        assert!(video.title.ends_with("..."));
    }

    #[test]
    fn non_zero_code_is_an_error() {
        let payload = serde_json::json!({"code": -1, "msg": "rate limited"});
        assert!(parse_api_response(&payload).is_err());
    }

    #[test]
    fn string_author_accepted() {
        let mut payload = api_fixture();
        payload["data"]["author"] = Value::String("plain".into());
        let video = parse_api_response(&payload).unwrap();
        assert_eq!(video.author, "plain");
    }
}
