//! YouTube adapter.
//!
//! Formats come from the Innertube `player` endpoint queried as the Android
//! client, which hands back direct stream URLs per itag. Video variants are
//! the avc1 renditions above the configured height floor, paired with the
//! best mp4 audio track; the download fetches the chosen itags and muxes
//! them through the media pipeline.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DownloadError;
use crate::paths::{download_path, temp_path};
use crate::providers::http::stream_to_file;
use crate::providers::{apply_clip, load_task, DownloadCtx, ProgressSink, Provider};
use crate::task::{DownloadRequest, MediaSnapshot, MediaVariant};

const PLAYER_ENDPOINT: &str = "https://www.youtube.com/youtubei/v1/player";
const ANDROID_CLIENT_VERSION: &str = "19.09.37";
const ANDROID_USER_AGENT: &str =
    "com.google.android.youtube/19.09.37 (Linux; U; Android 11) gzip";

pub struct YouTubeProvider {
    min_height: u32,
}

#[derive(Debug, Clone)]
struct YtStream {
    itag: String,
    url: String,
    mime: String,
    height: u32,
    quality_label: String,
    bitrate: u64,
    content_length: Option<u64>,
}

impl YtStream {
    fn is_audio(&self) -> bool {
        self.mime.starts_with("audio/")
    }

    fn is_avc1_video(&self) -> bool {
        self.mime.starts_with("video/mp4") && self.mime.contains("avc1")
    }
}

#[derive(Debug)]
struct YtMedia {
    title: String,
    author: String,
    duration: Option<u64>,
    preview_url: Option<String>,
    streams: Vec<YtStream>,
}

impl YouTubeProvider {
    pub fn new(min_height: u32) -> Self {
        Self { min_height }
    }

    async fn fetch_media(&self, ctx: &DownloadCtx, url: &str) -> Result<YtMedia, DownloadError> {
        let video_id = extract_video_id(url)
            .ok_or_else(|| DownloadError::Provider("YouTube: cannot extract video id".into()))?;

        let body = serde_json::json!({
            "videoId": video_id,
            "context": {
                "client": {
                    "clientName": "ANDROID",
                    "clientVersion": ANDROID_CLIENT_VERSION,
                    "androidSdkVersion": 30,
                    "hl": "en",
                }
            },
        });

        let payload: Value = ctx
            .http
            .post(PLAYER_ENDPOINT)
            .header("User-Agent", ANDROID_USER_AGENT)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_player_response(&payload)
    }

    fn best_audio<'a>(&self, streams: &'a [YtStream]) -> Option<&'a YtStream> {
        streams
            .iter()
            .filter(|s| s.is_audio() && s.mime.starts_with("audio/mp4"))
            .max_by_key(|s| s.bitrate)
    }
}

#[async_trait]
impl Provider for YouTubeProvider {
    fn name(&self) -> &'static str {
        "YouTube"
    }

    async fn resolve_formats(
        &self,
        ctx: &DownloadCtx,
        url: &str,
    ) -> Result<MediaSnapshot, DownloadError> {
        let media = self.fetch_media(ctx, url).await?;
        let audio = self
            .best_audio(&media.streams)
            .ok_or_else(|| DownloadError::Provider("YouTube: no audio track".into()))?;

        let mut variants: Vec<MediaVariant> = media
            .streams
            .iter()
            .filter(|s| s.is_avc1_video() && s.height > self.min_height)
            .map(|v| MediaVariant {
                quality: v.quality_label.clone(),
                video_variant_id: v.itag.clone(),
                audio_variant_id: audio.itag.clone(),
                filesize: match (v.content_length, audio.content_length) {
                    (Some(v_len), Some(a_len)) => Some(v_len + a_len),
                    (v_len, a_len) => v_len.or(a_len),
                },
            })
            .collect();

        variants.push(MediaVariant {
            quality: "Audio only".into(),
            video_variant_id: String::new(),
            audio_variant_id: audio.itag.clone(),
            filesize: audio.content_length,
        });

        Ok(MediaSnapshot {
            url: url.to_string(),
            title: media.title,
            author: media.author,
            duration: media.duration,
            preview_url: media.preview_url,
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
        let media = self.fetch_media(ctx, &request.url).await?;

        let find = |itag: &str| {
            media
                .streams
                .iter()
                .find(|s| s.itag == itag)
                .ok_or_else(|| DownloadError::Provider(format!("YouTube: itag {itag} not offered")))
        };

        let ext = if request.is_audio_only() { ".mp3" } else { ".mp4" };
        let dest = download_path(
            &ctx.settings.download_dir,
            &media.author,
            task_id,
            &media.title,
            ext,
        );
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut sink = ProgressSink::new(ctx.store.clone(), task, None);
        sink.set_filepath(&dest).await?;

        let video_tmp = temp_stream_path(&dest, task_id, "video");
        let audio_tmp = temp_stream_path(&dest, task_id, "audio");

        let produced: Result<PathBuf, DownloadError> = async {
            if request.is_audio_only() {
                let audio = find(&request.audio_variant_id)?;
                sink.set_total(audio.content_length);
                sink.describe("Downloading audio track").await?;
                stream_to_file(&ctx.http, &audio.url, &[], &audio_tmp, &mut sink).await?;

                sink.describe("Converting to MP3").await?;
                ctx.pipeline.to_audio(&audio_tmp, &dest).await?;
                let _ = tokio::fs::remove_file(&audio_tmp).await;
                Ok(dest.clone())
            } else {
                let video = find(&request.video_variant_id)?;
                let separate_audio = request.audio_variant_id != request.video_variant_id;
                let total = if separate_audio {
                    let audio = find(&request.audio_variant_id)?;
                    match (video.content_length, audio.content_length) {
                        (Some(v_len), Some(a_len)) => Some(v_len + a_len),
                        _ => None,
                    }
                } else {
                    video.content_length
                };
                sink.set_total(total);

                sink.describe("Downloading video track").await?;
                stream_to_file(&ctx.http, &video.url, &[], &video_tmp, &mut sink).await?;

                if separate_audio {
                    let audio = find(&request.audio_variant_id)?;
                    sink.describe("Downloading audio track").await?;
                    stream_to_file(&ctx.http, &audio.url, &[], &audio_tmp, &mut sink).await?;

                    sink.describe("Merging tracks").await?;
                    ctx.pipeline.mux(&video_tmp, &audio_tmp, &dest).await?;
                    let _ = tokio::fs::remove_file(&video_tmp).await;
                    let _ = tokio::fs::remove_file(&audio_tmp).await;
                } else {
                    tokio::fs::rename(&video_tmp, &dest).await?;
                }
                Ok(dest.clone())
            }
        }
        .await;

        // Whatever failed, no stray stream temps survive the attempt.
        let produced = match produced {
            Ok(path) => path,
            Err(err) => {
                let _ = tokio::fs::remove_file(&video_tmp).await;
                let _ = tokio::fs::remove_file(&audio_tmp).await;
                return Err(err);
            }
        };

        sink.set_filepath(&produced).await?;
        apply_clip(ctx, &mut sink, request, produced).await
    }
}

fn temp_stream_path(dest: &Path, task_id: &str, kind: &str) -> PathBuf {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    temp_path(&dir.join(format!("{task_id}_{kind}")))
}

/// Pull the 11-char video id out of the supported URL shapes.
fn extract_video_id(url: &str) -> Option<String> {
    let take_id = |rest: &str| -> Option<String> {
        let id: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    };

    for marker in ["v=", "youtu.be/", "shorts/", "embed/"] {
        if let Some(idx) = url.find(marker) {
            if let Some(id) = take_id(&url[idx + marker.len()..]) {
                return Some(id);
            }
        }
    }
    None
}

fn parse_player_response(payload: &Value) -> Result<YtMedia, DownloadError> {
    let playability = payload["playabilityStatus"]["status"].as_str().unwrap_or("");
    if playability != "OK" {
        let reason = payload["playabilityStatus"]["reason"]
            .as_str()
            .unwrap_or("video is not playable");
        return Err(DownloadError::Provider(format!("YouTube: {reason}")));
    }

    let details = &payload["videoDetails"];
    let title = details["title"].as_str().unwrap_or("youtube_video").to_string();
    let author = details["author"].as_str().unwrap_or("youtube").to_string();
    let duration = details["lengthSeconds"]
        .as_str()
        .and_then(|s| s.parse::<u64>().ok());
    let preview_url = details["thumbnail"]["thumbnails"]
        .as_array()
        .and_then(|thumbs| thumbs.last())
        .and_then(|thumb| thumb["url"].as_str())
        .map(str::to_string);

    let mut streams = Vec::new();
    for key in ["formats", "adaptiveFormats"] {
        let Some(entries) = payload["streamingData"][key].as_array() else {
            continue;
        };
        for entry in entries {
            let (Some(itag), Some(url), Some(mime)) = (
                entry["itag"].as_u64(),
                entry["url"].as_str(),
                entry["mimeType"].as_str(),
            ) else {
                continue;
            };
            streams.push(YtStream {
                itag: itag.to_string(),
                url: url.to_string(),
                mime: mime.to_string(),
                height: entry["height"].as_u64().unwrap_or(0) as u32,
                quality_label: entry["qualityLabel"].as_str().unwrap_or("").to_string(),
                bitrate: entry["bitrate"].as_u64().unwrap_or(0),
                content_length: entry["contentLength"]
                    .as_str()
                    .and_then(|s| s.parse().ok()),
            });
        }
    }

    if streams.is_empty() {
        return Err(DownloadError::Provider("YouTube: no streams offered".into()));
    }

    Ok(YtMedia {
        title,
        author,
        duration,
        preview_url,
        streams,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_id_from_all_url_shapes() {
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            extract_video_id("https://youtu.be/abc-DEF_123?t=4").as_deref(),
            Some("abc-DEF_123")
        );
        assert_eq!(
            extract_video_id("https://youtube.com/shorts/xyz987").as_deref(),
            Some("xyz987")
        );
        assert_eq!(extract_video_id("https://example.com/clip"), None);
    }

    fn player_fixture() -> Value {
        serde_json::json!({
            "playabilityStatus": {"status": "OK"},
            "videoDetails": {
                "title": "Test Clip",
                "author": "Channel",
                "lengthSeconds": "95",
                "thumbnail": {"thumbnails": [
                    {"url": "https://i.ytimg.test/small.jpg"},
                    {"url": "https://i.ytimg.test/large.jpg"}
                ]}
            },
            "streamingData": {
                "adaptiveFormats": [
                    {"itag": 137, "url": "https://r1.test/v137", "mimeType":
                     "video/mp4; codecs=\"avc1.640028\"", "height": 1080,
                     "qualityLabel": "1080p", "bitrate": 4000000,
                     "contentLength": "50000000"},
                    {"itag": 248, "url": "https://r1.test/v248", "mimeType":
                     "video/webm; codecs=\"vp9\"", "height": 1080,
                     "qualityLabel": "1080p", "bitrate": 3500000},
                    {"itag": 140, "url": "https://r1.test/a140", "mimeType":
                     "audio/mp4; codecs=\"mp4a.40.2\"", "bitrate": 129000,
                     "contentLength": "1500000"}
                ]
            }
        })
    }

    #[test]
    fn player_response_parses_streams_and_details() {
        let media = parse_player_response(&player_fixture()).unwrap();
        assert_eq!(media.title, "Test Clip");
        assert_eq!(media.duration, Some(95));
        assert_eq!(media.preview_url.as_deref(), Some("https://i.ytimg.test/large.jpg"));
        assert_eq!(media.streams.len(), 3);
        assert!(media.streams.iter().any(|s| s.itag == "140" && s.is_audio()));
    }

    #[test]
    fn unplayable_video_surfaces_reason() {
        let payload = serde_json::json!({
            "playabilityStatus": {"status": "LOGIN_REQUIRED", "reason": "Sign in to confirm your age"}
        });
        let err = parse_player_response(&payload).unwrap_err();
        assert!(err.to_string().contains("Sign in"));
    }

    #[test]
    fn variants_respect_height_floor_and_carry_audio() {
        let provider = YouTubeProvider::new(360);
        let media = parse_player_response(&player_fixture()).unwrap();
        let audio = provider.best_audio(&media.streams).unwrap();
        assert_eq!(audio.itag, "140");

        let avc: Vec<&YtStream> = media
            .streams
            .iter()
            .filter(|s| s.is_avc1_video() && s.height > provider.min_height)
            .collect();
        assert_eq!(avc.len(), 1, "vp9 rendition is filtered out");
        assert_eq!(avc[0].itag, "137");
    }
}
