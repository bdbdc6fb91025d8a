//! Instagram adapter.
//!
//! The post page embeds its API payload as a JSON island inside a script
//! tag; the adapter slices the `video_versions` array (and its neighbors)
//! out of the raw HTML with a small bracket-matching scanner instead of a
//! full DOM parse. Authenticated scraping uses the session cookies from the
//! configuration.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DownloadError;
use crate::paths::{download_path, temp_path};
use crate::providers::http::{apply_headers, head_content_length, stream_to_file};
use crate::providers::{apply_clip, load_task, DownloadCtx, ProgressSink, Provider};
use crate::task::{DownloadRequest, MediaSnapshot, MediaVariant};

pub struct InstagramProvider {
    csrftoken: String,
    sessionid: String,
}

#[derive(Debug)]
struct InstagramVideo {
    content_url: String,
    quality: String,
    author: String,
    title: String,
    duration: Option<u64>,
    preview_url: Option<String>,
    size: Option<u64>,
}

impl InstagramProvider {
    pub fn new(csrftoken: &str, sessionid: &str) -> Self {
        Self {
            csrftoken: csrftoken.to_string(),
            sessionid: sessionid.to_string(),
        }
    }

    fn page_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                "User-Agent".into(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36".into(),
            ),
            (
                "Accept".into(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into(),
            ),
            ("Accept-Language".into(), "en-US,en;q=0.9,ru;q=0.8".into()),
        ];
        if !self.csrftoken.is_empty() && !self.sessionid.is_empty() {
            headers.push((
                "Cookie".into(),
                format!("csrftoken={}; sessionid={}", self.csrftoken, self.sessionid),
            ));
        }
        headers
    }

    fn asset_headers(&self, url: &str) -> Vec<(String, String)> {
        let mut headers = self.page_headers();
        headers.push(("Referer".into(), url.into()));
        headers
    }

    async fn fetch_video(
        &self,
        ctx: &DownloadCtx,
        url: &str,
    ) -> Result<InstagramVideo, DownloadError> {
        let html = apply_headers(ctx.http.get(url), &self.page_headers())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let mut video = parse_page(&html)?;
        video.size = head_content_length(&ctx.http, &video.content_url, &self.asset_headers(url))
            .await
            .unwrap_or(None);
        Ok(video)
    }
}

#[async_trait]
impl Provider for InstagramProvider {
    fn name(&self) -> &'static str {
        "Instagram"
    }

    async fn resolve_formats(
        &self,
        ctx: &DownloadCtx,
        url: &str,
    ) -> Result<MediaSnapshot, DownloadError> {
        let video = self.fetch_video(ctx, url).await?;
        let variants = vec![
            MediaVariant {
                quality: video.quality.clone(),
                video_variant_id: "video".into(),
                audio_variant_id: "audio".into(),
                filesize: video.size,
            },
            MediaVariant {
                quality: "Audio only".into(),
                video_variant_id: String::new(),
                audio_variant_id: "audio".into(),
                filesize: None,
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
        let fetch_target = if is_audio_only { temp_path(&dest) } else { dest.clone() };

        let mut sink = ProgressSink::new(ctx.store.clone(), task, video.size);
        sink.set_filepath(&fetch_target).await?;
        sink.describe(if is_audio_only {
            "Downloading audio track"
        } else {
            "Downloading video track"
        })
        .await?;

        stream_to_file(
            &ctx.http,
            &video.content_url,
            &self.asset_headers(&request.url),
            &fetch_target,
            &mut sink,
        )
        .await?;

        if is_audio_only {
            sink.describe("Converting to MP3").await?;
            let converted = ctx.pipeline.to_audio(&fetch_target, &dest).await;
            let _ = tokio::fs::remove_file(&fetch_target).await;
            converted?;
        }

        sink.set_filepath(&dest).await?;
        apply_clip(ctx, &mut sink, request, dest).await
    }
}

// ---------------------------------------------------------------------------
// Page scraping
// ---------------------------------------------------------------------------

/// Slice the JSON value that starts right after `marker` out of `text`.
/// The value must open with `[` or `{`; the scanner tracks bracket depth
/// and string/escape state, exactly enough for embedded JSON islands.
fn json_island<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let start = text.find(marker)? + marker.len();
    let bytes = text.as_bytes();
    let open = *bytes.get(start)?;
    let close = match open {
        b'[' => b']',
        b'{' => b'}',
        _ => return None,
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// The first JSON string immediately following `marker` (e.g.
/// `"username":"…"`), unescaped via the JSON parser.
fn json_string_after(text: &str, marker: &str) -> Option<String> {
    let start = text.find(marker)? + marker.len();
    let rest = &text[start..];
    if !rest.starts_with('"') {
        return None;
    }
    // Find the closing quote, honoring escapes, then let serde unescape.
    let bytes = rest.as_bytes();
    let mut escaped = false;
    for (idx, &b) in bytes.iter().enumerate().skip(1) {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            return serde_json::from_str::<String>(&rest[..=idx]).ok();
        }
    }
    None
}

fn parse_page(html: &str) -> Result<InstagramVideo, DownloadError> {
    let versions_raw = json_island(html, "\"video_versions\":")
        .ok_or_else(|| DownloadError::Provider("Instagram: no video found on page".into()))?;
    let versions: Vec<Value> = serde_json::from_str(versions_raw)
        .map_err(|_| DownloadError::Provider("Instagram: malformed video metadata".into()))?;
    let first = versions
        .first()
        .ok_or_else(|| DownloadError::Provider("Instagram: empty video list".into()))?;

    let content_url = first["url"]
        .as_str()
        .ok_or_else(|| DownloadError::Provider("Instagram: video has no url".into()))?
        .to_string();
    let width = first["width"].as_u64().unwrap_or(0);
    let height = first["height"].as_u64().unwrap_or(0);

    let author = json_string_after(html, "\"username\":").unwrap_or_else(|| "instagram".into());
    let title = format!("video_by_{author}");

    let duration = html
        .find("\"video_duration\":")
        .and_then(|idx| {
            let rest = &html[idx + "\"video_duration\":".len()..];
            let number: String = rest
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            number.parse::<f64>().ok()
        })
        .map(|d| d as u64);

    let preview_url = json_island(html, "\"image_versions2\":")
        .and_then(|island| serde_json::from_str::<Value>(island).ok())
        .and_then(|value| value["candidates"][0]["url"].as_str().map(str::to_string));

    Ok(InstagramVideo {
        content_url,
        quality: if width > 0 && height > 0 {
            format!("{width}x{height}")
        } else {
            "MP4".to_string()
        },
        author,
        title,
        duration,
        preview_url,
        size: None,
    })
}
