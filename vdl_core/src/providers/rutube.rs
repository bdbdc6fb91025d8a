//! RuTube adapter.
//!
//! The play-options API yields an HLS master playlist; its
//! `#EXT-X-STREAM-INF` entries (and their audio groups) become the offered
//! variants, keyed by height. The transfer shells out to the media
//! pipeline's HLS fetch with a progress pipe.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::paths::download_path;
use crate::providers::http::apply_headers;
use crate::providers::{apply_clip, load_task, DownloadCtx, ProgressSink, Provider};
use crate::task::{DownloadRequest, MediaSnapshot, MediaVariant};

const OPTIONS_URL: &str = "https://rutube.ru/api/play/options/{video_id}/?no_404=true";
const META_URL: &str = "https://rutube.ru/api/video/{video_id}/?format=json";

/// Assumed audio bitrate when the playlist carries a separate audio group
/// but no bandwidth figure for it.
const AUDIO_BPS: u64 = 128_000;

pub struct RutubeProvider;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HlsVariant {
    pub video: String,
    pub audio: Option<String>,
    pub bandwidth: Option<u64>,
}

#[derive(Debug)]
struct RutubeVideo {
    title: String,
    author: String,
    duration: Option<u64>,
    preview_url: Option<String>,
    variants: BTreeMap<u32, HlsVariant>,
}

impl RutubeProvider {
    pub fn new() -> Self {
        Self
    }

    fn headers(url: &str) -> Vec<(String, String)> {
        vec![
            (
                "User-Agent".into(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".into(),
            ),
            ("Accept".into(), "application/json, text/javascript, */*; q=0.01".into()),
            ("X-Requested-With".into(), "XMLHttpRequest".into()),
            ("Referer".into(), url.into()),
        ]
    }

    async fn fetch_video(&self, ctx: &DownloadCtx, url: &str) -> Result<RutubeVideo, DownloadError> {
        let video_id = extract_video_id(url)
            .ok_or_else(|| DownloadError::Provider("RuTube: unsupported URL format".into()))?;
        let headers = Self::headers(url);

        let options: Value = apply_headers(
            ctx.http.get(OPTIONS_URL.replace("{video_id}", &video_id)),
            &headers,
        )
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

        let balancer = &options["video_balancer"]["data"];
        let mut master_url = balancer["m3u8"]
            .as_str()
            .or_else(|| balancer["url"].as_str())
            .map(str::to_string);
        let mut title = balancer["title"].as_str().unwrap_or("").to_string();
        let mut author = balancer["author"].as_str().unwrap_or("").to_string();
        let mut preview_url = options["video_balancer"]["thumbnail_url"]
            .as_str()
            .map(str::to_string);
        let mut duration = balancer["duration"].as_f64().map(|d| d as u64);

        if master_url.is_none() {
            master_url = find_first_m3u8(&options);
        }

        // The options payload often omits human metadata; the video meta
        // endpoint fills the gaps.
        if title.is_empty() || author.is_empty() || preview_url.is_none() || duration.is_none() {
            if let Ok(response) = apply_headers(
                ctx.http.get(META_URL.replace("{video_id}", &video_id)),
                &headers,
            )
            .send()
            .await
            {
                if let Ok(meta) = response.json::<Value>().await {
                    if title.is_empty() {
                        title = meta["title"].as_str().unwrap_or("").to_string();
                    }
                    if author.is_empty() {
                        author = meta["author"]["name"].as_str().unwrap_or("").to_string();
                    }
                    if preview_url.is_none() {
                        preview_url = meta["thumbnail_url"].as_str().map(str::to_string);
                    }
                    if duration.is_none() {
                        duration = meta["duration"].as_u64();
                    }
                }
            }
        }

        let master_url = master_url
            .ok_or_else(|| DownloadError::Provider("RuTube: HLS playlist not found".into()))?;

        let response = apply_headers(ctx.http.get(&master_url), &headers)
            .send()
            .await?
            .error_for_status()?;
        let base_url = response.url().to_string();
        let master_text = response.text().await?;

        let variants = parse_master_playlist(&master_text, &base_url);
        if variants.is_empty() {
            return Err(DownloadError::Provider(
                "RuTube: master playlist has no renditions".into(),
            ));
        }

        Ok(RutubeVideo {
            title: if title.is_empty() {
                format!("rutube_{video_id}")
            } else {
                title
            },
            author: if author.is_empty() {
                "rutube".to_string()
            } else {
                author
            },
            duration,
            preview_url,
            variants,
        })
    }
}

impl Default for RutubeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for RutubeProvider {
    fn name(&self) -> &'static str {
        "RuTube"
    }

    async fn resolve_formats(
        &self,
        ctx: &DownloadCtx,
        url: &str,
    ) -> Result<MediaSnapshot, DownloadError> {
        let video = self.fetch_video(ctx, url).await?;
        let duration = video.duration.unwrap_or(0);

        let mut variants: Vec<MediaVariant> = video
            .variants
            .iter()
            .map(|(height, variant)| {
                let estimated = variant.bandwidth.map(|video_bps| {
                    let audio_bps = if variant.audio.is_some() { AUDIO_BPS } else { 0 };
                    (video_bps + audio_bps) / 8 * duration
                });
                MediaVariant {
                    quality: format!("{height}p"),
                    video_variant_id: height.to_string(),
                    audio_variant_id: height.to_string(),
                    filesize: estimated.filter(|size| *size > 0),
                }
            })
            .collect();

        if let Some(min_height) = video.variants.keys().next() {
            variants.push(MediaVariant {
                quality: "Audio only".into(),
                video_variant_id: String::new(),
                audio_variant_id: min_height.to_string(),
                filesize: if duration > 0 {
                    Some(AUDIO_BPS / 8 * duration)
                } else {
                    None
                },
            });
        }

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
        let wanted = if is_audio_only {
            &request.audio_variant_id
        } else {
            &request.video_variant_id
        };
        let chosen_height = wanted
            .parse::<u32>()
            .ok()
            .filter(|height| video.variants.contains_key(height))
            .or_else(|| {
                // Unknown id: fall back to the lowest rendition for audio,
                // the highest for video.
                if is_audio_only {
                    video.variants.keys().next().copied()
                } else {
                    video.variants.keys().next_back().copied()
                }
            })
            .ok_or_else(|| DownloadError::Provider("RuTube: no available renditions".into()))?;
        let chosen = video.variants[&chosen_height].clone();

        let ext = if is_audio_only { ".mp3" } else { ".mp4" };
        let dest = download_path(
            &ctx.settings.download_dir,
            &video.author,
            task_id,
            &video.title,
            ext,
        );
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let fetch_target = if is_audio_only {
            dest.with_extension("temp.mp4")
        } else {
            dest.clone()
        };

        let mut sink = ProgressSink::new(ctx.store.clone(), task, None);
        sink.set_filepath(&fetch_target).await?;
        sink.describe(if is_audio_only {
            "Downloading audio track"
        } else {
            "Downloading video track"
        })
        .await?;

        // The pipeline pushes progress samples into a channel; this task
        // drains them into store writes and fans a cancel back via the token.
        let (progress_tx, mut progress_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let duration = video.duration.unwrap_or(0);

        let (video_input, audio_input) = if is_audio_only {
            (None, chosen.audio.clone().unwrap_or(chosen.video.clone()))
        } else {
            match chosen.audio.clone() {
                Some(audio) => (Some(chosen.video.clone()), audio),
                None => (None, chosen.video.clone()),
            }
        };

        let headers = Self::headers(&request.url);
        let fetch = ctx.pipeline.fetch_hls(
            video_input.as_deref(),
            &audio_input,
            &fetch_target,
            duration,
            &headers,
            progress_tx,
            cancel.clone(),
        );
        tokio::pin!(fetch);

        let mut drain_error: Option<DownloadError> = None;
        let fetch_result = loop {
            tokio::select! {
                result = &mut fetch => break result,
                sample = progress_rx.recv() => {
                    if let (Some(sample), None) = (sample, &drain_error) {
                        if let Err(err) = sink.advance_percent(sample.percent).await {
                            cancel.cancel();
                            drain_error = Some(err);
                        }
                    }
                }
            }
        };

        if let Some(err) = drain_error {
            let _ = tokio::fs::remove_file(&fetch_target).await;
            return Err(err);
        }
        if let Err(err) = fetch_result {
            let _ = tokio::fs::remove_file(&fetch_target).await;
            return Err(err);
        }

        let produced = if is_audio_only {
            sink.describe("Converting to MP3").await?;
            let converted = ctx.pipeline.to_audio(&fetch_target, &dest).await;
            let _ = tokio::fs::remove_file(&fetch_target).await;
            converted?;
            sink.set_filepath(&dest).await?;
            dest
        } else {
            dest
        };

        apply_clip(ctx, &mut sink, request, produced).await
    }
}

// ---------------------------------------------------------------------------
// URL & playlist parsing
// ---------------------------------------------------------------------------

/// Video id from the supported URL shapes (`/video/<id>`, `/play/embed/<id>`,
/// `/play/private/<id>`, `/embed/<id>`, `?v=<id>`).
fn extract_video_id(url: &str) -> Option<String> {
    let take_id = |rest: &str| -> Option<String> {
        let id: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    };

    for marker in [
        "rutube.ru/video/",
        "rutube.ru/play/embed/",
        "rutube.ru/play/private/",
        "rutube.ru/embed/",
        "?v=",
        "&v=",
    ] {
        if let Some(idx) = url.find(marker) {
            if let Some(id) = take_id(&url[idx + marker.len()..]) {
                return Some(id);
            }
        }
    }
    None
}

/// Depth-first search for the first `.m3u8` URL anywhere in a JSON payload.
fn find_first_m3u8(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.contains(".m3u8") => Some(s.clone()),
        Value::Object(map) => map.values().find_map(find_first_m3u8),
        Value::Array(items) => items.iter().find_map(find_first_m3u8),
        _ => None,
    }
}

/// Resolve a possibly-relative playlist URI against the master's URL.
fn join_url(base: &str, relative: &str) -> String {
    if relative.starts_with("http://") || relative.starts_with("https://") {
        return relative.to_string();
    }
    match base.rfind('/') {
        Some(idx) => format!("{}/{}", &base[..idx], relative),
        None => relative.to_string(),
    }
}

/// Split an attribute list on commas that are outside double quotes.
fn split_attributes(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (idx, c) in raw.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(raw[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(raw[start..].trim());
    parts
}

fn attribute<'a>(attrs: &[&'a str], name: &str) -> Option<&'a str> {
    attrs.iter().find_map(|part| {
        part.strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
            .map(|value| value.trim_matches('"'))
    })
}

/// Parse an HLS master playlist into height-keyed variants.
///
/// `#EXT-X-MEDIA` audio entries are collected per GROUP-ID (preferring
/// DEFAULT=YES); every `#EXT-X-STREAM-INF` line plus its URI line becomes a
/// variant with the resolved audio group, keyed by the RESOLUTION height.
pub(crate) fn parse_master_playlist(text: &str, base_url: &str) -> BTreeMap<u32, HlsVariant> {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    let mut audio_groups: BTreeMap<String, String> = BTreeMap::new();
    let mut audio_defaults: BTreeMap<String, String> = BTreeMap::new();

    for line in &lines {
        let Some(raw) = line.strip_prefix("#EXT-X-MEDIA:") else {
            continue;
        };
        let attrs = split_attributes(raw);
        if attribute(&attrs, "TYPE") != Some("AUDIO") {
            continue;
        }
        let (Some(group_id), Some(uri)) = (attribute(&attrs, "GROUP-ID"), attribute(&attrs, "URI"))
        else {
            continue;
        };
        let full = join_url(base_url, uri);
        if attribute(&attrs, "DEFAULT") == Some("YES") {
            audio_defaults.insert(group_id.to_string(), full);
        } else {
            audio_groups.entry(group_id.to_string()).or_insert(full);
        }
    }

    let mut variants = BTreeMap::new();
    for (idx, line) in lines.iter().enumerate() {
        let Some(raw) = line.strip_prefix("#EXT-X-STREAM-INF:") else {
            continue;
        };
        let Some(uri_line) = lines.get(idx + 1).filter(|l| !l.starts_with('#')) else {
            continue;
        };
        let attrs = split_attributes(raw);

        let height = attribute(&attrs, "RESOLUTION")
            .and_then(|res| res.split('x').nth(1))
            .and_then(|h| h.parse::<u32>().ok());
        let Some(height) = height else { continue };

        let audio = attribute(&attrs, "AUDIO").and_then(|group| {
            audio_defaults
                .get(group)
                .or_else(|| audio_groups.get(group))
                .cloned()
        });
        let bandwidth = attribute(&attrs, "AVERAGE-BANDWIDTH")
            .or_else(|| attribute(&attrs, "BANDWIDTH"))
            .and_then(|bw| bw.parse::<u64>().ok());

        variants.insert(
            height,
            HlsVariant {
                video: join_url(base_url, uri_line),
                audio,
                bandwidth,
            },
        );
    }
    variants
}
