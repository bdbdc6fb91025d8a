//! VK adapter.
//!
//! Metadata comes from the `al_video.php` endpoint whose player params carry
//! one direct mp4 URL per offered height (`url144` … `url1080`). The
//! transfer is a multi-range download: ten parallel byte-range GETs write
//! `part_k.tmp` files under a task-id subdirectory, every chunk bumps a
//! shared byte counter, and the parts are concatenated in order once all
//! ranges finish.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::paths::{download_path, parts_dir};
use crate::providers::http::{apply_headers, get_content_length};
use crate::providers::{apply_clip, load_task, DownloadCtx, ProgressSink, Provider};
use crate::task::{DownloadRequest, MediaSnapshot, MediaVariant};

const VIDEO_INFO_URL: &str = "https://vkvideo.ru/al_video.php?act=show";
pub const CONNECTIONS: usize = 10;
const QUALITIES: [u32; 6] = [144, 240, 360, 480, 720, 1080];

pub struct VkProvider;

#[derive(Debug)]
struct VkVideo {
    title: String,
    author: String,
    duration: Option<u64>,
    preview_url: Option<String>,
    /// (height, direct url) in ascending height order.
    content_urls: Vec<(u32, String)>,
}

impl VkProvider {
    pub fn new() -> Self {
        Self
    }

    fn headers(url: &str) -> Vec<(String, String)> {
        vec![
            (
                "User-Agent".into(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36".into(),
            ),
            ("X-Requested-With".into(), "XMLHttpRequest".into()),
            ("Referer".into(), url.into()),
        ]
    }

    async fn fetch_video(&self, ctx: &DownloadCtx, url: &str) -> Result<VkVideo, DownloadError> {
        let (owner_id, video_id) = extract_video_ref(url)
            .ok_or_else(|| DownloadError::Provider("VK: cannot extract video id".into()))?;

        let form = [
            ("al", "1".to_string()),
            ("is_video_page", "true".to_string()),
            ("video", format!("-{owner_id}_{video_id}")),
        ];
        let payload: Value = apply_headers(ctx.http.post(VIDEO_INFO_URL), &Self::headers(url))
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_video_info(&payload)
    }
}

impl Default for VkProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for VkProvider {
    fn name(&self) -> &'static str {
        "VK"
    }

    async fn resolve_formats(
        &self,
        ctx: &DownloadCtx,
        url: &str,
    ) -> Result<MediaSnapshot, DownloadError> {
        let video = self.fetch_video(ctx, url).await?;
        let variants = video
            .content_urls
            .iter()
            .map(|(height, _)| MediaVariant {
                quality: format!("{height}p"),
                video_variant_id: height.to_string(),
                audio_variant_id: String::new(),
                filesize: None,
            })
            .collect();

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
        let headers = Self::headers(&request.url);

        let content_url = video
            .content_urls
            .iter()
            .find(|(height, _)| height.to_string() == request.video_variant_id)
            .map(|(_, url)| url.clone())
            .ok_or_else(|| {
                DownloadError::Provider(format!(
                    "VK: quality {} not offered",
                    request.video_variant_id
                ))
            })?;

        let dest = download_path(
            &ctx.settings.download_dir,
            &video.author,
            task_id,
            &video.title,
            ".mp4",
        );
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let total_size = get_content_length(&ctx.http, &content_url, &headers)
            .await?
            .ok_or_else(|| DownloadError::Provider("VK: upstream reports no size".into()))?;

        let mut sink = ProgressSink::new(ctx.store.clone(), task, Some(total_size));
        sink.set_filepath(&dest).await?;
        sink.describe("Downloading video track").await?;

        let part_dir = parts_dir(&dest, task_id);
        tokio::fs::create_dir_all(&part_dir).await?;

        let result = fetch_ranged(
            ctx,
            &content_url,
            &headers,
            total_size,
            &part_dir,
            &mut sink,
        )
        .await;
        if let Err(err) = result {
            let _ = tokio::fs::remove_dir_all(&part_dir).await;
            return Err(err);
        }

        sink.describe("Merging parts video track").await?;
        let merged = merge_parts(&part_dir, CONNECTIONS, &dest).await;
        let _ = tokio::fs::remove_dir_all(&part_dir).await;
        merged?;

        apply_clip(ctx, &mut sink, request, dest).await
    }
}

// ---------------------------------------------------------------------------
// Multi-range transfer
// ---------------------------------------------------------------------------

/// Byte ranges covering `total_size` for `connections` workers; the last
/// range absorbs the remainder.
fn split_ranges(total_size: u64, connections: usize) -> Vec<(u64, u64)> {
    let connections = connections.max(1) as u64;
    let slice = total_size / connections;
    (0..connections)
        .map(|k| {
            let start = k * slice;
            let end = if k == connections - 1 {
                total_size - 1
            } else {
                start + slice - 1
            };
            (start, end)
        })
        .collect()
}

pub async fn fetch_ranged(
    ctx: &DownloadCtx,
    url: &str,
    headers: &[(String, String)],
    total_size: u64,
    part_dir: &Path,
    sink: &mut ProgressSink,
) -> Result<(), DownloadError> {
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<u64>(256);

    let mut handles = Vec::with_capacity(CONNECTIONS);
    for (k, (start, end)) in split_ranges(total_size, CONNECTIONS).into_iter().enumerate() {
        let client = ctx.http.clone();
        let url = url.to_string();
        let headers = headers.to_vec();
        let part_path = part_dir.join(format!("part_{k}.tmp"));
        let tx = tx.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            fetch_range(&client, &url, &headers, start, end, &part_path, tx, cancel).await
        }));
    }
    drop(tx);

    // Drain byte deltas: one writer owns the counter and the store updates,
    // the range tasks only push deltas. A cancel observed here fans out via
    // the token.
    let mut aborted: Option<DownloadError> = None;
    while let Some(delta) = rx.recv().await {
        if let Err(err) = sink.advance(delta).await {
            cancel.cancel();
            aborted = Some(err);
            break;
        }
    }
    drop(rx);

    let mut first_error: Option<DownloadError> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(DownloadError::Provider(format!(
                        "VK: range task failed: {join_err}"
                    )));
                }
            }
        }
    }

    if let Some(err) = aborted {
        return Err(err);
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn fetch_range(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    start: u64,
    end: u64,
    part_path: &Path,
    tx: mpsc::Sender<u64>,
    cancel: CancellationToken,
) -> Result<(), DownloadError> {
    let response = apply_headers(client.get(url), headers)
        .header("Range", format!("bytes={start}-{end}"))
        .send()
        .await?
        .error_for_status()?;

    let file = tokio::fs::File::create(part_path).await?;
    let mut writer = tokio::io::BufWriter::with_capacity(256 * 1024, file);
    let mut stream = response.bytes_stream();

    // Cap writes to the requested range. A server that ignores the Range
    // header and streams the full body would otherwise blow every part up
    // to the whole file.
    let expected = end - start + 1;
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(DownloadError::Canceled);
        }
        let chunk = chunk?;
        let usable = ((expected - written).min(chunk.len() as u64)) as usize;
        if usable == 0 {
            break;
        }
        writer.write_all(&chunk[..usable]).await?;
        written += usable as u64;
        // Receiver gone means the drainer already gave up; stop quietly.
        if tx.send(usable as u64).await.is_err() {
            return Err(DownloadError::Canceled);
        }
        if written >= expected {
            break;
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Concatenate `part_0.tmp` … `part_{n-1}.tmp` into the final file and
/// delete them. Runs on a blocking thread; this is sequential disk I/O.
pub async fn merge_parts(part_dir: &Path, parts: usize, dest: &Path) -> Result<(), DownloadError> {
    let part_dir = part_dir.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        use std::fs::File;
        use std::io::Write;

        let mut output = File::create(&dest)?;
        for k in 0..parts {
            let part_path = part_dir.join(format!("part_{k}.tmp"));
            let mut input = File::open(&part_path)?;
            std::io::copy(&mut input, &mut output)?;
            let _ = std::fs::remove_file(&part_path);
        }
        output.flush()?;
        Ok::<(), std::io::Error>(())
    })
    .await
    .map_err(|join_err| DownloadError::Provider(format!("VK: merge task failed: {join_err}")))??;
    Ok(())
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Pull `owner_id` and `video_id` out of a `…video-12345_67890…` URL.
fn extract_video_ref(url: &str) -> Option<(String, String)> {
    let idx = url.find("video-")?;
    let digits: String = url["video-".len() + idx..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '_')
        .collect();
    let (owner, video) = digits.split_once('_')?;
    if owner.is_empty() || video.is_empty() || video.contains('_') {
        return None;
    }
    Some((owner.to_string(), video.to_string()))
}

fn parse_video_info(payload: &Value) -> Result<VkVideo, DownloadError> {
    let params = &payload["payload"][1][4]["player"]["params"][0];
    if params.is_null() {
        return Err(DownloadError::Provider(
            "VK: unexpected video info response".into(),
        ));
    }

    let content_urls: Vec<(u32, String)> = QUALITIES
        .iter()
        .filter_map(|q| {
            params[&format!("url{q}")]
                .as_str()
                .map(|url| (*q, url.to_string()))
        })
        .collect();
    if content_urls.is_empty() {
        return Err(DownloadError::Provider("VK: no playable renditions".into()));
    }

    Ok(VkVideo {
        title: params["md_title"].as_str().unwrap_or("vk_video").to_string(),
        author: params["md_author"].as_str().unwrap_or("vk").to_string(),
        duration: params["duration"].as_u64(),
        preview_url: params["jpg"].as_str().map(str::to_string),
        content_urls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_ref_from_url() {
        assert_eq!(
            extract_video_ref("https://vkvideo.ru/video-12345_67890"),
            Some(("12345".into(), "67890".into()))
        );
        assert_eq!(extract_video_ref("https://vk.com/feed"), None);
    }

    #[test]
    fn ranges_cover_every_byte_once() {
        let ranges = split_ranges(1000, 10);
        assert_eq!(ranges.len(), 10);
        assert_eq!(ranges[0], (0, 99));
        assert_eq!(ranges[9], (900, 999));
        let covered: u64 = ranges.iter().map(|(s, e)| e - s + 1).sum();
        assert_eq!(covered, 1000);
        for window in ranges.windows(2) {
            assert_eq!(window[0].1 + 1, window[1].0);
        }
    }

    #[test]
    fn last_range_absorbs_remainder() {
        let ranges = split_ranges(1003, 10);
        assert_eq!(ranges[9], (900, 1002));
    }

    #[test]
    fn player_params_parse_to_renditions() {
        let payload = serde_json::json!({
            "payload": [0, [null, null, null, null, {
                "player": {"params": [{
                    "md_title": "Кот и пёс",
                    "md_author": "Cats Club",
                    "duration": 61,
                    "jpg": "https://img.vk.test/p.jpg",
                    "url360": "https://cdn.vk.test/360.mp4",
                    "url720": "https://cdn.vk.test/720.mp4"
                }]}
            }]]
        });
        let video = parse_video_info(&payload).unwrap();
        assert_eq!(video.title, "Кот и пёс");
        assert_eq!(video.content_urls.len(), 2);
        assert_eq!(video.content_urls[1].0, 720);
    }

    #[test]
    fn malformed_payload_is_a_provider_error() {
        let payload = serde_json::json!({"payload": "nope"});
        assert!(parse_video_info(&payload).is_err());
    }
}
