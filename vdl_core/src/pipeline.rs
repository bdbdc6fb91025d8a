//! External media tool wrapper: mux, audio extraction, clipping and HLS
//! ingestion with live progress.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;

/// One progress sample from the HLS fetch, derived from the tool's
/// `out_time_ms=` lines.
#[derive(Debug, Clone, Copy)]
pub struct HlsProgress {
    pub seconds_done: f64,
    pub percent: f64,
}

#[derive(Clone)]
pub struct MediaPipeline {
    ffmpeg: String,
}

impl MediaPipeline {
    pub fn new(ffmpeg_path: &str) -> Self {
        Self {
            ffmpeg: ffmpeg_path.to_string(),
        }
    }

    /// Stream-copy a video and an audio file into one mp4, trimmed to the
    /// shorter of the two.
    pub async fn mux(&self, video: &Path, audio: &Path, out: &Path) -> Result<(), DownloadError> {
        self.run(&[
            "-i".as_ref(),
            video.as_os_str(),
            "-i".as_ref(),
            audio.as_os_str(),
            "-c:v".as_ref(),
            "copy".as_ref(),
            "-c:a".as_ref(),
            "copy".as_ref(),
            "-map".as_ref(),
            "0:v:0".as_ref(),
            "-map".as_ref(),
            "1:a:0".as_ref(),
            "-shortest".as_ref(),
            "-y".as_ref(),
            out.as_os_str(),
        ])
        .await
    }

    /// Extract the audio track as VBR mp3 (quality 2).
    pub async fn to_audio(&self, input: &Path, out: &Path) -> Result<(), DownloadError> {
        self.run(&[
            "-i".as_ref(),
            input.as_os_str(),
            "-vn".as_ref(),
            "-codec:a".as_ref(),
            "libmp3lame".as_ref(),
            "-qscale:a".as_ref(),
            "2".as_ref(),
            "-y".as_ref(),
            out.as_os_str(),
        ])
        .await
    }

    /// Timestamp-based stream-copy clip. Accuracy is bounded by the keyframe
    /// interval of the source.
    pub async fn clip(
        &self,
        input: &Path,
        out: &Path,
        start_seconds: Option<u64>,
        end_seconds: Option<u64>,
    ) -> Result<(), DownloadError> {
        let start;
        let end;
        let mut args: Vec<&std::ffi::OsStr> = vec!["-i".as_ref(), input.as_os_str()];
        if let Some(s) = start_seconds {
            start = s.to_string();
            args.extend::<[&std::ffi::OsStr; 2]>(["-ss".as_ref(), start.as_str().as_ref()]);
        }
        if let Some(e) = end_seconds {
            end = e.to_string();
            args.extend::<[&std::ffi::OsStr; 2]>(["-to".as_ref(), end.as_str().as_ref()]);
        }
        args.extend(["-c".as_ref(), "copy".as_ref(), "-y".as_ref(), out.as_os_str()]);
        self.run(&args).await
    }

    /// Ingest an HLS rendition (optionally a separate audio group) into a
    /// local file. Progress key/value lines are read from the tool's stdout
    /// pipe and forwarded as [`HlsProgress`]; the cancellation token is
    /// polled on every line and kills the child when set.
    pub async fn fetch_hls(
        &self,
        video_m3u8: Option<&str>,
        audio_m3u8: &str,
        out: &Path,
        duration_seconds: u64,
        headers: &[(String, String)],
        progress_tx: mpsc::Sender<HlsProgress>,
        cancel: CancellationToken,
    ) -> Result<(), DownloadError> {
        let args = build_hls_args(video_m3u8, audio_m3u8, out, headers);

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");

        // Drain stderr concurrently so a chatty tool can't fill the pipe and
        // deadlock against our stdout reads.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if cancel.is_cancelled() {
                let _ = child.kill().await;
                let _ = stderr_task.await;
                return Err(DownloadError::Canceled);
            }
            if let Some(seconds_done) = parse_progress_seconds(&line) {
                let percent = hls_percent(seconds_done, duration_seconds);
                let _ = progress_tx.try_send(HlsProgress {
                    seconds_done,
                    percent,
                });
            }
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(DownloadError::Pipeline(truncate_stderr(&stderr_text)))
        }
    }

    async fn run(&self, args: &[&std::ffi::OsStr]) -> Result<(), DownloadError> {
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr_text = String::from_utf8_lossy(&output.stderr);
            Err(DownloadError::Pipeline(truncate_stderr(&stderr_text)))
        }
    }
}

fn build_hls_args(
    video_m3u8: Option<&str>,
    audio_m3u8: &str,
    out: &Path,
    headers: &[(String, String)],
) -> Vec<std::ffi::OsString> {
    let header_blob: String = headers
        .iter()
        .map(|(name, value)| format!("{name}: {value}\r\n"))
        .collect();

    fn push_input(args: &mut Vec<std::ffi::OsString>, header_blob: &str, url: &str) {
        if !header_blob.is_empty() {
            args.push("-headers".into());
            args.push(header_blob.to_string().into());
        }
        args.push("-i".into());
        args.push(url.into());
    }

    let mut args: Vec<std::ffi::OsString> = vec!["-y".into(), "-nostats".into()];
    if let Some(video) = video_m3u8 {
        push_input(&mut args, &header_blob, video);
        push_input(&mut args, &header_blob, audio_m3u8);
        args.extend(["-map".into(), "0:v:0".into(), "-map".into(), "1:a:0".into()]);
    } else {
        push_input(&mut args, &header_blob, audio_m3u8);
    }

    args.extend([
        "-c".into(),
        "copy".into(),
        "-progress".into(),
        "pipe:1".into(),
        out.as_os_str().to_os_string(),
    ]);
    args
}

/// Extract the elapsed output time from one `-progress pipe:1` line.
/// `out_time_ms` is microseconds despite the name; `out_time` is a clock
/// string.
fn parse_progress_seconds(line: &str) -> Option<f64> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("out_time_ms=") {
        return rest.parse::<f64>().ok().map(|us| us / 1_000_000.0);
    }
    if let Some(rest) = line.strip_prefix("out_time=") {
        return Some(parse_clock_seconds(rest));
    }
    None
}

fn parse_clock_seconds(raw: &str) -> f64 {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() == 3 {
        let hours = parts[0].parse::<f64>().unwrap_or(0.0);
        let minutes = parts[1].parse::<f64>().unwrap_or(0.0);
        let seconds = parts[2].parse::<f64>().unwrap_or(0.0);
        hours * 3600.0 + minutes * 60.0 + seconds
    } else {
        raw.parse::<f64>().unwrap_or(0.0)
    }
}

fn hls_percent(seconds_done: f64, duration_seconds: u64) -> f64 {
    if duration_seconds == 0 {
        return 0.0;
    }
    ((seconds_done / duration_seconds as f64) * 100.0).clamp(0.0, 100.0)
}

fn truncate_stderr(stderr: &str) -> String {
    const LIMIT: usize = 2000;
    let trimmed = stderr.trim();
    if trimmed.len() <= LIMIT {
        trimmed.to_string()
    } else {
        let mut end = LIMIT;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn out_time_ms_is_microseconds() {
        assert_eq!(parse_progress_seconds("out_time_ms=1500000"), Some(1.5));
    }

    #[test]
    fn out_time_clock_form() {
        let secs = parse_progress_seconds("out_time=00:01:30.500000").unwrap();
        assert!((secs - 90.5).abs() < 1e-6);
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        assert_eq!(parse_progress_seconds("frame=42"), None);
        assert_eq!(parse_progress_seconds("progress=continue"), None);
    }

    #[test]
    fn percent_clamps_to_hundred() {
        assert_eq!(hls_percent(120.0, 100), 100.0);
        assert_eq!(hls_percent(25.0, 100), 25.0);
        assert_eq!(hls_percent(10.0, 0), 0.0);
    }

    #[test]
    fn hls_args_map_separate_audio_group() {
        let args = build_hls_args(
            Some("https://h/v.m3u8"),
            "https://h/a.m3u8",
            &PathBuf::from("/tmp/out.mp4"),
            &[("Referer".into(), "https://h/".into())],
        );
        let rendered: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(rendered.windows(2).any(|w| w == ["-map", "0:v:0"]));
        assert!(rendered.windows(2).any(|w| w == ["-map", "1:a:0"]));
        assert_eq!(rendered.iter().filter(|a| *a == "-headers").count(), 2);
        assert!(rendered.contains(&"pipe:1".to_string()));
    }

    #[test]
    fn hls_args_single_input_without_video() {
        let args = build_hls_args(None, "https://h/a.m3u8", &PathBuf::from("o.mp4"), &[]);
        let rendered: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(rendered.iter().filter(|a| *a == "-i").count(), 1);
        assert!(!rendered.contains(&"-map".to_string()));
    }
}
