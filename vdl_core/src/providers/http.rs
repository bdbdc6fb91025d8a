//! Shared byte-level transfer helpers for the single-connection adapters.

use std::path::Path;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::DownloadError;
use crate::providers::ProgressSink;

/// Write buffer size; keeps the tokio runtime off the disk for every chunk.
const WRITE_BUFFER: usize = 256 * 1024;

pub(crate) fn apply_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &[(String, String)],
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

/// Streamed GET into `dest`, reporting every chunk to the sink (which also
/// polls the cancel flag). Returns the number of bytes written.
pub(crate) async fn stream_to_file(
    http: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    dest: &Path,
    sink: &mut ProgressSink,
) -> Result<u64, DownloadError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let response = apply_headers(http.get(url), headers)
        .send()
        .await?
        .error_for_status()?;

    let file = tokio::fs::File::create(dest).await?;
    let mut writer = tokio::io::BufWriter::with_capacity(WRITE_BUFFER, file);
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
        if let Err(err) = sink.advance(chunk.len() as u64).await {
            // Leave no partial file behind on cancel or store failure.
            let _ = writer.flush().await;
            drop(writer);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(err);
        }
    }
    writer.flush().await?;
    Ok(written)
}

/// Content length via HEAD, following redirects; `None` when the upstream
/// does not say.
pub(crate) async fn head_content_length(
    http: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
) -> Result<Option<u64>, DownloadError> {
    let response = apply_headers(http.head(url), headers).send().await?;
    if response.status().is_success() {
        Ok(response.content_length())
    } else {
        Ok(None)
    }
}

/// Content length via a GET whose body is dropped unread.
pub(crate) async fn get_content_length(
    http: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
) -> Result<Option<u64>, DownloadError> {
    let response = apply_headers(http.get(url), headers)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.content_length())
}
