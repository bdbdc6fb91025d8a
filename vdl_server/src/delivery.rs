//! File delivery: stream the produced file to the client, then flip the
//! task to DONE and unlink the file.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::AsyncReadExt;

use vdl_core::paths::display_file_name;
use vdl_core::TaskStatus;

use crate::disposition::attachment_value;
use crate::server::{ApiError, AppState};

const CHUNK_SIZE: usize = 1024 * 1024;

pub async fn deliver_file(state: Arc<AppState>, task_id: String) -> Result<Response, ApiError> {
    let store = state.orchestrator.store();
    let Some(task) = store.get_task(&task_id).await? else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Task with id {task_id} not found."),
        ));
    };

    if task.status.status == TaskStatus::Pending {
        return Err(ApiError::new(
            StatusCode::NOT_ACCEPTABLE,
            "The file is not ready.",
        ));
    }

    let path = PathBuf::from(&task.filepath);
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) if !task.filepath.is_empty() && metadata.is_file() => metadata,
        _ => {
            return Err(ApiError::new(
                StatusCode::NOT_FOUND,
                "The file does not exist.",
            ));
        }
    };

    let filename = display_file_name(&path, &task_id);
    log::info!(
        "[deliver] task {task_id}: streaming {} ({} bytes)",
        path.display(),
        metadata.len()
    );

    // The cleanup (unlink + COMPLETED→DONE) runs only after the last chunk
    // was handed to the transport; a dropped connection drops the stream
    // before that point and leaves the task deliverable.
    let stream_path = path.clone();
    let stream_state = Arc::clone(&state);
    let stream_task_id = task_id.clone();
    let stream = async_stream::stream! {
        let mut file = match tokio::fs::File::open(&stream_path).await {
            Ok(file) => file,
            Err(err) => {
                log::error!("[deliver] open failed for {}: {err}", stream_path.display());
                yield Err(err);
                return;
            }
        };
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(read) => yield Ok(Bytes::copy_from_slice(&buf[..read])),
                Err(err) => {
                    log::error!("[deliver] read failed for {}: {err}", stream_path.display());
                    yield Err(err);
                    return;
                }
            }
        }
        drop(file);

        match tokio::fs::remove_file(&stream_path).await {
            Ok(()) => log::info!("[deliver] removed {}", stream_path.display()),
            Err(err) => log::warn!("[deliver] unlink failed for {}: {err}", stream_path.display()),
        }
        if let Err(err) = stream_state.orchestrator.mark_delivered(&stream_task_id).await {
            log::warn!("[deliver] DONE transition failed for {stream_task_id}: {err}");
        }
    };

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&attachment_value(&filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&metadata.len().to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    Ok(response)
}
