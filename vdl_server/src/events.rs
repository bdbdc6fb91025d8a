//! SSE endpoint: initial snapshot plus the live tail of published status
//! blocks, closed after any terminal frame.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};

use vdl_core::{StatusBlock, TaskStatus};

use crate::server::{ApiError, AppState};

fn status_of(payload: &str) -> Option<TaskStatus> {
    serde_json::from_str::<StatusBlock>(payload)
        .ok()
        .map(|block| block.status)
}

pub async fn event_stream(
    state: Arc<AppState>,
    task_id: String,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Subscribe before the snapshot read so no update published in between
    // can be missed; duplicates are fine, gaps are not.
    let mut rx = state.orchestrator.store().subscribe_events(&task_id).await?;

    let Some(initial) = state.orchestrator.get_status(&task_id).await? else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("Task with id {task_id} not found."),
        ));
    };

    let stream = async_stream::stream! {
        let initial_terminal = initial.status.is_terminal();
        match serde_json::to_string(&initial) {
            Ok(json) => yield Ok::<_, Infallible>(Event::default().data(json)),
            Err(err) => log::warn!("[events] snapshot serialize failed: {err}"),
        }
        if initial_terminal {
            return;
        }

        while let Some(payload) = rx.recv().await {
            let terminal = status_of(&payload).map(|s| s.is_terminal()).unwrap_or(false);
            yield Ok::<_, Infallible>(Event::default().data(payload));
            if terminal {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
