//! Server-Sent Events rendering of job progress.

use axum::response::sse::{Event as AxumEvent, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use futures_util::{Stream, StreamExt};
use kiln_core::{EventKind, ProgressEvent};
use std::convert::Infallible;
use std::time::Duration;

use crate::error::{Result, ServerError};

/// An SSE event that can be sent to clients.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            event_type: None,
            data: data.into(),
            id: None,
        }
    }

    pub fn with_type(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            data: data.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Render a progress event; the sequence number becomes the SSE id
    pub fn from_progress(event: &ProgressEvent) -> Result<Self> {
        let data = serde_json::to_string(event).map_err(ServerError::Json)?;
        Ok(Self::with_type(event_name(event.kind), data).with_id(event.sequence.to_string()))
    }
}

pub fn event_name(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Step => "checklist_update",
        EventKind::Summary => "execution_summary",
        EventKind::Completed => "task_completed",
        EventKind::Failed => "task_failed",
    }
}

impl From<SseEvent> for AxumEvent {
    fn from(event: SseEvent) -> Self {
        let mut axum_event = AxumEvent::default().data(event.data);

        if let Some(event_type) = event.event_type {
            axum_event = axum_event.event(event_type);
        }

        if let Some(id) = event.id {
            axum_event = axum_event.id(id);
        }

        axum_event
    }
}

fn to_axum(event: ProgressEvent) -> std::result::Result<AxumEvent, Infallible> {
    match SseEvent::from_progress(&event) {
        Ok(sse_event) => Ok(sse_event.into()),
        Err(e) => {
            log::error!("Failed to convert progress event to SSE: {}", e);
            Ok(SseEvent::with_type(
                "error",
                format!(r#"{{"error": "Failed to serialize event: {}"}}"#, e),
            )
            .into())
        }
    }
}

/// SSE response over a progress stream; it ends after the terminal event
pub fn progress_response<S>(stream: S, keepalive_interval: Duration) -> Response
where
    S: Stream<Item = ProgressEvent> + Send + 'static,
{
    Sse::new(stream.map(to_axum))
        .keep_alive(
            KeepAlive::new()
                .interval(keepalive_interval)
                .text("keep-alive"),
        )
        .into_response()
}
