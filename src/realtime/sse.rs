// src/realtime/sse.rs
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive},
        Sse,
    },
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use super::{RealtimeHub, ReplayFrame};

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Last seen sequence number; `$` or absent = only future items.
    pub cursor: Option<String>,
}

/// GET /stream?cursor=<seq>
/// Also honours `Last-Event-ID` so browsers resume after a reconnect.
pub async fn stream_handler(
    State(hub): State<Arc<RealtimeHub>>,
    Query(q): Query<StreamQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let raw = q.cursor.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    let after = hub.resolve_cursor(raw.as_deref()).await;
    let heartbeat = hub.cfg().heartbeat;
    tracing::debug!(target: "realtime", after, "sse client connected");

    let stream = hub.replay(after).map(|frame| {
        Ok(match frame {
            ReplayFrame::Story { seq, json } => Event::default().id(seq.to_string()).event("story").data(json),
            ReplayFrame::Heartbeat => Event::default().comment("heartbeat"),
        })
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat * 2))
}
