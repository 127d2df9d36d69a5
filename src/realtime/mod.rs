// src/realtime/mod.rs
//! Realtime fan-out over the admitted-story stream.
//!
//! Two surfaces: SSE replay from a client cursor into the story log, and a
//! live WebSocket broadcast. Both are fed by [`RealtimeHub::publish`].

pub mod sse;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use axum::{routing::get, Router};
use futures_util::Stream;
use metrics::counter;
use tokio::sync::broadcast;

use crate::error::IngestError;
use crate::ingest::types::Story;
use crate::ingest::worker::StoryConsumer;
use crate::store::StoryLog;

#[derive(Debug, Clone)]
pub struct RealtimeCfg {
    pub heartbeat: Duration,
    pub ping: Duration,
    pub broadcast_capacity: usize,
    pub read_batch: usize,
}

impl Default for RealtimeCfg {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
            ping: Duration::from_secs(25),
            broadcast_capacity: 256,
            read_batch: 50,
        }
    }
}

pub struct RealtimeHub {
    cfg: RealtimeCfg,
    log: Arc<dyn StoryLog>,
    tx: broadcast::Sender<Arc<str>>,
}

/// One unit of the replay stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayFrame {
    Story { seq: u64, json: String },
    Heartbeat,
}

impl RealtimeHub {
    pub fn new(cfg: RealtimeCfg, log: Arc<dyn StoryLog>) -> Self {
        let (tx, _) = broadcast::channel(cfg.broadcast_capacity.max(1));
        Self { cfg, log, tx }
    }

    pub fn cfg(&self) -> &RealtimeCfg {
        &self.cfg
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    /// Append to the replay log, then broadcast once to live clients.
    pub async fn publish(&self, story: &Story) -> Result<u64, IngestError> {
        let json = serde_json::to_string(story).map_err(|e| IngestError::store(format!("encode story: {e}")))?;
        let seq = self.log.append(story).await?;
        // Err only means nobody is connected right now.
        let receivers = self.tx.send(Arc::from(json)).unwrap_or(0);
        counter!("realtime_published_total").increment(1);
        tracing::debug!(target: "realtime", story_id = %story.id, seq, receivers, "story published");
        Ok(seq)
    }

    /// Resolve a client cursor: `$`, empty or unparsable means "only future
    /// items" (the current head).
    pub async fn resolve_cursor(&self, raw: Option<&str>) -> u64 {
        match raw.map(str::trim).and_then(|c| c.parse::<u64>().ok()) {
            Some(seq) => seq,
            None => self.log.head().await.unwrap_or(0),
        }
    }

    /// Endless replay from `after`; a heartbeat frame whenever a read window
    /// passes without data.
    pub fn replay(self: Arc<Self>, mut after: u64) -> impl Stream<Item = ReplayFrame> + Send {
        stream! {
            loop {
                match self.log.read_after(after, self.cfg.read_batch, self.cfg.heartbeat).await {
                    Ok(entries) if entries.is_empty() => {
                        yield ReplayFrame::Heartbeat;
                    }
                    Ok(entries) => {
                        for (seq, story) in entries {
                            after = seq;
                            match serde_json::to_string(&story) {
                                Ok(json) => {
                                    yield ReplayFrame::Story { seq, json };
                                }
                                Err(e) => tracing::warn!(target: "realtime", seq, error = %e, "unserializable story skipped"),
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(target: "realtime", error = %e, "story log read failed");
                        tokio::time::sleep(self.cfg.heartbeat).await;
                        yield ReplayFrame::Heartbeat;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl StoryConsumer for RealtimeHub {
    fn name(&self) -> &'static str {
        "realtime"
    }

    async fn on_admitted(&self, story: &Story) {
        if let Err(e) = self.publish(story).await {
            tracing::warn!(target: "realtime", story_id = %story.id, error = %e, "publish failed");
        }
    }
}

/// `/stream` (SSE replay) and `/ws` (live broadcast).
pub fn router(hub: Arc<RealtimeHub>) -> Router {
    Router::new()
        .route("/stream", get(sse::stream_handler))
        .route("/ws", get(ws::ws_handler))
        .with_state(hub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{SourceKind, SourceRef, StoryKind};
    use crate::store::MemoryStoryLog;
    use chrono::Utc;
    use futures_util::StreamExt;

    fn story(id: &str) -> Story {
        Story {
            id: id.into(),
            kind: StoryKind::News,
            title: id.into(),
            summary: String::new(),
            published_at: Utc::now(),
            source: SourceRef {
                kind: SourceKind::Rss,
                key: "rss:a".into(),
            },
            url: None,
            thumb_url: None,
            tags: vec![],
            normalized_at: Utc::now(),
        }
    }

    fn hub() -> Arc<RealtimeHub> {
        Arc::new(RealtimeHub::new(
            RealtimeCfg {
                heartbeat: Duration::from_secs(5),
                ..RealtimeCfg::default()
            },
            Arc::new(MemoryStoryLog::with_capacity(100)),
        ))
    }

    #[tokio::test]
    async fn publish_broadcasts_once_per_story() {
        let hub = hub();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.publish(&story("s1")).await.unwrap();
        let got_a = a.recv().await.unwrap();
        let got_b = b.recv().await.unwrap();
        assert_eq!(got_a, got_b);
        assert!(got_a.contains("\"id\":\"s1\""));
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_listeners_still_logs() {
        let hub = hub();
        assert_eq!(hub.publish(&story("s1")).await.unwrap(), 1);
        assert_eq!(hub.resolve_cursor(None).await, 1);
        assert_eq!(hub.resolve_cursor(Some("$")).await, 1);
        assert_eq!(hub.resolve_cursor(Some("0")).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_from_cursor_then_heartbeat() {
        let hub = hub();
        for id in ["s1", "s2", "s3"] {
            hub.publish(&story(id)).await.unwrap();
        }
        let frames: Vec<_> = hub.clone().replay(1).take(3).collect().await;
        assert!(matches!(&frames[0], ReplayFrame::Story { seq: 2, .. }));
        assert!(matches!(&frames[1], ReplayFrame::Story { seq: 3, .. }));
        assert_eq!(frames[2], ReplayFrame::Heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn default_cursor_only_sees_future_items() {
        let hub = hub();
        hub.publish(&story("old")).await.unwrap();
        let head = hub.resolve_cursor(None).await;
        let replay = hub.clone().replay(head);
        tokio::pin!(replay);

        let publisher = {
            let hub = hub.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                hub.publish(&story("new")).await.unwrap();
            })
        };
        match replay.next().await {
            Some(ReplayFrame::Story { json, .. }) => assert!(json.contains("\"id\":\"new\"")),
            other => panic!("unexpected frame {other:?}"),
        }
        publisher.await.unwrap();
    }
}
