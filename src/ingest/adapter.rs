// src/ingest/adapter.rs
//! Source adapter: conditional fetch → parse → freshness/identity filter →
//! `AdapterEvent`s → dispatch queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;

use crate::error::IngestError;
use crate::ingest::classify_kind;
use crate::ingest::fetch::{FetchOutcome, Transport};
use crate::ingest::providers::{rss, youtube, ParsedEntry};
use crate::ingest::queue::{Enqueue, IngestJob, JobQueue};
use crate::ingest::types::{AdapterEvent, FetchCursor, SourceSpec, SourceTarget};
use crate::ingest::normalize_text;

const TITLE_MAX_CHARS: usize = 300;

/// Outcome of one adapter invocation for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub source: String,
    pub not_modified: bool,
    pub parsed: usize,
    pub events: usize,
    pub enqueued: usize,
    pub duplicates: usize,
}

/// Something that can ingest one source. Implemented by [`SourceAdapter`];
/// the scheduler and webhook receiver only see this seam.
#[async_trait]
pub trait IngestSource: Send + Sync {
    async fn ingest(&self, spec: &SourceSpec, cutoff: Option<DateTime<Utc>>) -> Result<IngestReport, IngestError>;
}

pub struct SourceAdapter {
    transport: Arc<dyn Transport>,
    cursors: Arc<dyn crate::store::FetchCursorStore>,
    queue: Arc<dyn JobQueue>,
    cursor_ttl: Duration,
}

impl SourceAdapter {
    pub fn new(
        transport: Arc<dyn Transport>,
        cursors: Arc<dyn crate::store::FetchCursorStore>,
        queue: Arc<dyn JobQueue>,
        cursor_ttl: Duration,
    ) -> Self {
        Self {
            transport,
            cursors,
            queue,
            cursor_ttl,
        }
    }

    /// Fetch one source and turn its fresh entries into events. A "not
    /// modified" answer yields `Ok(None)` and leaves the cursor alone.
    pub async fn fetch(
        &self,
        spec: &SourceSpec,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Option<(usize, Vec<AdapterEvent>)>, IngestError> {
        let key = spec.key();
        let url = spec.feed_url();
        let cursor = self.cursors.get(&key).await?;

        let outcome = self.transport.get(&url, cursor.as_ref()).await?;
        let (body, etag, last_modified) = match outcome {
            FetchOutcome::NotModified => {
                tracing::debug!(target: "ingest", source = %key, "not modified");
                counter!("ingest_not_modified_total").increment(1);
                return Ok(None);
            }
            FetchOutcome::Fresh {
                body,
                etag,
                last_modified,
            } => (body, etag, last_modified),
        };

        let parsed = match &spec.target {
            SourceTarget::Youtube { .. } => youtube::parse_youtube(&body, &url)?,
            SourceTarget::Rss { .. } => rss::parse_feed(&body, &url)?,
        };

        // Cursor is written only after the document parsed; a broken body
        // should be fetched in full next time.
        let fresh = FetchCursor {
            etag,
            last_modified,
        };
        if !fresh.is_empty() {
            self.cursors.put(&key, &fresh, self.cursor_ttl).await?;
        }

        let parsed_len = parsed.len();
        let events = to_events(spec, parsed, cutoff, Utc::now());
        Ok(Some((parsed_len, events)))
    }
}

/// Identity, freshness and cap filtering. Order follows the document.
pub fn to_events(
    spec: &SourceSpec,
    parsed: Vec<ParsedEntry>,
    cutoff: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Vec<AdapterEvent> {
    let source = spec.source_ref();
    let labels: Vec<String> = spec.vertical.iter().cloned().collect();
    let cap = spec.max_items.unwrap_or(usize::MAX);

    parsed
        .into_iter()
        .filter_map(|p| {
            let Some(event_id) = p.event_id.filter(|id| !id.trim().is_empty()) else {
                tracing::debug!(target: "ingest", source = %source.key, "entry without identifier dropped");
                return None;
            };
            let published_at = p.published_at.unwrap_or(now);
            if let Some(cut) = cutoff {
                if published_at <= cut {
                    return None;
                }
            }
            let title = normalize_text(&p.entry.title, TITLE_MAX_CHARS);
            if title.is_empty() {
                return None;
            }
            Some(AdapterEvent {
                source: source.clone(),
                source_event_id: event_id.trim().to_string(),
                kind_hint: classify_kind(&title, spec.default_kind()),
                title,
                published_at,
                labels: labels.clone(),
                payload: p.entry,
            })
        })
        .take(cap)
        .collect()
}

#[async_trait]
impl IngestSource for SourceAdapter {
    async fn ingest(&self, spec: &SourceSpec, cutoff: Option<DateTime<Utc>>) -> Result<IngestReport, IngestError> {
        let mut report = IngestReport {
            source: spec.key(),
            ..IngestReport::default()
        };

        let fetched = match self.fetch(spec, cutoff).await {
            Ok(v) => v,
            Err(e) => {
                counter!("ingest_provider_errors_total").increment(1);
                return Err(e);
            }
        };
        let Some((parsed, events)) = fetched else {
            report.not_modified = true;
            return Ok(report);
        };
        report.parsed = parsed;
        report.events = events.len();

        for ev in events {
            match self.queue.enqueue(IngestJob::new(ev)).await? {
                Enqueue::Accepted => report.enqueued += 1,
                Enqueue::Duplicate => report.duplicates += 1,
            }
        }

        tracing::info!(
            target: "ingest",
            source = %report.source,
            parsed = report.parsed,
            events = report.events,
            enqueued = report.enqueued,
            duplicates = report.duplicates,
            "source ingested"
        );
        Ok(report)
    }
}
