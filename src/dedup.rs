// src/dedup.rs
//! Canonicalizer / dedup engine.
//!
//! Two reports of the same event from different sources normalise to the
//! same signature. Admission is a single atomic insert-if-absent on the
//! signature store; only the inserting caller builds and publishes a Story.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::IngestError;
use crate::extract::ExtractedPayload;
use crate::ingest::types::{AdapterEvent, CanonicalSignature, Story};
use crate::store::{FeedStore, SignatureStore};

const SIGNATURE_HEX_LEN: usize = 32;
/// Titles shorter than this (in tokens) borrow tokens from the summary.
const MIN_TITLE_TOKENS: usize = 3;
const SUMMARY_REFINE_TOKENS: usize = 12;

static STOPWORDS: &[&str] = &[
    "breaking", "exclusive", "official", "watch", "now", "update", "updated", "live", "hd", "4k",
    "video", "latest", "viral", "shocking", "reportedly", "just", "new", "first", "look", "full",
    "must", "see", "omg", "wow", "alert", "confirmed", "revealed", "finally", "here", "heres",
];

// Multi-word hype that a token filter would only half remove.
static RE_HYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(watch now|must watch|you won'?t believe|in case you missed it|everything we know)\b")
        .unwrap()
});

static RE_FOOTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)(read (the )?full (story|article|review)|continue reading|follow us on|the post .{0,200} appeared first on|click here to|subscribe (to|for) ).*$",
    )
    .unwrap()
});

static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Lowercase, keep only letters/digits/whitespace, drop hype tokens.
pub fn canonicalize(text: &str) -> String {
    let lowered = RE_HYPE.replace_all(&text.to_lowercase(), " ").into_owned();
    let cleaned: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    let tokens: Vec<&str> = cleaned
        .split_whitespace()
        .filter(|t| !STOPWORDS.contains(t))
        .collect();
    RE_WS.replace_all(&tokens.join(" "), " ").trim().to_string()
}

/// Footer boilerplate removed before canonicalising.
pub fn canonicalize_summary(text: &str) -> String {
    canonicalize(&RE_FOOTER.replace(text, " "))
}

/// Stable function of the canonical title; short titles are refined with
/// the leading summary tokens. `None` when nothing survives.
pub fn signature(title: &str, summary: &str) -> Option<CanonicalSignature> {
    let title = canonicalize(title);
    let mut basis = title.clone();
    if title.split_whitespace().count() < MIN_TITLE_TOKENS {
        let refine: Vec<String> = canonicalize_summary(summary)
            .split_whitespace()
            .take(SUMMARY_REFINE_TOKENS)
            .map(str::to_string)
            .collect();
        if !refine.is_empty() {
            basis = format!("{basis} | {}", refine.join(" "));
        }
    }
    if basis.trim().is_empty() {
        return None;
    }
    Some(digest(&basis))
}

fn digest(basis: &str) -> CanonicalSignature {
    let hex = hex::encode(Sha256::digest(basis.as_bytes()));
    CanonicalSignature(hex[..SIGNATURE_HEX_LEN].to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted(Story),
    /// Signature already seen; silent no-op.
    Duplicate(CanonicalSignature),
}

pub struct Canonicalizer {
    signatures: Arc<dyn SignatureStore>,
    feed: Arc<dyn FeedStore>,
    max_feed_len: usize,
    signature_ttl: Duration,
}

impl Canonicalizer {
    pub fn new(
        signatures: Arc<dyn SignatureStore>,
        feed: Arc<dyn FeedStore>,
        max_feed_len: usize,
        signature_ttl: Duration,
    ) -> Self {
        Self {
            signatures,
            feed,
            max_feed_len: max_feed_len.max(1),
            signature_ttl,
        }
    }

    pub fn signature_for(event: &AdapterEvent, payload: &ExtractedPayload) -> CanonicalSignature {
        let title = if payload.title.is_empty() {
            &event.title
        } else {
            &payload.title
        };
        // Nothing textual left: fall back to the source identity so the
        // event is still admitted at most once.
        signature(title, &payload.summary).unwrap_or_else(|| digest(&format!("id:{}", event.job_id())))
    }

    pub async fn admit(&self, event: &AdapterEvent, payload: &ExtractedPayload) -> Result<Admission, IngestError> {
        let sig = Self::signature_for(event, payload);
        if !self.signatures.insert_if_absent(&sig, self.signature_ttl).await? {
            counter!("dedup_suppressed_total").increment(1);
            tracing::debug!(target: "dedup", signature = %sig, job_id = %event.job_id(), "duplicate suppressed");
            return Ok(Admission::Duplicate(sig));
        }

        let story = Story {
            id: format!("{}:{}", event.source.key, event.source_event_id),
            kind: event.kind_hint,
            title: if payload.title.is_empty() {
                event.title.clone()
            } else {
                payload.title.clone()
            },
            summary: payload.summary.clone(),
            published_at: event.published_at,
            source: event.source.clone(),
            url: payload.url.clone(),
            thumb_url: payload.thumb_url().map(str::to_string),
            tags: event.labels.clone(),
            normalized_at: Utc::now(),
        };
        self.feed.push_trim(&story, self.max_feed_len).await?;
        counter!("dedup_admitted_total").increment(1);
        if let Ok(len) = self.feed.len().await {
            gauge!("feed_len").set(len as f64);
        }
        tracing::info!(target: "dedup", story_id = %story.id, kind = %story.kind, signature = %sig, "story admitted");
        Ok(Admission::Admitted(story))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::queue::tests::event;
    use crate::store::{MemoryFeedStore, MemorySignatureStore};

    fn payload(title: &str, summary: &str) -> ExtractedPayload {
        ExtractedPayload {
            title: title.into(),
            summary: summary.into(),
            ..ExtractedPayload::default()
        }
    }

    fn engine(max_len: usize) -> (Canonicalizer, Arc<MemoryFeedStore>) {
        let feed = Arc::new(MemoryFeedStore::new());
        let c = Canonicalizer::new(
            Arc::new(MemorySignatureStore::new()),
            feed.clone(),
            max_len,
            Duration::from_secs(3600),
        );
        (c, feed)
    }

    #[test]
    fn canonicalize_drops_hype_and_punctuation() {
        assert_eq!(
            canonicalize("BREAKING: Movie X \u{2014} Official Trailer | Watch Now!"),
            "movie x trailer"
        );
        assert_eq!(canonicalize("Movie X - Official Trailer"), "movie x trailer");
        assert_eq!(
            canonicalize_summary("Cast confirmed. Read full story at Variety"),
            "cast"
        );
    }

    #[test]
    fn signature_is_title_dominated() {
        let a = signature("Movie X \u{2014} Official Trailer", "first summary").unwrap();
        let b = signature("EXCLUSIVE: Movie X official trailer", "entirely different").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);
        // short titles are refined by the summary
        let s1 = signature("Update", "Studio A buys studio B").unwrap();
        let s2 = signature("Update", "Network renews show C").unwrap();
        assert_ne!(s1, s2);
        assert!(signature("Breaking!", "").is_none());
    }

    #[tokio::test]
    async fn same_story_from_two_sources_is_admitted_once() {
        let (c, feed) = engine(10);
        let e1 = event("rss:variety", "1", "Movie X — Official Trailer");
        let e2 = event("youtube:UC1", "abc", "BREAKING: Movie X Official Trailer");
        let r1 = c.admit(&e1, &payload(&e1.title, "")).await.unwrap();
        let r2 = c.admit(&e2, &payload(&e2.title, "")).await.unwrap();
        assert!(matches!(r1, Admission::Admitted(ref s) if s.id == "rss:variety:1"));
        assert!(matches!(r2, Admission::Duplicate(_)));
        assert_eq!(feed.len().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admission_publishes_exactly_one() {
        let (c, feed) = engine(100);
        let c = Arc::new(c);
        let mut handles = Vec::new();
        for i in 0..16 {
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                let ev = event(&format!("rss:s{i}"), "x", "Studio announces sequel to hit film");
                let p = payload(&ev.title, "");
                c.admit(&ev, &p).await.unwrap()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if matches!(h.await.unwrap(), Admission::Admitted(_)) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(feed.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn feed_keeps_most_recent_admissions() {
        let (c, feed) = engine(3);
        for i in 0..5 {
            let ev = event("rss:a", &i.to_string(), &format!("Distinct headline number {i} here"));
            c.admit(&ev, &payload(&ev.title, "")).await.unwrap();
        }
        let ids: Vec<_> = feed.snapshot(10).await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["rss:a:4", "rss:a:3", "rss:a:2"]);
    }

    #[tokio::test]
    async fn empty_text_falls_back_to_event_identity() {
        let (c, _) = engine(10);
        let e1 = event("rss:a", "1", "!!!");
        let e2 = event("rss:a", "2", "!!!");
        assert!(matches!(c.admit(&e1, &payload("", "")).await.unwrap(), Admission::Admitted(_)));
        assert!(matches!(c.admit(&e2, &payload("", "")).await.unwrap(), Admission::Admitted(_)));
        assert!(matches!(c.admit(&e1, &payload("", "")).await.unwrap(), Admission::Duplicate(_)));
    }
}
