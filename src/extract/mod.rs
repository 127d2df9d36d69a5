// src/extract/mod.rs
//! Extractor: raw feed entry → `ExtractedPayload` with ranked image
//! candidates (best first). Deterministic for identical inputs and
//! network responses.

pub mod harvest;
pub mod score;
pub mod urls;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ingest::fetch::{FetchOutcome, Transport};
use crate::ingest::normalize_text;
use crate::ingest::types::{AdapterEvent, FeedEntry, MediaRef};

pub use score::{CandidateOrigin, ImageCandidate, RawCandidate};

const TITLE_MAX_CHARS: usize = 300;
const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".gif", ".avif"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedPayload {
    pub url: Option<String>,
    pub feed: String,
    pub title: String,
    pub summary: String,
    pub content_html: Option<String>,
    pub description_html: Option<String>,
    pub published_ts: i64,
    pub enclosures: Vec<MediaRef>,
    pub inline_images: Vec<String>,
    pub image_candidates: Vec<ImageCandidate>,
}

impl ExtractedPayload {
    /// Thumbnail hint: the top candidate.
    pub fn thumb_url(&self) -> Option<&str> {
        self.image_candidates.first().map(|c| c.url.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ExtractCfg {
    /// Hosts whose article pages may be fetched when the feed offers no
    /// strong candidate. Subdomains match.
    pub page_fetch_allow: Vec<String>,
    pub strong_score: i32,
    pub summary_chars: usize,
}

impl Default for ExtractCfg {
    fn default() -> Self {
        Self {
            page_fetch_allow: Vec::new(),
            strong_score: 90,
            summary_chars: 600,
        }
    }
}

pub struct Extractor {
    cfg: ExtractCfg,
    transport: Option<Arc<dyn Transport>>,
}

impl Extractor {
    pub fn new(cfg: ExtractCfg, transport: Option<Arc<dyn Transport>>) -> Self {
        Self { cfg, transport }
    }

    pub async fn extract(&self, event: &AdapterEvent) -> ExtractedPayload {
        let entry = &event.payload;
        let url = entry
            .link
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string);

        let mut raw = feed_candidates(entry);
        let mut inline = Vec::new();
        for html in [entry.content_html.as_deref(), entry.description_html.as_deref()]
            .into_iter()
            .flatten()
        {
            let found = harvest::harvest_html(html);
            inline.extend(
                found
                    .iter()
                    .filter(|c| c.origin == CandidateOrigin::Inline)
                    .map(|c| c.url.clone()),
            );
            raw.extend(found);
        }
        // Summary fields rarely differ from description; harvest only when distinct.
        if let Some(summary) = entry.summary_html.as_deref() {
            if entry.description_html.as_deref() != Some(summary) {
                raw.extend(harvest::harvest_html(summary));
            }
        }

        let mut candidates = score::rank(raw.clone(), url.as_deref());
        let strong = candidates
            .first()
            .is_some_and(|c| c.score >= self.cfg.strong_score);
        if !strong {
            if let Some(page_url) = url.as_deref().filter(|u| self.page_fetch_allowed(u)) {
                let extra = self.harvest_page(page_url).await;
                if !extra.is_empty() {
                    raw.extend(extra);
                    candidates = score::rank(raw, url.as_deref());
                }
            }
        }

        let base = url.as_deref().and_then(|u| url::Url::parse(u).ok());
        let inline_images = dedup_keep_order(
            inline
                .iter()
                .filter_map(|u| urls::normalize_image_url(u, base.as_ref())),
        );

        let summary_src = entry
            .summary_html
            .as_deref()
            .or(entry.description_html.as_deref())
            .or(entry.content_html.as_deref())
            .unwrap_or_default();

        tracing::debug!(
            target: "extract",
            job_id = %event.job_id(),
            candidates = candidates.len(),
            top = candidates.first().map(|c| c.url.as_str()).unwrap_or("-"),
            "extracted"
        );

        ExtractedPayload {
            url,
            feed: entry.feed_url.clone(),
            title: normalize_text(&entry.title, TITLE_MAX_CHARS),
            summary: normalize_text(summary_src, self.cfg.summary_chars),
            content_html: entry.content_html.clone(),
            description_html: entry.description_html.clone(),
            published_ts: event.published_at.timestamp(),
            enclosures: entry.enclosures.clone(),
            inline_images,
            image_candidates: candidates,
        }
    }

    fn page_fetch_allowed(&self, page_url: &str) -> bool {
        let Some(host) = crate::ingest::types::host_of(page_url) else {
            return false;
        };
        self.cfg.page_fetch_allow.iter().any(|allowed| {
            let allowed = allowed.trim().to_ascii_lowercase();
            host == allowed || host.ends_with(&format!(".{allowed}"))
        })
    }

    /// Best-effort: any failure yields no candidates.
    async fn harvest_page(&self, page_url: &str) -> Vec<RawCandidate> {
        let Some(transport) = &self.transport else {
            return Vec::new();
        };
        let body = match transport.get(page_url, None).await {
            Ok(FetchOutcome::Fresh { body, .. }) => body,
            Ok(FetchOutcome::NotModified) => return Vec::new(),
            Err(e) => {
                tracing::debug!(target: "extract", url = %page_url, error = %e, "article page fetch failed");
                return Vec::new();
            }
        };
        let mut out = harvest::harvest_html(&body);
        if let Some(amp) = harvest::amp_link(&body) {
            let amp_url = url::Url::parse(page_url)
                .ok()
                .and_then(|b| b.join(&amp).ok())
                .map(|u| u.to_string());
            if let Some(amp_url) = amp_url.filter(|a| a != page_url) {
                match transport.get(&amp_url, None).await {
                    Ok(FetchOutcome::Fresh { body, .. }) => out.extend(harvest::harvest_html(&body)),
                    Ok(FetchOutcome::NotModified) => {}
                    Err(e) => {
                        tracing::debug!(target: "extract", url = %amp_url, error = %e, "amp page fetch failed")
                    }
                }
            }
        }
        out
    }
}

fn looks_like_image(m: &MediaRef) -> bool {
    match m.mime.as_deref() {
        Some(mime) => mime.starts_with("image/"),
        None => {
            let path = m.url.split(['?', '#']).next().unwrap_or_default().to_ascii_lowercase();
            IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        }
    }
}

/// Feed-level media: enclosures, media:content/thumbnail, video stills.
fn feed_candidates(entry: &FeedEntry) -> Vec<RawCandidate> {
    let mut out = Vec::new();
    if let Some(id) = entry.video_id.as_deref().filter(|v| !v.is_empty()) {
        out.push(RawCandidate::new(
            format!("https://i.ytimg.com/vi/{id}/maxresdefault.jpg"),
            CandidateOrigin::Feed,
        ));
    }
    out.extend(
        entry
            .enclosures
            .iter()
            .filter(|m| looks_like_image(m))
            .map(|m| RawCandidate::new(m.url.clone(), CandidateOrigin::Feed)),
    );
    out.extend(
        entry
            .thumbnails
            .iter()
            .map(|m| RawCandidate::new(m.url.clone(), CandidateOrigin::Feed)),
    );
    out
}

fn dedup_keep_order(it: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    it.filter(|u| seen.insert(u.clone())).collect()
}
