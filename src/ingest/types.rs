// src/ingest/types.rs
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const YOUTUBE_FEED_BASE: &str = "https://www.youtube.com/feeds/videos.xml?channel_id=";
const MAX_JOB_ID_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Youtube,
    Rss,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Rss => "rss",
        }
    }
}

/// Classification of a story. Closed set; unknown labels are rejected at the
/// adapter/config boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryKind {
    Trailer,
    Clip,
    Interview,
    Review,
    Release,
    #[default]
    News,
}

impl StoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trailer => "trailer",
            Self::Clip => "clip",
            Self::Interview => "interview",
            Self::Review => "review",
            Self::Release => "release",
            Self::News => "news",
        }
    }
}

impl fmt::Display for StoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trailer" | "teaser" => Ok(Self::Trailer),
            "clip" | "video" => Ok(Self::Clip),
            "interview" => Ok(Self::Interview),
            "review" => Ok(Self::Review),
            "release" => Ok(Self::Release),
            "news" | "" => Ok(Self::News),
            other => Err(format!("unknown story kind '{other}'")),
        }
    }
}

/// Where a source lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceTarget {
    Youtube { channel_id: String },
    Rss { url: String, kind_hint: StoryKind },
}

/// Identity of a pollable source. Loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub target: SourceTarget,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub max_items: Option<usize>,
    /// Vertical label ("movies", "tv", "music", ...) used as a push topic.
    #[serde(default)]
    pub vertical: Option<String>,
    /// Lookback window used when a webhook nudges this source.
    #[serde(default)]
    pub webhook_window_hours: Option<i64>,
}

impl SourceSpec {
    pub fn youtube(channel_id: impl Into<String>) -> Self {
        Self {
            target: SourceTarget::Youtube {
                channel_id: channel_id.into(),
            },
            name: None,
            max_items: None,
            vertical: None,
            webhook_window_hours: None,
        }
    }

    pub fn rss(url: impl Into<String>, kind_hint: StoryKind) -> Self {
        Self {
            target: SourceTarget::Rss {
                url: url.into(),
                kind_hint,
            },
            name: None,
            max_items: None,
            vertical: None,
            webhook_window_hours: None,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self.target {
            SourceTarget::Youtube { .. } => SourceKind::Youtube,
            SourceTarget::Rss { .. } => SourceKind::Rss,
        }
    }

    /// Stable key: `youtube:<channel>`, `rss:<name>`, or for unnamed feeds
    /// `rss:<host><path>` so two feeds on one host never share a cursor.
    pub fn key(&self) -> String {
        match &self.target {
            SourceTarget::Youtube { channel_id } => format!("youtube:{channel_id}"),
            SourceTarget::Rss { url, .. } => match self.name.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => format!("rss:{}", name.to_ascii_lowercase()),
                _ => format!("rss:{}", feed_label(url)),
            },
        }
    }

    pub fn feed_url(&self) -> String {
        match &self.target {
            SourceTarget::Youtube { channel_id } => format!("{YOUTUBE_FEED_BASE}{channel_id}"),
            SourceTarget::Rss { url, .. } => url.clone(),
        }
    }

    /// Host used for throttling.
    pub fn domain(&self) -> String {
        host_of(&self.feed_url()).unwrap_or_default()
    }

    /// Kind used when the title carries no stronger signal.
    pub fn default_kind(&self) -> StoryKind {
        match &self.target {
            SourceTarget::Youtube { .. } => StoryKind::Clip,
            SourceTarget::Rss { kind_hint, .. } => *kind_hint,
        }
    }

    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            kind: self.kind(),
            key: self.key(),
        }
    }
}

pub(crate) fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Host (lowercased), path without trailing slash, and query of a feed URL.
fn feed_label(url: &str) -> String {
    let Ok(parsed) = url::Url::parse(url) else {
        return url.trim().to_string();
    };
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let mut label = format!("{host}{}", parsed.path().trim_end_matches('/'));
    if let Some(q) = parsed.query().filter(|q| !q.is_empty()) {
        label.push('?');
        label.push_str(q);
    }
    label
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: SourceKind,
    pub key: String,
}

/// Media reference found in a feed (enclosure, media:content, media:thumbnail).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Raw feed entry as parsed from the upstream document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub feed_url: String,
    #[serde(default)]
    pub link: Option<String>,
    pub title: String,
    #[serde(default)]
    pub summary_html: Option<String>,
    #[serde(default)]
    pub content_html: Option<String>,
    #[serde(default)]
    pub description_html: Option<String>,
    #[serde(default)]
    pub enclosures: Vec<MediaRef>,
    #[serde(default)]
    pub thumbnails: Vec<MediaRef>,
    #[serde(default)]
    pub video_id: Option<String>,
}

/// One entry of one source, ready for the dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterEvent {
    pub source: SourceRef,
    /// Unique within `source`.
    pub source_event_id: String,
    pub title: String,
    pub kind_hint: StoryKind,
    pub published_at: DateTime<Utc>,
    /// Topic labels carried from the source (vertical).
    #[serde(default)]
    pub labels: Vec<String>,
    pub payload: FeedEntry,
}

impl AdapterEvent {
    pub fn job_id(&self) -> JobId {
        JobId::for_event(&self.source.key, &self.source_event_id)
    }
}

/// Deterministic identity of a queued job: sanitized `source:event`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn for_event(source_key: &str, event_id: &str) -> Self {
        Self::from_raw(&format!("{source_key}:{event_id}"))
    }

    /// Sanitize an id received from outside (debug lookups).
    pub fn from_raw(raw: &str) -> Self {
        let mut out: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        out.truncate(MAX_JOB_ID_LEN);
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-source conditional-fetch validators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCursor {
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
}

impl FetchCursor {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalSignature(pub String);

impl CanonicalSignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public, immutable story record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub kind: StoryKind,
    pub title: String,
    pub summary: String,
    pub published_at: DateTime<Utc>,
    pub source: SourceRef,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub thumb_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub normalized_at: DateTime<Utc>,
}
