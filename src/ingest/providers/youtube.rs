// src/ingest/providers/youtube.rs
//! YouTube channel feeds (Atom + `yt:` / `media:` extensions). The same Atom
//! shape also backs generic Atom publishers via [`parse_atom`].

use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use quick_xml::de::from_str;
use regex::Regex;
use serde::Deserialize;

use super::{parse_feed_date, scrub_html_entities_for_xml, ParsedEntry};
use crate::error::IngestError;
use crate::ingest::types::{FeedEntry, MediaRef};

const VIDEO_ID_PREFIX: &str = "yt:video:";

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "videoId", default)]
    video_id: Option<String>,
    #[serde(default)]
    title: Option<AtomText>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    #[serde(default)]
    published: Option<String>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    summary: Option<AtomText>,
    #[serde(default)]
    content: Option<AtomText>,
    #[serde(default)]
    group: Option<MediaGroup>,
}

#[derive(Debug, Deserialize)]
struct AtomText {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@rel", default)]
    rel: Option<String>,
    #[serde(rename = "@type", default)]
    mime: Option<String>,
    #[serde(rename = "@href", default)]
    href: String,
}

#[derive(Debug, Deserialize)]
struct MediaGroup {
    #[serde(default)]
    description: Option<AtomText>,
    #[serde(rename = "thumbnail", default)]
    thumbnails: Vec<MediaThumb>,
}

#[derive(Debug, Deserialize)]
struct MediaThumb {
    #[serde(rename = "@url", default)]
    url: String,
    #[serde(rename = "@width", default)]
    width: Option<u32>,
    #[serde(rename = "@height", default)]
    height: Option<u32>,
}

/// Parse a YouTube channel feed. Event id is the video id.
pub fn parse_youtube(xml: &str, feed_url: &str) -> Result<Vec<ParsedEntry>, IngestError> {
    let t0 = std::time::Instant::now();
    let feed = parse_document(xml)?;

    let out: Vec<ParsedEntry> = feed
        .entries
        .into_iter()
        .map(|e| {
            let video_id = e
                .video_id
                .clone()
                .filter(|v| !v.trim().is_empty())
                .or_else(|| e.id.as_deref().and_then(|id| id.strip_prefix(VIDEO_ID_PREFIX)).map(str::to_string));
            let mut parsed = into_parsed(e, feed_url);
            if let Some(id) = video_id.as_deref() {
                if parsed.entry.link.is_none() {
                    parsed.entry.link = Some(format!("https://www.youtube.com/watch?v={id}"));
                }
            }
            parsed.event_id = video_id.clone();
            parsed.entry.video_id = video_id;
            parsed
        })
        .collect();

    record_parse(t0, out.len());
    Ok(out)
}

/// Parse a generic Atom feed. Event id is `<id>`, falling back to the alternate link.
pub fn parse_atom(xml: &str, feed_url: &str) -> Result<Vec<ParsedEntry>, IngestError> {
    let t0 = std::time::Instant::now();
    let feed = parse_document(xml)?;
    let out: Vec<ParsedEntry> = feed
        .entries
        .into_iter()
        .map(|e| {
            let id = e.id.clone().filter(|v| !v.trim().is_empty());
            let mut parsed = into_parsed(e, feed_url);
            parsed.event_id = id.or_else(|| parsed.entry.link.clone());
            parsed
        })
        .collect();
    record_parse(t0, out.len());
    Ok(out)
}

fn parse_document(xml: &str) -> Result<AtomFeed, IngestError> {
    let clean = scrub_html_entities_for_xml(xml);
    from_str(&clean).map_err(|e| IngestError::Parse(format!("atom: {e}")))
}

fn into_parsed(e: AtomEntry, feed_url: &str) -> ParsedEntry {
    let published_at = e
        .published
        .as_deref()
        .or(e.updated.as_deref())
        .and_then(parse_feed_date);

    let link = e
        .links
        .iter()
        .find(|l| l.rel.as_deref().unwrap_or("alternate") == "alternate" && !l.href.is_empty())
        .map(|l| l.href.clone());

    let enclosures = e
        .links
        .iter()
        .filter(|l| l.rel.as_deref() == Some("enclosure") && !l.href.is_empty())
        .map(|l| MediaRef {
            url: l.href.clone(),
            mime: l.mime.clone(),
            ..MediaRef::default()
        })
        .collect();

    let (description_html, thumbnails) = match e.group {
        Some(g) => (
            g.description.map(|d| d.value),
            g.thumbnails
                .into_iter()
                .filter(|t| !t.url.is_empty())
                .map(|t| MediaRef {
                    url: t.url,
                    mime: None,
                    width: t.width,
                    height: t.height,
                })
                .collect(),
        ),
        None => (None, Vec::new()),
    };

    ParsedEntry {
        event_id: None,
        published_at,
        entry: FeedEntry {
            feed_url: feed_url.to_string(),
            link,
            title: e.title.map(|t| t.value).unwrap_or_default(),
            summary_html: e.summary.map(|s| s.value),
            content_html: e.content.map(|c| c.value),
            description_html,
            enclosures,
            thumbnails,
            video_id: None,
        },
    }
}

fn record_parse(t0: std::time::Instant, n: usize) {
    let ms = t0.elapsed().as_secs_f64() * 1_000.0;
    histogram!("ingest_parse_ms").record(ms);
    counter!("ingest_events_total").increment(n as u64);
}

static RE_CHANNEL_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<yt:channelId>\s*([A-Za-z0-9_-]+)\s*</yt:channelId>").unwrap());
static RE_TOPIC_CHANNEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"channel_id=([A-Za-z0-9_-]+)").unwrap());

/// Best-effort channel id from a WebSub notification body.
pub fn channel_id_from_notification(body: &str) -> Option<String> {
    RE_CHANNEL_ID
        .captures(body)
        .or_else(|| RE_TOPIC_CHANNEL.captures(body))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
