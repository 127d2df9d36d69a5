// src/ingest/mod.rs
pub mod adapter;
pub mod fetch;
pub mod providers;
pub mod queue;
pub mod scheduler;
pub mod throttle;
pub mod types;
pub mod worker;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ingest::types::StoryKind;

static RE_SCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").unwrap());
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Strip markup and decode entities: the plain-text form of a feed field.
/// Collapses whitespace and caps the result at `max_chars`.
pub fn normalize_text(s: &str, max_chars: usize) -> String {
    // 1) Drop script/style bodies, they never carry readable text
    let out = RE_SCRIPT.replace_all(s, " ");

    // 2) HTML entity decode (double-escaped markup becomes tags here)
    let out = html_escape::decode_html_entities(&out).to_string();

    // 3) Strip HTML tags
    let out = RE_TAGS.replace_all(&out, " ");

    // 4) Normalize “ ” ‘ ’ « » to ASCII quotes
    let out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 5) Collapse whitespace (covers nbsp)
    let out = RE_WS.replace_all(&out, " ");
    let out = out.trim();

    // 6) Length cap
    if out.chars().count() > max_chars {
        let mut capped: String = out.chars().take(max_chars).collect();
        capped = capped.trim_end().to_string();
        capped.push('…');
        return capped;
    }
    out.to_string()
}

static RE_KIND_TRAILER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(trailer|teaser)s?\b").unwrap());
static RE_KIND_INTERVIEW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\binterviews?\b").unwrap());
static RE_KIND_REVIEW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\breviews?\b").unwrap());
static RE_KIND_CLIP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(clip|featurette|behind the scenes|sneak peek)\b").unwrap()
});
static RE_KIND_RELEASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(release date|premiere date|now streaming|coming to theaters|box office)\b")
        .unwrap()
});

/// Lightweight keyword classification of a title; `default` when nothing matches.
pub fn classify_kind(title: &str, default: StoryKind) -> StoryKind {
    if RE_KIND_TRAILER.is_match(title) {
        StoryKind::Trailer
    } else if RE_KIND_INTERVIEW.is_match(title) {
        StoryKind::Interview
    } else if RE_KIND_REVIEW.is_match(title) {
        StoryKind::Review
    } else if RE_KIND_CLIP.is_match(title) {
        StoryKind::Clip
    } else if RE_KIND_RELEASE.is_match(title) {
        StoryKind::Release
    } else {
        default
    }
}
