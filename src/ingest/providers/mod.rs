// src/ingest/providers/mod.rs
//! Feed document parsers. Each returns `ParsedEntry` values in document order;
//! identity, freshness and caps are applied by the adapter.

pub mod rss;
pub mod youtube;

use chrono::{DateTime, Utc};

use crate::ingest::types::FeedEntry;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    /// Stable per-source identifier (video id, guid, link). `None` drops the entry.
    pub event_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub entry: FeedEntry,
}

/// RFC 3339 (Atom) first, then RFC 2822 (RSS).
pub(crate) fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// HTML entities that show up in feeds but are not defined in XML.
pub(crate) fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", "&#160;")
        .replace("&ndash;", "&#8211;")
        .replace("&mdash;", "&#8212;")
        .replace("&ldquo;", "&#8220;")
        .replace("&rdquo;", "&#8221;")
        .replace("&lsquo;", "&#8216;")
        .replace("&rsquo;", "&#8217;")
        .replace("&hellip;", "&#8230;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates_parse_in_both_formats() {
        let a = parse_feed_date("2025-03-01T10:00:00+00:00").unwrap();
        let b = parse_feed_date("Sat, 01 Mar 2025 10:00:00 GMT").unwrap();
        assert_eq!(a, b);
        assert!(parse_feed_date("yesterday").is_none());
    }
}
