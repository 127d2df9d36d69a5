// src/ingest/providers/rss.rs
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;

use super::{parse_feed_date, scrub_html_entities_for_xml, youtube, ParsedEntry};
use crate::error::IngestError;
use crate::ingest::types::{FeedEntry, MediaRef};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Guid>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    // dc:date
    date: Option<String>,
    description: Option<String>,
    // content:encoded
    encoded: Option<String>,
    #[serde(default)]
    enclosure: Vec<Enclosure>,
    // media:content
    #[serde(rename = "content", default)]
    media_content: Vec<MediaAttr>,
    // media:thumbnail
    #[serde(rename = "thumbnail", default)]
    media_thumbnail: Vec<MediaAttr>,
}

#[derive(Debug, Deserialize)]
struct Guid {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct Enclosure {
    #[serde(rename = "@url", default)]
    url: String,
    #[serde(rename = "@type", default)]
    mime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaAttr {
    #[serde(rename = "@url", default)]
    url: String,
    #[serde(rename = "@type", default)]
    mime: Option<String>,
    #[serde(rename = "@medium", default)]
    medium: Option<String>,
    #[serde(rename = "@width", default)]
    width: Option<u32>,
    #[serde(rename = "@height", default)]
    height: Option<u32>,
}

/// Parse an RSS 2.0 document; Atom documents are accepted too since many
/// publishers switch formats without changing the URL.
pub fn parse_feed(xml: &str, feed_url: &str) -> Result<Vec<ParsedEntry>, IngestError> {
    if looks_like_atom(xml) {
        return youtube::parse_atom(xml, feed_url);
    }
    parse_rss(xml, feed_url)
}

fn looks_like_atom(xml: &str) -> bool {
    let head: String = xml.chars().take(512).collect();
    head.contains("<feed") && !head.contains("<rss")
}

fn parse_rss(xml: &str, feed_url: &str) -> Result<Vec<ParsedEntry>, IngestError> {
    let t0 = std::time::Instant::now();
    let xml_clean = scrub_html_entities_for_xml(xml);
    let rss: Rss = from_str(&xml_clean).map_err(|e| IngestError::Parse(format!("rss: {e}")))?;

    let mut out = Vec::with_capacity(rss.channel.item.len());
    for it in rss.channel.item {
        let link = it.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty());
        let guid = it
            .guid
            .map(|g| g.value.trim().to_string())
            .filter(|g| !g.is_empty());
        let published_at = it
            .pub_date
            .as_deref()
            .or(it.date.as_deref())
            .and_then(parse_feed_date);

        let enclosures = it
            .enclosure
            .into_iter()
            .filter(|e| !e.url.is_empty())
            .map(|e| MediaRef {
                url: e.url,
                mime: e.mime,
                ..MediaRef::default()
            })
            .chain(
                it.media_content
                    .into_iter()
                    .filter(|m| !m.url.is_empty())
                    .filter(|m| {
                        m.medium.as_deref().map(|v| v == "image").unwrap_or(true)
                    })
                    .map(media_ref),
            )
            .collect();

        out.push(ParsedEntry {
            event_id: guid.or_else(|| link.clone()),
            published_at,
            entry: FeedEntry {
                feed_url: feed_url.to_string(),
                link,
                title: it.title.unwrap_or_default(),
                summary_html: it.description.clone(),
                content_html: it.encoded,
                description_html: it.description,
                enclosures,
                thumbnails: it
                    .media_thumbnail
                    .into_iter()
                    .filter(|m| !m.url.is_empty())
                    .map(media_ref)
                    .collect(),
                video_id: None,
            },
        });
    }

    let ms = t0.elapsed().as_secs_f64() * 1_000.0;
    histogram!("ingest_parse_ms").record(ms);
    counter!("ingest_events_total").increment(out.len() as u64);
    Ok(out)
}

fn media_ref(m: MediaAttr) -> MediaRef {
    MediaRef {
        url: m.url,
        mime: m.mime,
        width: m.width,
        height: m.height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/" xmlns:content="http://purl.org/rss/1.0/modules/content/">
<channel>
  <title>Variety</title>
  <link>https://variety.com</link>
  <item>
    <title>Studio Greenlights Sequel&nbsp;to Hit</title>
    <link>https://variety.com/2025/film/news/sequel-1234/</link>
    <guid isPermaLink="false">https://variety.com/?p=1234</guid>
    <pubDate>Sat, 01 Mar 2025 10:00:00 GMT</pubDate>
    <description><![CDATA[<p>The sequel is <b>happening</b>.</p>]]></description>
    <enclosure url="https://variety.com/wp-content/uploads/2025/03/hero-1200x630.jpg" type="image/jpeg" length="0"/>
    <media:thumbnail url="https://variety.com/wp-content/uploads/2025/03/hero-150x150.jpg"/>
  </item>
  <item>
    <title>No identity at all</title>
  </item>
</channel>
</rss>"#;

    #[test]
    fn parses_items_with_media() {
        let out = parse_feed(RSS, "https://variety.com/feed/").unwrap();
        assert_eq!(out.len(), 2);
        let first = &out[0];
        assert_eq!(first.event_id.as_deref(), Some("https://variety.com/?p=1234"));
        assert_eq!(first.entry.enclosures.len(), 1);
        assert_eq!(first.entry.thumbnails.len(), 1);
        assert!(first.published_at.is_some());
        assert!(first.entry.title.contains("Sequel"));
        // second item has neither guid nor link
        assert_eq!(out[1].event_id, None);
    }

    #[test]
    fn atom_documents_are_routed_to_atom_parser() {
        let atom = r#"<?xml version="1.0"?><feed xmlns="http://www.w3.org/2005/Atom">
<entry><id>tag:site,2025:1</id><title>Hello</title><link href="https://site.test/1"/>
<updated>2025-03-01T10:00:00Z</updated></entry></feed>"#;
        let out = parse_feed(atom, "https://site.test/atom").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_id.as_deref(), Some("tag:site,2025:1"));
        assert_eq!(out[0].entry.link.as_deref(), Some("https://site.test/1"));
    }
}
