// src/extract/harvest.rs
//! Regex-level HTML harvesting of image references. Output is in document
//! order per origin, highest-priority origin first; normalisation and
//! scoring happen in `score::rank`.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::score::{CandidateOrigin, RawCandidate};

static RE_META: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<meta\b[^>]*>").unwrap());
static RE_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<link\b[^>]*>").unwrap());
static RE_JSONLD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<script\b[^>]*type\s*=\s*["']application/ld\+json["'][^>]*>(.*?)</script>"#)
        .unwrap()
});
static RE_IMG_LIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(?:img|amp-img|source|video)\b[^>]*>").unwrap());
static RE_BG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)background(?:-image)?\s*:\s*url\(\s*['"]?([^'")]+)['"]?\s*\)"#).unwrap()
});
static RE_ANCHOR_IMG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*href\s*=\s*["']([^"']+\.(?:jpe?g|png|webp)(?:\?[^"']*)?)["']"#)
        .unwrap()
});
static RE_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});

const META_KEYS: &[&str] = &[
    "og:image",
    "og:image:url",
    "og:image:secure_url",
    "twitter:image",
    "twitter:image:src",
    "image",
    "thumbnailurl",
];

/// Attributes that may carry an image, most specific first. Lazy loaders
/// keep the real URL in a data attribute and a placeholder in `src`.
const IMG_ATTRS: &[&str] = &[
    "data-src",
    "data-lazy-src",
    "data-original",
    "data-lazy",
    "data-hi-res-src",
    "src",
    "poster",
];
const SRCSET_ATTRS: &[&str] = &["data-srcset", "data-lazy-srcset", "srcset"];

fn attrs(tag: &str) -> HashMap<String, String> {
    RE_ATTR
        .captures_iter(tag)
        .filter_map(|c| {
            let name = c.get(1)?.as_str().to_ascii_lowercase();
            let value = c.get(2).or(c.get(3)).or(c.get(4))?.as_str().to_string();
            Some((name, value))
        })
        .collect()
}

/// Largest candidate of a srcset (`url 800w, url 2x`); last entry when no
/// descriptor parses.
pub fn best_from_srcset(srcset: &str) -> Option<String> {
    let mut best: Option<(f64, &str)> = None;
    let mut last = None;
    for part in srcset.split(',') {
        let mut it = part.split_whitespace();
        let Some(url) = it.next() else { continue };
        last = Some(url);
        let weight = it
            .next()
            .and_then(|d| d.trim_end_matches(['w', 'x', 'W', 'X']).parse::<f64>().ok())
            .unwrap_or(0.0);
        if best.map(|(w, _)| weight > w).unwrap_or(true) {
            best = Some((weight, url));
        }
    }
    best.map(|(_, u)| u).or(last).map(str::to_string)
}

pub fn meta_images(html: &str) -> Vec<RawCandidate> {
    let mut out = Vec::new();
    for m in RE_META.find_iter(html) {
        let a = attrs(m.as_str());
        let key = a
            .get("property")
            .or_else(|| a.get("name"))
            .or_else(|| a.get("itemprop"))
            .map(|k| k.to_ascii_lowercase());
        let Some(key) = key else { continue };
        if !META_KEYS.contains(&key.as_str()) {
            continue;
        }
        if let Some(content) = a.get("content").filter(|c| !c.trim().is_empty()) {
            out.push(RawCandidate::new(content.trim(), CandidateOrigin::Meta));
        }
    }
    for l in RE_LINK.find_iter(html) {
        let a = attrs(l.as_str());
        if a.get("rel").is_some_and(|r| r.eq_ignore_ascii_case("image_src")) {
            if let Some(href) = a.get("href") {
                out.push(RawCandidate::new(href.trim(), CandidateOrigin::Meta));
            }
        }
    }
    out
}

fn collect_ld_images(v: &Value, out: &mut Vec<String>) {
    match v {
        Value::Object(map) => {
            for (k, val) in map {
                let key = k.to_ascii_lowercase();
                if key == "image" || key == "thumbnailurl" {
                    collect_image_value(val, out);
                } else if matches!(val, Value::Object(_) | Value::Array(_)) {
                    collect_ld_images(val, out);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|i| collect_ld_images(i, out)),
        _ => {}
    }
}

fn collect_image_value(v: &Value, out: &mut Vec<String>) {
    match v {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|i| collect_image_value(i, out)),
        Value::Object(map) => {
            if let Some(Value::String(u)) = map.get("url").or_else(|| map.get("contentUrl")) {
                out.push(u.clone());
            }
        }
        _ => {}
    }
}

pub fn jsonld_images(html: &str) -> Vec<RawCandidate> {
    let mut urls = Vec::new();
    for c in RE_JSONLD.captures_iter(html) {
        let Some(body) = c.get(1) else { continue };
        match serde_json::from_str::<Value>(body.as_str().trim()) {
            Ok(v) => collect_ld_images(&v, &mut urls),
            Err(e) => tracing::debug!(target: "extract", error = %e, "unparsable json-ld block"),
        }
    }
    urls.into_iter()
        .map(|u| RawCandidate::new(u, CandidateOrigin::JsonLd))
        .collect()
}

/// img/amp-img/picture sources/video posters (including those inside
/// `<noscript>`), lazy-load attributes and inline background images.
pub fn inline_images(html: &str) -> Vec<RawCandidate> {
    let mut out = Vec::new();
    for tag in RE_IMG_LIKE.find_iter(html) {
        let a = attrs(tag.as_str());
        if let Some(set) = SRCSET_ATTRS.iter().find_map(|k| a.get(*k)) {
            if let Some(u) = best_from_srcset(set) {
                out.push(RawCandidate::new(u, CandidateOrigin::Inline));
            }
        }
        if let Some(u) = IMG_ATTRS
            .iter()
            .filter_map(|k| a.get(*k))
            .find(|v| !v.trim().is_empty() && !v.trim_start().starts_with("data:"))
        {
            out.push(RawCandidate::new(u.trim(), CandidateOrigin::Inline));
        }
    }
    for c in RE_BG.captures_iter(html) {
        if let Some(u) = c.get(1) {
            out.push(RawCandidate::new(u.as_str().trim(), CandidateOrigin::Inline));
        }
    }
    out
}

pub fn anchor_images(html: &str) -> Vec<RawCandidate> {
    RE_ANCHOR_IMG
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| RawCandidate::new(m.as_str(), CandidateOrigin::Anchor))
        .collect()
}

/// Every harvesting pass over one HTML document.
pub fn harvest_html(html: &str) -> Vec<RawCandidate> {
    let mut out = meta_images(html);
    out.extend(jsonld_images(html));
    out.extend(inline_images(html));
    out.extend(anchor_images(html));
    out
}

/// `<link rel="amphtml" href="...">`
pub fn amp_link(html: &str) -> Option<String> {
    RE_LINK.find_iter(html).find_map(|l| {
        let a = attrs(l.as_str());
        a.get("rel")
            .is_some_and(|r| r.eq_ignore_ascii_case("amphtml"))
            .then(|| a.get("href").cloned())
            .flatten()
    })
}
