// src/extract/score.rs
use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use super::urls::{normalize_image_url, same_site};

/// Where a candidate was harvested from. Order of the variants is the
/// priority order; each maps to a base score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    /// og:image / twitter:image / itemprop=image / link rel=image_src
    Meta,
    JsonLd,
    /// enclosure, media:content, media:thumbnail, video stills
    Feed,
    /// img/srcset/picture/amp-img/noscript/lazy attrs/background-image
    Inline,
    /// `<a href="...jpg">`
    Anchor,
}

impl CandidateOrigin {
    pub fn bias(self) -> i32 {
        match self {
            Self::Meta => 100,
            Self::JsonLd => 80,
            Self::Feed => 60,
            Self::Inline => 40,
            Self::Anchor => 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCandidate {
    pub url: String,
    pub score: i32,
    pub origin: CandidateOrigin,
}

/// Un-normalised harvest output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCandidate {
    pub url: String,
    pub origin: CandidateOrigin,
}

impl RawCandidate {
    pub fn new(url: impl Into<String>, origin: CandidateOrigin) -> Self {
        Self {
            url: url.into(),
            origin,
        }
    }
}

const SAME_SITE_BONUS: i32 = 10;
const HERO_BONUS: i32 = 15;
const SMALL_PENALTY: i32 = 40;
const PLACEHOLDER_PENALTY: i32 = 200;

static RE_DIMS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(\d{2,4})x(\d{2,4})").unwrap());
static RE_WIDTH_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[?&](?:w|width|resize)=(\d{2,4})").unwrap());
static RE_HERO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(hero|featured|lead[-_]?image|key[-_]?art|poster|cover|still|maxresdefault|og[-_]image)")
        .unwrap()
});
static RE_SMALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(thumb|icon|sprite|avatar|logo|favicon|badge|emoji|button)").unwrap()
});
// `default` only as its own path token, so YouTube's hqdefault/maxresdefault survive.
static RE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(placeholder|fallback|brand[-_]?card|share[-_]?card|social[-_]?card|no[-_]?image|[/_.-]default[-_.])",
    )
    .unwrap()
});

/// Resolution hint from `WxH` in the URL or a width query param.
fn size_hint(url: &str) -> i32 {
    let from_dims = RE_DIMS
        .captures_iter(url)
        .filter_map(|c| {
            let w: u32 = c.get(1)?.as_str().parse().ok()?;
            let h: u32 = c.get(2)?.as_str().parse().ok()?;
            Some(w.max(h))
        })
        .max();
    let from_param = RE_WIDTH_PARAM
        .captures(url)
        .and_then(|c| c.get(1)?.as_str().parse::<u32>().ok());
    match from_dims.or(from_param) {
        Some(px) if px >= 1200 => 30,
        Some(px) if px >= 800 => 20,
        Some(px) if px >= 400 => 10,
        Some(px) if px < 200 => -20,
        _ => 0,
    }
}

/// Final score for an already-normalised URL.
pub fn score_url(url: &str, origin: CandidateOrigin, article_url: Option<&str>) -> i32 {
    let file_part = url.rsplit('/').next().unwrap_or(url);
    let mut score = origin.bias() + size_hint(url);
    if RE_HERO.is_match(url) {
        score += HERO_BONUS;
    }
    if RE_SMALL.is_match(file_part) {
        score -= SMALL_PENALTY;
    }
    if RE_PLACEHOLDER.is_match(url) {
        score -= PLACEHOLDER_PENALTY;
    }
    if article_url.is_some_and(|a| same_site(a, url)) {
        score += SAME_SITE_BONUS;
    }
    score
}

/// Normalise, dedupe (best score wins, first-seen position kept), then
/// stable-sort descending.
pub fn rank(raw: Vec<RawCandidate>, article_url: Option<&str>) -> Vec<ImageCandidate> {
    let base = article_url.and_then(|a| Url::parse(a).ok());
    let mut out: Vec<ImageCandidate> = Vec::new();
    let mut pos: HashMap<String, usize> = HashMap::new();

    for c in raw {
        let Some(url) = normalize_image_url(&c.url, base.as_ref()) else {
            continue;
        };
        let score = score_url(&url, c.origin, article_url);
        match pos.get(&url) {
            Some(&i) => {
                if score > out[i].score {
                    out[i].score = score;
                    out[i].origin = c.origin;
                }
            }
            None => {
                pos.insert(url.clone(), out.len());
                out.push(ImageCandidate {
                    url,
                    score,
                    origin: c.origin,
                });
            }
        }
    }
    out.sort_by(|a, b| b.score.cmp(&a.score));
    out
}
