// src/extract/urls.rs
//! Image URL normalisation: absolute + https, tracking params stripped, CDN
//! proxy wrappers unwrapped, junk hosts and pixel patterns rejected.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "mc_cid", "mc_eid", "igshid", "_ga", "cmpid", "ito",
    "ref", "ref_src", "src_trk",
];

/// Hosts that never serve an editorial image (ads, analytics, avatars).
const BAD_HOSTS: &[&str] = &[
    "doubleclick.net",
    "googlesyndication.com",
    "google-analytics.com",
    "googletagmanager.com",
    "scorecardresearch.com",
    "pixel.wp.com",
    "stats.wp.com",
    "gravatar.com",
    "feeds.feedburner.com",
    "pixel.quantserve.com",
    "sb.scorecardresearch.com",
];

const WP_PHOTON_HOSTS: &[&str] = &["i0.wp.com", "i1.wp.com", "i2.wp.com", "i3.wp.com"];
const WESERV_HOSTS: &[&str] = &["images.weserv.nl", "wsrv.nl"];

static RE_PIXEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(spacer|blank|transparent|pixel|1x1|tracking)\.(gif|png)$|/1x1[/.]|/spacer[/.]")
        .unwrap()
});

/// Normalise a harvested image reference. `base` is the article (or feed)
/// URL used for relative references. `None` means "reject".
pub fn normalize_image_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let decoded = html_escape::decode_html_entities(raw.trim()).to_string();
    let raw = decoded.trim();
    if raw.is_empty() {
        return None;
    }
    let lower = raw.to_ascii_lowercase();
    if ["data:", "javascript:", "about:", "blob:", "mailto:"]
        .iter()
        .any(|p| lower.starts_with(p))
    {
        return None;
    }

    let mut url = resolve(raw, base)?;
    for _ in 0..3 {
        match unwrap_proxy(&url) {
            Some(inner) => url = inner,
            None => break,
        }
    }
    if url.scheme() == "http" {
        // set_scheme only fails for special/non-special switches; http→https is fine
        url.set_scheme("https").ok()?;
    }
    if url.scheme() != "https" {
        return None;
    }
    strip_tracking(&mut url);
    url.set_fragment(None);

    if is_rejected(&url) {
        return None;
    }
    Some(url.to_string())
}

fn resolve(raw: &str, base: Option<&Url>) -> Option<Url> {
    if let Some(rest) = raw.strip_prefix("//") {
        return Url::parse(&format!("https://{rest}")).ok();
    }
    match Url::parse(raw) {
        Ok(u) => Some(u),
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(raw).ok(),
        Err(_) => None,
    }
}

fn parse_loose(inner: &str) -> Option<Url> {
    let inner = inner.trim();
    if inner.starts_with("http://") || inner.starts_with("https://") {
        Url::parse(inner).ok()
    } else if let Some(rest) = inner.strip_prefix("//") {
        Url::parse(&format!("https://{rest}")).ok()
    } else {
        Url::parse(&format!("https://{inner}")).ok()
    }
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// One level of proxy indirection, if `url` is a known image proxy.
fn unwrap_proxy(url: &Url) -> Option<Url> {
    let host = url.host_str()?.to_ascii_lowercase();
    let path = url.path();

    // Jetpack/Photon: https://i0.wp.com/example.com/path.jpg?resize=...
    if WP_PHOTON_HOSTS.contains(&host.as_str()) {
        return parse_loose(path.trim_start_matches('/'));
    }
    if WESERV_HOSTS.contains(&host.as_str()) {
        return query_value(url, "url").and_then(|v| parse_loose(&v));
    }
    // Next.js image optimiser: /_next/image?url=%2Fuploads%2Fx.jpg&w=1200
    if path.ends_with("/_next/image") {
        let inner = query_value(url, "url")?;
        return if inner.starts_with('/') && !inner.starts_with("//") {
            url.join(&inner).ok()
        } else {
            parse_loose(&inner)
        };
    }
    // AMP cache: https://example-com.cdn.ampproject.org/i/s/example.com/x.jpg
    if host.ends_with("cdn.ampproject.org") {
        let rest = path
            .strip_prefix("/i/s/")
            .or_else(|| path.strip_prefix("/i/"))?;
        return parse_loose(rest);
    }
    None
}

fn strip_tracking(url: &mut Url) {
    if url.query().is_none() {
        return;
    }
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
}

fn host_matches(host: &str, pattern: &str) -> bool {
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

fn is_rejected(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return true;
    };
    let host = host.to_ascii_lowercase();
    if BAD_HOSTS.iter().any(|h| host_matches(&host, h)) {
        return true;
    }
    // Facebook conversion pixel
    if host_matches(&host, "facebook.com") && url.path().starts_with("/tr") {
        return true;
    }
    RE_PIXEL.is_match(url.path())
}

/// True when both URLs share a host, or the same registrable-ish suffix
/// (last two labels).
pub fn same_site(a: &str, b: &str) -> bool {
    fn site(host: &str) -> String {
        let labels: Vec<&str> = host.rsplitn(3, '.').collect();
        match labels.as_slice() {
            [tld, sld, ..] => format!("{sld}.{tld}"),
            _ => host.to_string(),
        }
    }
    let (Ok(a), Ok(b)) = (Url::parse(a), Url::parse(b)) else {
        return false;
    };
    match (a.host_str(), b.host_str()) {
        (Some(x), Some(y)) => {
            let (x, y) = (x.to_ascii_lowercase(), y.to_ascii_lowercase());
            x == y || site(&x) == site(&y)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://www.variety.com/2025/film/news/story-1234/").unwrap()
    }

    #[test]
    fn resolves_relative_and_forces_https() {
        assert_eq!(
            normalize_image_url("/wp-content/uploads/hero.jpg", Some(&base())).as_deref(),
            Some("https://www.variety.com/wp-content/uploads/hero.jpg")
        );
        assert_eq!(
            normalize_image_url("//cdn.site.test/a.jpg", None).as_deref(),
            Some("https://cdn.site.test/a.jpg")
        );
        assert_eq!(normalize_image_url("relative.jpg", None), None);
    }

    #[test]
    fn strips_tracking_params_and_fragment() {
        let out = normalize_image_url(
            "https://cdn.site.test/a.jpg?utm_source=x&amp;w=1200&fbclid=abc#frag",
            None,
        );
        assert_eq!(out.as_deref(), Some("https://cdn.site.test/a.jpg?w=1200"));
        let out = normalize_image_url("https://cdn.site.test/a.jpg?utm_medium=rss", None);
        assert_eq!(out.as_deref(), Some("https://cdn.site.test/a.jpg"));
    }

    #[test]
    fn unwraps_known_proxies() {
        assert_eq!(
            normalize_image_url("https://i0.wp.com/deadline.com/wp-content/x.jpg?resize=300", None)
                .as_deref(),
            Some("https://deadline.com/wp-content/x.jpg")
        );
        assert_eq!(
            normalize_image_url(
                "https://www.site.test/_next/image?url=%2Fuploads%2Fposter.jpg&w=1920&q=75",
                None
            )
            .as_deref(),
            Some("https://www.site.test/uploads/poster.jpg")
        );
        assert_eq!(
            normalize_image_url("https://wsrv.nl/?url=img.site.test/p.png&w=800", None).as_deref(),
            Some("https://img.site.test/p.png")
        );
        assert_eq!(
            normalize_image_url(
                "https://www-site-test.cdn.ampproject.org/i/s/www.site.test/img/a.jpg",
                None
            )
            .as_deref(),
            Some("https://www.site.test/img/a.jpg")
        );
    }

    #[test]
    fn rejects_junk() {
        assert_eq!(normalize_image_url("data:image/gif;base64,R0lGOD", None), None);
        assert_eq!(normalize_image_url("https://pixel.wp.com/g.gif?v=1", None), None);
        assert_eq!(normalize_image_url("https://secure.gravatar.com/avatar/x", None), None);
        assert_eq!(normalize_image_url("https://www.facebook.com/tr?id=1", None), None);
        assert_eq!(normalize_image_url("https://site.test/img/spacer.gif", None), None);
        assert_eq!(normalize_image_url("ftp://site.test/a.jpg", None), None);
    }

    #[test]
    fn same_site_compares_suffix() {
        assert!(same_site("https://variety.com/a", "https://cdn.variety.com/b.jpg"));
        assert!(!same_site("https://variety.com/a", "https://deadline.com/b.jpg"));
    }
}
