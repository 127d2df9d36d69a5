// src/ingest/fetch.rs
//! HTTP seam used by the source adapter (feeds) and the extractor (article pages).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;

use crate::error::IngestError;
use crate::ingest::types::FetchCursor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Upstream confirmed our validators; nothing to do.
    NotModified,
    Fresh {
        body: String,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url`, sending the cursor's validators as conditional headers.
    async fn get(&self, url: &str, validators: Option<&FetchCursor>) -> Result<FetchOutcome, IngestError>;
}

/// reqwest-backed transport with connect/read timeouts and a body cap.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    max_body: usize,
}

impl HttpTransport {
    pub fn new(timeout: Duration, user_agent: &str, max_body: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            client,
            max_body: max_body.max(1),
        })
    }
}

/// Accumulates a response body, refusing to grow past `limit` bytes.
#[derive(Debug)]
pub(crate) struct CappedBody {
    buf: Vec<u8>,
    limit: usize,
}

impl CappedBody {
    /// Fails up front when the declared length already exceeds the cap.
    pub(crate) fn new(url: &str, limit: usize, declared: Option<u64>) -> Result<Self, IngestError> {
        if let Some(len) = declared {
            if len > limit as u64 {
                return Err(IngestError::fetch(url, format!("body of {len} bytes exceeds {limit}")));
            }
        }
        let hint = declared.map_or(0, |l| l as usize).min(limit);
        Ok(Self {
            buf: Vec::with_capacity(hint),
            limit,
        })
    }

    pub(crate) fn push(&mut self, url: &str, chunk: &[u8]) -> Result<(), IngestError> {
        if self.buf.len() + chunk.len() > self.limit {
            return Err(IngestError::fetch(url, format!("body exceeds {} bytes", self.limit)));
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    pub(crate) fn into_text(self) -> String {
        match String::from_utf8(self.buf) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, validators: Option<&FetchCursor>) -> Result<FetchOutcome, IngestError> {
        let mut req = self.client.get(url);
        if let Some(cursor) = validators {
            if let Some(etag) = cursor.etag.as_deref() {
                req = req.header(IF_NONE_MATCH, etag);
            }
            if let Some(modified) = cursor.last_modified.as_deref() {
                req = req.header(IF_MODIFIED_SINCE, modified);
            }
        }

        let mut resp = req.send().await.map_err(|e| IngestError::fetch(url, e))?;
        let status = resp.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(IngestError::fetch(url, format!("HTTP {status}")));
        }

        let header = |name| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);
        let mut body = CappedBody::new(url, self.max_body, resp.content_length())?;
        while let Some(chunk) = resp.chunk().await.map_err(|e| IngestError::fetch(url, e))? {
            body.push(url, &chunk)?;
        }
        let body = body.into_text();

        Ok(FetchOutcome::Fresh {
            body,
            etag,
            last_modified,
        })
    }
}

/// In-process transport serving canned documents. Honors `If-None-Match` and
/// `If-Modified-Since` the way an origin would. Unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct FixtureTransport {
    docs: Mutex<HashMap<String, FixtureDoc>>,
    calls: Mutex<HashMap<String, usize>>,
}

#[derive(Debug, Clone, Default)]
struct FixtureDoc {
    body: String,
    etag: Option<String>,
    last_modified: Option<String>,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_doc(self, url: &str, body: impl Into<String>) -> Self {
        self.set_doc(url, body, None);
        self
    }

    pub fn with_etag_doc(self, url: &str, body: impl Into<String>, etag: &str) -> Self {
        self.set_doc(url, body, Some(etag));
        self
    }

    /// Replace (or add) the document served for `url`.
    pub fn set_doc(&self, url: &str, body: impl Into<String>, etag: Option<&str>) {
        let doc = FixtureDoc {
            body: body.into(),
            etag: etag.map(str::to_string),
            last_modified: None,
        };
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), doc);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for FixtureTransport {
    async fn get(&self, url: &str, validators: Option<&FetchCursor>) -> Result<FetchOutcome, IngestError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_default() += 1;

        let doc = self
            .docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .ok_or_else(|| IngestError::fetch(url, "HTTP 404 Not Found"))?;

        if let Some(cursor) = validators {
            let etag_match = doc.etag.is_some() && cursor.etag == doc.etag;
            let modified_match = doc.last_modified.is_some() && cursor.last_modified == doc.last_modified;
            if etag_match || modified_match {
                return Ok(FetchOutcome::NotModified);
            }
        }

        Ok(FetchOutcome::Fresh {
            body: doc.body,
            etag: doc.etag,
            last_modified: doc.last_modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixture_honors_etag() {
        let t = FixtureTransport::new().with_etag_doc("https://f.test/rss", "<rss/>", "\"v1\"");
        let first = t.get("https://f.test/rss", None).await.unwrap();
        assert!(matches!(first, FetchOutcome::Fresh { ref etag, .. } if etag.as_deref() == Some("\"v1\"")));

        let cursor = FetchCursor {
            etag: Some("\"v1\"".into()),
            last_modified: None,
        };
        let second = t.get("https://f.test/rss", Some(&cursor)).await.unwrap();
        assert_eq!(second, FetchOutcome::NotModified);
        assert_eq!(t.calls("https://f.test/rss"), 2);
    }

    #[test]
    fn capped_body_refuses_declared_oversize() {
        let err = CappedBody::new("https://f.test/big", 10, Some(11)).unwrap_err();
        assert_eq!(err.kind(), "fetch");
        assert!(CappedBody::new("https://f.test/ok", 10, Some(10)).is_ok());
    }

    #[test]
    fn capped_body_stops_when_stream_outgrows_cap() {
        let url = "https://f.test/chunked";
        let mut body = CappedBody::new(url, 8, None).unwrap();
        body.push(url, b"<rss>").unwrap();
        let err = body.push(url, b"</rss>").unwrap_err();
        assert_eq!(err.kind(), "fetch");

        let mut body = CappedBody::new(url, 8, None).unwrap();
        body.push(url, b"<rss/>").unwrap();
        assert_eq!(body.into_text(), "<rss/>");
    }

    #[tokio::test]
    async fn fixture_unknown_url_is_fetch_error() {
        let t = FixtureTransport::new();
        let err = t.get("https://missing.test/", None).await.unwrap_err();
        assert_eq!(err.kind(), "fetch");
    }
}
