// src/webhook/mod.rs
//! WebSub receiver.
//!
//! GET on a callback is the hub's verification handshake and echoes
//! `hub.challenge` unconditionally. POST is a content notification: the body
//! is authenticated (when a secret is configured), a best-effort source is
//! derived from it, and the matching source adapter run is started in the
//! background. The body itself is never trusted as content.

pub mod hub;
pub mod signature;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use serde::Deserialize;

use crate::error::IngestError;
use crate::ingest::adapter::IngestSource;
use crate::ingest::providers::youtube;
use crate::ingest::types::{SourceKind, SourceSpec, SourceTarget, StoryKind};
use crate::store::SubscriptionStore;

use self::hub::{Subscribed, SubscriptionManager};

pub const DEFAULT_WINDOW_HOURS: i64 = 6;

pub struct WebhookState {
    pub ingest: Arc<dyn IngestSource>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub manager: Arc<SubscriptionManager>,
    pub secret: Option<String>,
    /// Configured YouTube sources by channel id.
    pub youtube_sources: HashMap<String, SourceSpec>,
    /// Configured RSS sources by feed URL.
    pub rss_sources: HashMap<String, SourceSpec>,
    pub fallback_window_hours: i64,
}

impl WebhookState {
    pub fn new(
        ingest: Arc<dyn IngestSource>,
        subscriptions: Arc<dyn SubscriptionStore>,
        manager: Arc<SubscriptionManager>,
        secret: Option<String>,
        sources: &[SourceSpec],
    ) -> Self {
        let mut youtube_sources = HashMap::new();
        let mut rss_sources = HashMap::new();
        for spec in sources {
            match &spec.target {
                SourceTarget::Youtube { channel_id } => {
                    youtube_sources.insert(channel_id.clone(), spec.clone());
                }
                SourceTarget::Rss { url, .. } => {
                    rss_sources.insert(url.clone(), spec.clone());
                }
            }
        }
        Self {
            ingest,
            subscriptions,
            manager,
            secret: secret.filter(|s| !s.is_empty()),
            youtube_sources,
            rss_sources,
            fallback_window_hours: DEFAULT_WINDOW_HOURS,
        }
    }

    pub fn with_fallback_window(mut self, hours: i64) -> Self {
        self.fallback_window_hours = hours;
        self
    }

    fn authenticate(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), IngestError> {
        let Some(secret) = self.secret.as_deref() else {
            return Ok(());
        };
        signature::verify(secret, headers, body).inspect_err(|e| {
            counter!("webhook_auth_failures_total").increment(1);
            tracing::warn!(target: "webhook", error = %e, "notification rejected");
        })
    }

    fn window_hours(&self, spec: &SourceSpec, requested: Option<i64>) -> i64 {
        requested
            .filter(|h| *h > 0)
            .or(spec.webhook_window_hours)
            .unwrap_or(self.fallback_window_hours)
    }

    /// Fire-and-forget adapter run; the notification is acknowledged before
    /// the fetch happens.
    fn trigger(&self, spec: SourceSpec, window_hours: i64, route: &'static str) {
        counter!("webhook_notify_total", "route" => route).increment(1);
        let cutoff = Utc::now() - ChronoDuration::hours(window_hours.max(0));
        let ingest = self.ingest.clone();
        tokio::spawn(async move {
            match ingest.ingest(&spec, Some(cutoff)).await {
                Ok(r) => tracing::info!(
                    target: "webhook",
                    source = %r.source,
                    events = r.events,
                    enqueued = r.enqueued,
                    "webhook-triggered ingest done"
                ),
                Err(e) => tracing::warn!(target: "webhook", source = %spec.key(), error = %e, "webhook-triggered ingest failed"),
            }
        });
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.topic")]
    pub topic: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
    #[serde(rename = "hub.lease_seconds")]
    pub lease_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotifyQuery {
    /// Lookback override for this one notification.
    pub window_hours: Option<i64>,
}

/// Hub verification handshake. No auth; the challenge is the proof.
async fn verify_handler(Query(q): Query<VerifyQuery>) -> impl IntoResponse {
    match q.challenge {
        Some(challenge) => {
            tracing::info!(
                target: "webhook",
                mode = q.mode.as_deref().unwrap_or("-"),
                topic = q.topic.as_deref().unwrap_or("-"),
                lease_seconds = q.lease_seconds,
                "hub verification"
            );
            (StatusCode::OK, challenge)
        }
        None => (StatusCode::BAD_REQUEST, "missing hub.challenge".to_string()),
    }
}

async fn verify_feed_handler(Path(_token): Path<String>, q: Query<VerifyQuery>) -> impl IntoResponse {
    verify_handler(q).await
}

async fn youtube_notify(
    State(state): State<Arc<WebhookState>>,
    Query(q): Query<NotifyQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, IngestError> {
    state.authenticate(&headers, &body)?;

    let text = String::from_utf8_lossy(&body);
    let Some(channel_id) = youtube::channel_id_from_notification(&text) else {
        // Deletions and malformed bodies carry no channel; nothing to fetch.
        tracing::info!(target: "webhook", bytes = body.len(), "notification without channel id ignored");
        return Ok(StatusCode::NO_CONTENT);
    };
    let spec = state
        .youtube_sources
        .get(&channel_id)
        .cloned()
        .unwrap_or_else(|| SourceSpec::youtube(channel_id));
    let hours = state.window_hours(&spec, q.window_hours);
    state.trigger(spec, hours, "youtube");
    Ok(StatusCode::NO_CONTENT)
}

async fn feed_notify(
    State(state): State<Arc<WebhookState>>,
    Path(token): Path<String>,
    Query(q): Query<NotifyQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, IngestError> {
    state.authenticate(&headers, &body)?;

    let sub = state
        .subscriptions
        .get(&token)
        .await?
        .ok_or_else(|| IngestError::NotFound(format!("subscription {token}")))?;

    let spec = match sub.source_kind {
        SourceKind::Rss => state
            .rss_sources
            .get(&sub.topic)
            .cloned()
            .unwrap_or_else(|| SourceSpec::rss(sub.topic.clone(), sub.kind_hint)),
        SourceKind::Youtube => {
            let channel = url::Url::parse(&sub.topic)
                .ok()
                .and_then(|u| hub::youtube_channel_of(&u))
                .ok_or_else(|| IngestError::Validation(format!("topic {} has no channel", sub.topic)))?;
            state
                .youtube_sources
                .get(&channel)
                .cloned()
                .unwrap_or_else(|| SourceSpec::youtube(channel))
        }
    };
    let hours = state.window_hours(&spec, q.window_hours);
    state.trigger(spec, hours, "feed");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SubscribeBody {
    pub topic: String,
    #[serde(default)]
    pub hub: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

async fn subscribe_handler(
    State(state): State<Arc<WebhookState>>,
    Json(req): Json<SubscribeBody>,
) -> Result<(StatusCode, Json<Subscribed>), IngestError> {
    let kind = match req.kind.as_deref() {
        Some(k) => k.parse::<StoryKind>().map_err(IngestError::Validation)?,
        None => StoryKind::News,
    };
    let out = state.manager.subscribe(&req.topic, req.hub.as_deref(), kind).await?;
    Ok((StatusCode::ACCEPTED, Json(out)))
}

async fn unsubscribe_handler(
    State(state): State<Arc<WebhookState>>,
    Json(req): Json<SubscribeBody>,
) -> Result<StatusCode, IngestError> {
    if state.manager.unsubscribe(&req.topic, req.hub.as_deref()).await? {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(IngestError::NotFound(format!("subscription for {}", req.topic)))
    }
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/websub/youtube", get(verify_handler).post(youtube_notify))
        .route("/websub/feed/{token}", get(verify_feed_handler).post(feed_notify))
        .route("/websub/subscribe", post(subscribe_handler))
        .route("/websub/unsubscribe", post(unsubscribe_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::hub::tests::RecordingHub;
    use super::hub::HubCfg;
    use super::*;
    use crate::ingest::adapter::IngestReport;
    use crate::store::{MemorySubscriptionStore, WebSubSubscription};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::DateTime;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Default)]
    struct Calls(Mutex<Vec<(String, Option<DateTime<Utc>>)>>);

    #[async_trait]
    impl IngestSource for Calls {
        async fn ingest(&self, spec: &SourceSpec, cutoff: Option<DateTime<Utc>>) -> Result<IngestReport, IngestError> {
            self.0.lock().unwrap().push((spec.key(), cutoff));
            Ok(IngestReport {
                source: spec.key(),
                ..IngestReport::default()
            })
        }
    }

    impl Calls {
        fn keys(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|(k, _)| k.clone()).collect()
        }
    }

    fn state(calls: Arc<Calls>, secret: Option<&str>, subs: Arc<MemorySubscriptionStore>) -> Arc<WebhookState> {
        let manager = Arc::new(SubscriptionManager::new(
            HubCfg::default(),
            Arc::new(RecordingHub::default()),
            subs.clone(),
        ));
        let mut spec = SourceSpec::youtube("UCabc");
        spec.webhook_window_hours = Some(2);
        Arc::new(WebhookState::new(calls, subs, manager, secret.map(str::to_string), &[spec]))
    }

    async fn settle(calls: &Calls, n: usize) {
        for _ in 0..50 {
            if calls.keys().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    const BODY: &str = "<feed><entry><yt:videoId>v1</yt:videoId><yt:channelId>UCabc</yt:channelId></entry></feed>";

    #[tokio::test]
    async fn verification_echoes_challenge() {
        let app = router(state(Arc::default(), Some("s"), Arc::new(MemorySubscriptionStore::new())));
        let rsp = app
            .clone()
            .oneshot(
                Request::get("/websub/youtube?hub.mode=subscribe&hub.challenge=abc123&hub.topic=x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(rsp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"abc123");

        let rsp = app
            .oneshot(Request::get("/websub/youtube").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn signed_notification_triggers_configured_source() {
        let calls = Arc::new(Calls::default());
        let app = router(state(calls.clone(), Some("s"), Arc::new(MemorySubscriptionStore::new())));
        let sig = signature::sign_sha256("s", BODY.as_bytes()).unwrap();
        let rsp = app
            .oneshot(
                Request::post("/websub/youtube")
                    .header(signature::HEADER_SHA256, sig)
                    .body(Body::from(BODY))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::NO_CONTENT);
        settle(&calls, 1).await;

        let got = calls.0.lock().unwrap().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "youtube:UCabc");
        // per-source window of 2h
        let cutoff = got[0].1.unwrap();
        let age = Utc::now() - cutoff;
        assert!(age <= ChronoDuration::hours(2) && age > ChronoDuration::minutes(119));
    }

    #[tokio::test]
    async fn bad_signature_is_403_and_nothing_runs() {
        let calls = Arc::new(Calls::default());
        let app = router(state(calls.clone(), Some("s"), Arc::new(MemorySubscriptionStore::new())));
        let sig = signature::sign_sha256("s", b"something else").unwrap();
        let rsp = app
            .oneshot(
                Request::post("/websub/youtube")
                    .header(signature::HEADER_SHA256, sig)
                    .body(Body::from(BODY))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(calls.keys().is_empty());
    }

    #[tokio::test]
    async fn without_secret_bodies_are_accepted_unsigned() {
        let calls = Arc::new(Calls::default());
        let app = router(state(calls.clone(), None, Arc::new(MemorySubscriptionStore::new())));
        let rsp = app
            .oneshot(
                Request::post("/websub/youtube?window_hours=12")
                    .body(Body::from(BODY))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::NO_CONTENT);
        settle(&calls, 1).await;
        let cutoff = calls.0.lock().unwrap()[0].1.unwrap();
        assert!(Utc::now() - cutoff > ChronoDuration::hours(11));
    }

    #[tokio::test]
    async fn feed_notification_resolves_token() {
        let calls = Arc::new(Calls::default());
        let subs = Arc::new(MemorySubscriptionStore::new());
        subs.upsert(
            "tok1",
            &WebSubSubscription {
                hub: "https://hub.test/".into(),
                topic: "https://site.test/feed".into(),
                source_kind: SourceKind::Rss,
                kind_hint: StoryKind::Review,
                leased_until: Utc::now() + ChronoDuration::days(1),
            },
        )
        .await
        .unwrap();
        let app = router(state(calls.clone(), None, subs));

        let rsp = app
            .clone()
            .oneshot(Request::post("/websub/feed/tok1").body(Body::from("<rss/>")).unwrap())
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::NO_CONTENT);
        settle(&calls, 1).await;
        assert_eq!(calls.keys(), vec!["rss:site.test/feed".to_string()]);

        let rsp = app
            .oneshot(Request::post("/websub/feed/nope").body(Body::from("<rss/>")).unwrap())
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn subscribe_route_validates_topic() {
        let app = router(state(Arc::default(), None, Arc::new(MemorySubscriptionStore::new())));
        let rsp = app
            .clone()
            .oneshot(
                Request::post("/websub/subscribe")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"topic":"http://127.0.0.1/feed"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);

        let rsp = app
            .oneshot(
                Request::post("/websub/subscribe")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"topic":"https://site.test/feed","kind":"review"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::ACCEPTED);
    }
}
