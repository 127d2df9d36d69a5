// tests/metrics.rs
//
// The Prometheus recorder is process-global, so this file installs it once
// and keeps every assertion in a single test.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use reelwire::ingest::fetch::FixtureTransport;
use reelwire::metrics::Metrics;
use reelwire::notify::LogPushSender;
use reelwire::webhook::hub::{HubApi, HubRequest};
use reelwire::{AppConfig, IngestError, Services, Stores};

struct NoHub;

#[async_trait]
impl HubApi for NoHub {
    async fn send(&self, _req: &HubRequest) -> Result<(), IngestError> {
        Ok(())
    }
}

#[tokio::test]
async fn metrics_endpoint_exposes_pipeline_series() {
    let metrics = Metrics::init().expect("install recorder");
    assert!(Metrics::init().is_err(), "second recorder must be refused");

    let cfg = AppConfig::default();
    let stores = Stores::memory(&cfg);
    let svc = Services::assemble(
        cfg,
        stores,
        Arc::new(FixtureTransport::new()),
        Arc::new(NoHub),
        Arc::new(LogPushSender),
    )
    .unwrap();
    let app = svc.router().merge(metrics.router());

    // One unsigned notification (no secret configured) bumps webhook_notify_total.
    let resp = app
        .clone()
        .oneshot(
            Request::post("/websub/youtube")
                .body(Body::from("<yt:channelId>UCm</yt:channelId>"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("webhook_notify_total"), "got:\n{text}");
}
