// tests/webhook_http.rs
//
// WebSub receiver through the full router, without opening sockets.
//
// Covered:
// - GET verify echoes hub.challenge
// - POST with a tampered signature → 403, no fetch
// - POST with a valid signature → 204, exactly one adapter run

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serial_test::serial;
use tower::ServiceExt as _;

use reelwire::config::ENV_WEBSUB_SECRET;
use reelwire::ingest::fetch::FixtureTransport;
use reelwire::notify::LogPushSender;
use reelwire::webhook::hub::{HubApi, HubRequest};
use reelwire::webhook::signature::{sign_sha1, sign_sha256, HEADER_SHA1, HEADER_SHA256};
use reelwire::{AppConfig, IngestError, Services, Stores};

const SECRET: &str = "hub-shared-secret";
const YT_URL: &str = "https://www.youtube.com/feeds/videos.xml?channel_id=UCwebhook";
const NOTIFY: &str = r#"<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns="http://www.w3.org/2005/Atom">
 <entry>
  <id>yt:video:abc</id>
  <yt:videoId>abc</yt:videoId>
  <yt:channelId>UCwebhook</yt:channelId>
  <title>New upload</title>
 </entry>
</feed>"#;

struct NoHub;

#[async_trait]
impl HubApi for NoHub {
    async fn send(&self, _req: &HubRequest) -> Result<(), IngestError> {
        Ok(())
    }
}

fn app(secret: Option<&str>) -> (Router, Arc<FixtureTransport>) {
    let mut cfg: AppConfig = toml::from_str("[[youtube]]\nchannel_id = \"UCwebhook\"\n").unwrap();
    cfg.websub.secret = secret.map(str::to_string);
    let transport = Arc::new(FixtureTransport::new().with_doc(YT_URL, "<feed></feed>"));
    let stores = Stores::memory(&cfg);
    let svc = Services::assemble(cfg, stores, transport.clone(), Arc::new(NoHub), Arc::new(LogPushSender))
        .expect("assemble");
    (svc.router(), transport)
}

async fn wait_for_calls(t: &FixtureTransport, n: usize) {
    for _ in 0..100 {
        if t.calls(YT_URL) >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn verify_handshake_echoes_challenge() {
    let (app, _) = app(Some(SECRET));
    let req = Request::get("/websub/youtube?hub.mode=subscribe&hub.topic=x&hub.challenge=c-42&hub.lease_seconds=864000")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), 1024).await.unwrap();
    assert_eq!(&bytes[..], b"c-42");
}

#[tokio::test]
async fn tampered_body_is_rejected_with_403() {
    let (app, transport) = app(Some(SECRET));
    let sig = sign_sha256(SECRET, NOTIFY.as_bytes()).unwrap();
    let tampered = NOTIFY.replace("New upload", "Other upload");
    let req = Request::post("/websub/youtube")
        .header(HEADER_SHA256, sig)
        .body(Body::from(tampered))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.calls(YT_URL), 0);
}

#[tokio::test]
async fn missing_signature_is_rejected_when_secret_configured() {
    let (app, _) = app(Some(SECRET));
    let resp = app
        .oneshot(Request::post("/websub/youtube").body(Body::from(NOTIFY)).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn valid_signature_triggers_exactly_one_fetch() {
    let (app, transport) = app(Some(SECRET));
    let req = Request::post("/websub/youtube")
        .header(HEADER_SHA256, sign_sha256(SECRET, NOTIFY.as_bytes()).unwrap())
        .body(Body::from(NOTIFY))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    wait_for_calls(&transport, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.calls(YT_URL), 1);
}

#[tokio::test]
async fn legacy_sha1_header_is_honoured() {
    let (app, transport) = app(Some(SECRET));
    let req = Request::post("/websub/youtube")
        .header(HEADER_SHA1, sign_sha1(SECRET, NOTIFY.as_bytes()).unwrap())
        .body(Body::from(NOTIFY))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    wait_for_calls(&transport, 1).await;
    assert_eq!(transport.calls(YT_URL), 1);
}

#[tokio::test]
async fn unsigned_notifications_pass_without_secret() {
    let (app, transport) = app(None);
    let resp = app
        .oneshot(Request::post("/websub/youtube").body(Body::from(NOTIFY)).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    wait_for_calls(&transport, 1).await;
    assert_eq!(transport.calls(YT_URL), 1);
}

#[serial]
#[tokio::test]
async fn secret_from_environment_wins_over_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("reelwire.toml");
    std::fs::write(&path, "[websub]\nsecret = \"file-secret\"\n").unwrap();

    std::env::set_var(ENV_WEBSUB_SECRET, SECRET);
    let cfg = AppConfig::load_from(&path).unwrap();
    std::env::remove_var(ENV_WEBSUB_SECRET);

    assert_eq!(cfg.websub.secret.as_deref(), Some(SECRET));
}
