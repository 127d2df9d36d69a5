// src/webhook/hub.rs
//! Outbound WebSub bookkeeping: subscribe/unsubscribe requests to the hub,
//! persisted subscription records, and lease renewal.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::IngestError;
use crate::ingest::types::{SourceKind, StoryKind};
use crate::store::{SubscriptionStore, WebSubSubscription};

const TOKEN_HEX_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubMode {
    Subscribe,
    Unsubscribe,
}

impl HubMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubRequest {
    pub mode: HubMode,
    pub hub: String,
    pub topic: String,
    pub callback: String,
    pub lease_seconds: u64,
    pub secret: Option<String>,
}

#[async_trait]
pub trait HubApi: Send + Sync {
    async fn send(&self, req: &HubRequest) -> Result<(), IngestError>;
}

/// Form-encoded POST to the hub; any 2xx (usually 202) counts as accepted.
pub struct HttpHub {
    client: Client,
    timeout: Duration,
}

impl HttpHub {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl HubApi for HttpHub {
    async fn send(&self, req: &HubRequest) -> Result<(), IngestError> {
        let lease = req.lease_seconds.to_string();
        let mut form = vec![
            ("hub.mode", req.mode.as_str()),
            ("hub.callback", req.callback.as_str()),
            ("hub.topic", req.topic.as_str()),
            ("hub.verify", "async"),
            ("hub.lease_seconds", lease.as_str()),
        ];
        if let Some(secret) = req.secret.as_deref() {
            form.push(("hub.secret", secret));
        }
        let rsp = self
            .client
            .post(&req.hub)
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| IngestError::fetch(&req.hub, e))?;
        rsp.error_for_status()
            .map_err(|e| IngestError::fetch(&req.hub, e))?;
        Ok(())
    }
}

/// Callback path token for a generic topic: `hex(sha256(hub ⊕ topic))[..24]`.
pub fn subscription_token(hub: &str, topic: &str) -> String {
    let mut h = Sha256::new();
    h.update(hub.as_bytes());
    h.update(b"\n");
    h.update(topic.as_bytes());
    hex::encode(h.finalize())[..TOKEN_HEX_LEN].to_string()
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                // 100.64.0.0/10 carrier-grade NAT
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// http(s) URL with a public host. Anything else is a `Validation` error.
pub fn validate_topic_url(raw: &str) -> Result<Url, IngestError> {
    let url = Url::parse(raw.trim()).map_err(|e| IngestError::Validation(format!("bad url '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(IngestError::Validation(format!("unsupported scheme '{}'", url.scheme())));
    }
    let bad_host = match url.host() {
        None => true,
        Some(url::Host::Domain(d)) => {
            let d = d.to_ascii_lowercase();
            d == "localhost" || d.ends_with(".localhost") || d.ends_with(".local") || d.ends_with(".internal")
        }
        Some(url::Host::Ipv4(ip)) => is_private_ip(IpAddr::V4(ip)),
        Some(url::Host::Ipv6(ip)) => is_private_ip(IpAddr::V6(ip)),
    };
    if bad_host {
        return Err(IngestError::Validation(format!("disallowed host in '{raw}'")));
    }
    Ok(url)
}

/// Channel id of a YouTube feed topic, if `topic` is one.
pub fn youtube_channel_of(topic: &Url) -> Option<String> {
    let host = topic.host_str()?.to_ascii_lowercase();
    if !(host == "youtube.com" || host.ends_with(".youtube.com")) {
        return None;
    }
    topic
        .query_pairs()
        .find(|(k, _)| k == "channel_id")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct HubCfg {
    pub hub_url: String,
    /// Public base URL of this service, e.g. `https://reelwire.example`.
    pub callback_base: String,
    pub lease: Duration,
    pub renew_before: Duration,
    pub secret: Option<String>,
}

impl Default for HubCfg {
    fn default() -> Self {
        Self {
            hub_url: "https://pubsubhubbub.appspot.com/subscribe".into(),
            callback_base: "http://localhost:8000".into(),
            lease: Duration::from_secs(10 * 24 * 3600),
            renew_before: Duration::from_secs(24 * 3600),
            secret: None,
        }
    }
}

pub struct SubscriptionManager {
    cfg: HubCfg,
    api: Arc<dyn HubApi>,
    store: Arc<dyn SubscriptionStore>,
}

/// What a subscribe call registered.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Subscribed {
    pub token: String,
    pub callback: String,
    pub leased_until: DateTime<Utc>,
}

impl SubscriptionManager {
    pub fn new(cfg: HubCfg, api: Arc<dyn HubApi>, store: Arc<dyn SubscriptionStore>) -> Self {
        Self { cfg, api, store }
    }

    fn callback_for(&self, token: &str, kind: SourceKind) -> String {
        let base = self.cfg.callback_base.trim_end_matches('/');
        match kind {
            SourceKind::Youtube => format!("{base}/websub/youtube"),
            SourceKind::Rss => format!("{base}/websub/feed/{token}"),
        }
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.cfg.lease).unwrap_or_else(|_| chrono::Duration::days(10))
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        hub: Option<&str>,
        kind_hint: StoryKind,
    ) -> Result<Subscribed, IngestError> {
        let topic_url = validate_topic_url(topic)?;
        let hub = match hub {
            Some(h) => validate_topic_url(h)?.to_string(),
            None => self.cfg.hub_url.clone(),
        };
        let topic = topic_url.to_string();
        let source_kind = if youtube_channel_of(&topic_url).is_some() {
            SourceKind::Youtube
        } else {
            SourceKind::Rss
        };
        let token = subscription_token(&hub, &topic);
        let callback = self.callback_for(&token, source_kind);
        let subscription = WebSubSubscription {
            hub: hub.clone(),
            topic: topic.clone(),
            source_kind,
            kind_hint,
            leased_until: self.lease_until(Utc::now()),
        };

        // Stored first so a notify racing the hub's answer finds the record.
        self.store.upsert(&token, &subscription).await?;
        let req = HubRequest {
            mode: HubMode::Subscribe,
            hub,
            topic,
            callback: callback.clone(),
            lease_seconds: self.cfg.lease.as_secs(),
            secret: self.cfg.secret.clone(),
        };
        if let Err(e) = self.api.send(&req).await {
            if let Err(cleanup) = self.store.remove(&token).await {
                tracing::warn!(target: "webhook", token = %token, error = %cleanup, "could not drop refused subscription");
            }
            return Err(e);
        }
        tracing::info!(target: "webhook", token = %token, topic = %req.topic, "subscription requested");
        Ok(Subscribed {
            token,
            callback,
            leased_until: subscription.leased_until,
        })
    }

    /// `Ok(false)` when no record existed; the hub is asked either way.
    pub async fn unsubscribe(&self, topic: &str, hub: Option<&str>) -> Result<bool, IngestError> {
        let topic_url = validate_topic_url(topic)?;
        let hub = match hub {
            Some(h) => validate_topic_url(h)?.to_string(),
            None => self.cfg.hub_url.clone(),
        };
        let topic = topic_url.to_string();
        let token = subscription_token(&hub, &topic);
        let kind = if youtube_channel_of(&topic_url).is_some() {
            SourceKind::Youtube
        } else {
            SourceKind::Rss
        };
        let req = HubRequest {
            mode: HubMode::Unsubscribe,
            hub,
            topic,
            callback: self.callback_for(&token, kind),
            lease_seconds: 0,
            secret: None,
        };
        self.api.send(&req).await?;
        let removed = self.store.remove(&token).await?;
        tracing::info!(target: "webhook", token = %token, removed, "unsubscribed");
        Ok(removed)
    }

    /// Re-subscribe every record whose lease ends within `renew_before`.
    /// Returns how many were renewed; failures are logged and retried on
    /// the next pass.
    pub async fn renew_due(&self, now: DateTime<Utc>) -> Result<usize, IngestError> {
        let horizon = now + chrono::Duration::from_std(self.cfg.renew_before).unwrap_or_else(|_| chrono::Duration::days(1));
        let mut renewed = 0;
        for (token, mut sub) in self.store.all().await? {
            if sub.leased_until > horizon {
                continue;
            }
            let req = HubRequest {
                mode: HubMode::Subscribe,
                hub: sub.hub.clone(),
                topic: sub.topic.clone(),
                callback: self.callback_for(&token, sub.source_kind),
                lease_seconds: self.cfg.lease.as_secs(),
                secret: self.cfg.secret.clone(),
            };
            match self.api.send(&req).await {
                Ok(()) => {
                    sub.leased_until = self.lease_until(now);
                    self.store.upsert(&token, &sub).await?;
                    renewed += 1;
                }
                Err(e) => tracing::warn!(target: "webhook", token = %token, error = %e, "lease renewal failed"),
            }
        }
        Ok(renewed)
    }
}

/// Periodic lease renewal until `shutdown` fires.
pub fn spawn_lease_renewal(
    manager: Arc<SubscriptionManager>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match manager.renew_due(Utc::now()).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(target: "webhook", renewed = n, "websub leases renewed"),
                        Err(e) => tracing::warn!(target: "webhook", error = %e, "lease renewal pass failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemorySubscriptionStore;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingHub {
        pub(crate) sent: Mutex<Vec<HubRequest>>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl HubApi for RecordingHub {
        async fn send(&self, req: &HubRequest) -> Result<(), IngestError> {
            self.sent.lock().unwrap().push(req.clone());
            if self.fail {
                return Err(IngestError::fetch(&req.hub, "HTTP 500"));
            }
            Ok(())
        }
    }

    fn manager(api: Arc<RecordingHub>, store: Arc<MemorySubscriptionStore>) -> SubscriptionManager {
        SubscriptionManager::new(
            HubCfg {
                callback_base: "https://rw.example/".into(),
                secret: Some("s".into()),
                ..HubCfg::default()
            },
            api,
            store,
        )
    }

    #[test]
    fn token_is_stable_and_short() {
        let a = subscription_token("https://hub.test/", "https://site.test/feed");
        assert_eq!(a.len(), 24);
        assert_eq!(a, subscription_token("https://hub.test/", "https://site.test/feed"));
        assert_ne!(a, subscription_token("https://hub.test/", "https://site.test/other"));
    }

    #[test]
    fn topic_validation() {
        assert!(validate_topic_url("https://variety.com/feed/").is_ok());
        for bad in [
            "ftp://variety.com/feed",
            "http://localhost:8080/feed",
            "http://10.1.2.3/feed",
            "http://192.168.0.1/x",
            "http://[::1]/x",
            "http://printer.local/x",
            "not a url",
        ] {
            let err = validate_topic_url(bad).unwrap_err();
            assert_eq!(err.kind(), "validation", "{bad}");
        }
    }

    #[tokio::test]
    async fn subscribe_persists_record_and_posts_to_hub() {
        let api = Arc::new(RecordingHub::default());
        let store = Arc::new(MemorySubscriptionStore::new());
        let m = manager(api.clone(), store.clone());

        let rss = m.subscribe("https://site.test/feed", None, StoryKind::Review).await.unwrap();
        assert!(rss.callback.starts_with("https://rw.example/websub/feed/"));
        let stored = store.get(&rss.token).await.unwrap().unwrap();
        assert_eq!(stored.kind_hint, StoryKind::Review);
        assert_eq!(stored.source_kind, SourceKind::Rss);

        let yt = m
            .subscribe(
                "https://www.youtube.com/xml/feeds/videos.xml?channel_id=UC1",
                None,
                StoryKind::Clip,
            )
            .await
            .unwrap();
        assert_eq!(yt.callback, "https://rw.example/websub/youtube");

        let sent = api.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].mode, HubMode::Subscribe);
        assert_eq!(sent[0].secret.as_deref(), Some("s"));
    }

    #[tokio::test]
    async fn failed_subscribe_leaves_no_record() {
        let api = Arc::new(RecordingHub {
            fail: true,
            ..RecordingHub::default()
        });
        let store = Arc::new(MemorySubscriptionStore::new());
        let m = manager(api, store.clone());
        assert!(m.subscribe("https://site.test/feed", None, StoryKind::News).await.is_err());
        assert!(store.all().await.unwrap().is_empty());
    }

    /// Memory store whose `remove` always fails.
    struct StickyStore(MemorySubscriptionStore);

    #[async_trait]
    impl SubscriptionStore for StickyStore {
        async fn upsert(&self, token: &str, subscription: &WebSubSubscription) -> Result<(), IngestError> {
            self.0.upsert(token, subscription).await
        }
        async fn get(&self, token: &str) -> Result<Option<WebSubSubscription>, IngestError> {
            self.0.get(token).await
        }
        async fn remove(&self, _token: &str) -> Result<bool, IngestError> {
            Err(IngestError::store("remove unavailable"))
        }
        async fn all(&self) -> Result<Vec<(String, WebSubSubscription)>, IngestError> {
            self.0.all().await
        }
    }

    #[tokio::test]
    async fn refused_subscribe_reports_hub_error_when_cleanup_fails() {
        let api = Arc::new(RecordingHub {
            fail: true,
            ..RecordingHub::default()
        });
        let m = SubscriptionManager::new(
            HubCfg {
                callback_base: "https://rw.example/".into(),
                ..HubCfg::default()
            },
            api,
            Arc::new(StickyStore(MemorySubscriptionStore::new())),
        );
        let err = m.subscribe("https://site.test/feed", None, StoryKind::News).await.unwrap_err();
        assert_eq!(err.kind(), "fetch");
    }

    #[tokio::test]
    async fn unsubscribe_removes_record() {
        let api = Arc::new(RecordingHub::default());
        let store = Arc::new(MemorySubscriptionStore::new());
        let m = manager(api.clone(), store.clone());
        m.subscribe("https://site.test/feed", None, StoryKind::News).await.unwrap();
        assert!(m.unsubscribe("https://site.test/feed", None).await.unwrap());
        assert!(!m.unsubscribe("https://site.test/feed", None).await.unwrap());
        assert_eq!(api.sent.lock().unwrap()[1].mode, HubMode::Unsubscribe);
    }

    #[tokio::test]
    async fn renewal_only_touches_expiring_leases() {
        let api = Arc::new(RecordingHub::default());
        let store = Arc::new(MemorySubscriptionStore::new());
        let now = Utc::now();
        let sub = |topic: &str, until: DateTime<Utc>| WebSubSubscription {
            hub: "https://hub.test/".into(),
            topic: topic.into(),
            source_kind: SourceKind::Rss,
            kind_hint: StoryKind::News,
            leased_until: until,
        };
        store.upsert("soon", &sub("https://a.test/f", now + chrono::Duration::hours(2))).await.unwrap();
        store.upsert("later", &sub("https://b.test/f", now + chrono::Duration::days(5))).await.unwrap();

        let m = manager(api.clone(), store.clone());
        assert_eq!(m.renew_due(now).await.unwrap(), 1);
        let renewed = store.get("soon").await.unwrap().unwrap();
        assert!(renewed.leased_until > now + chrono::Duration::days(9));
        assert_eq!(api.sent.lock().unwrap()[0].topic, "https://a.test/f");
    }
}
