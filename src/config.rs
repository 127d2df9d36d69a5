// src/config.rs
//! Runtime configuration: one TOML (or JSON) document plus a few secrets
//! from the environment.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::error::IngestError;
use crate::extract::ExtractCfg;
use crate::ingest::queue::QueueCfg;
use crate::ingest::scheduler::SchedulerCfg;
use crate::ingest::types::{SourceSpec, StoryKind};
use crate::notify::FanoutCfg;
use crate::realtime::RealtimeCfg;
use crate::webhook::hub::{validate_topic_url, HubCfg};

pub const ENV_CONFIG_PATH: &str = "REELWIRE_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/reelwire.toml";
pub const ENV_WEBSUB_SECRET: &str = "WEBSUB_SECRET";
pub const ENV_REDIS_URL: &str = "REDIS_URL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ingest: IngestSection,
    pub youtube: Vec<YoutubeSource>,
    pub rss: Vec<RssSource>,
    pub scheduler: SchedulerSection,
    /// Domain → minimum seconds between requests; `default` covers the rest.
    pub throttle: HashMap<String, f64>,
    pub feed: FeedSection,
    pub queue: QueueSection,
    pub cursor: CursorSection,
    pub extract: ExtractSection,
    pub websub: WebSubSection,
    pub push: PushSection,
    pub realtime: RealtimeSection,
    pub http: HttpSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub youtube_enabled: bool,
    pub rss_enabled: bool,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            youtube_enabled: true,
            rss_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct YoutubeSource {
    pub channel_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub vertical: Option<String>,
    #[serde(default)]
    pub webhook_window_hours: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RssSource {
    pub url: String,
    /// Kind hint for entries whose title carries no stronger signal.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub vertical: Option<String>,
    #[serde(default)]
    pub webhook_window_hours: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub poll_every_minutes: u64,
    pub jitter_seconds: u64,
    pub spread_seconds: f64,
    pub published_after_hours: i64,
    pub max_youtube_per_run: Option<usize>,
    pub max_rss_per_run: Option<usize>,
    pub idle_sleep_seconds: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_every_minutes: 10,
            jitter_seconds: 30,
            spread_seconds: 0.5,
            published_after_hours: 24,
            max_youtube_per_run: None,
            max_rss_per_run: None,
            idle_sleep_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSection {
    pub max_len: usize,
    pub signature_ttl_hours: u64,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            max_len: 500,
            signature_ttl_hours: 72,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub job_ttl_seconds: u64,
    pub result_ttl_seconds: u64,
    pub workers: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            job_ttl_seconds: 900,
            result_ttl_seconds: 300,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CursorSection {
    pub ttl_hours: u64,
}

impl Default for CursorSection {
    fn default() -> Self {
        Self { ttl_hours: 24 * 7 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractSection {
    pub page_fetch_allow: Vec<String>,
    pub strong_score: i32,
    pub summary_chars: usize,
}

impl Default for ExtractSection {
    fn default() -> Self {
        let d = ExtractCfg::default();
        Self {
            page_fetch_allow: d.page_fetch_allow,
            strong_score: d.strong_score,
            summary_chars: d.summary_chars,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSubSection {
    pub secret: Option<String>,
    pub hub_url: String,
    pub callback_base: String,
    pub lease_seconds: u64,
    pub renew_before_seconds: u64,
    pub renew_every_seconds: u64,
    pub fallback_window_hours: i64,
}

impl Default for WebSubSection {
    fn default() -> Self {
        let d = HubCfg::default();
        Self {
            secret: None,
            hub_url: d.hub_url,
            callback_base: d.callback_base,
            lease_seconds: d.lease.as_secs(),
            renew_before_seconds: d.renew_before.as_secs(),
            renew_every_seconds: 3600,
            fallback_window_hours: crate::webhook::DEFAULT_WINDOW_HOURS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushSection {
    pub default_topic: String,
    pub max_tokens: usize,
    pub summary_chars: usize,
}

impl Default for PushSection {
    fn default() -> Self {
        let d = FanoutCfg::default();
        Self {
            default_topic: d.default_topic,
            max_tokens: d.max_tokens,
            summary_chars: d.summary_chars,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeSection {
    pub heartbeat_seconds: u64,
    pub ping_seconds: u64,
    pub log_len: usize,
    pub broadcast_capacity: usize,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            heartbeat_seconds: 15,
            ping_seconds: 25,
            log_len: 1000,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_seconds: u64,
    pub user_agent: String,
    /// Feeds and article pages larger than this are refused.
    pub max_body_bytes: usize,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            user_agent: concat!("reelwire/", env!("CARGO_PKG_VERSION")).into(),
            max_body_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Replace zero with the default; capacities must stay positive.
fn positive<T: PartialEq + Default + Copy>(v: T, fallback: T) -> T {
    if v == T::default() {
        fallback
    } else {
        v
    }
}

impl AppConfig {
    /// Load from an explicit path. `.json` is parsed as JSON, anything else
    /// as TOML.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("reading config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let cfg = Self::parse(&content, &ext)?;
        cfg.finish()
    }

    /// 1) $REELWIRE_CONFIG_PATH (must exist)
    /// 2) config/reelwire.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display()));
            }
            return Self::load_from(&pb);
        }
        let pb = PathBuf::from(DEFAULT_CONFIG_PATH);
        if pb.exists() {
            return Self::load_from(&pb);
        }
        tracing::info!("no config file found, using defaults");
        Self::default().finish()
    }

    fn parse(s: &str, ext: &str) -> Result<Self> {
        if ext == "json" {
            return serde_json::from_str(s).context("parsing JSON config");
        }
        toml::from_str(s).context("parsing TOML config")
    }

    /// Env overrides, clamping and source validation.
    fn finish(mut self) -> Result<Self> {
        if let Ok(secret) = std::env::var(ENV_WEBSUB_SECRET) {
            if !secret.trim().is_empty() {
                self.websub.secret = Some(secret.trim().to_string());
            }
        }
        self.normalize();
        self.sources()?;
        Ok(self)
    }

    fn normalize(&mut self) {
        let d = Self::default();
        self.feed.max_len = positive(self.feed.max_len, d.feed.max_len);
        self.queue.workers = positive(self.queue.workers, d.queue.workers);
        self.queue.job_ttl_seconds = positive(self.queue.job_ttl_seconds, d.queue.job_ttl_seconds);
        self.queue.result_ttl_seconds = positive(self.queue.result_ttl_seconds, d.queue.result_ttl_seconds);
        self.push.max_tokens = positive(self.push.max_tokens, d.push.max_tokens);
        self.realtime.log_len = positive(self.realtime.log_len, d.realtime.log_len);
        self.realtime.broadcast_capacity = positive(self.realtime.broadcast_capacity, d.realtime.broadcast_capacity);
        self.realtime.heartbeat_seconds = positive(self.realtime.heartbeat_seconds, d.realtime.heartbeat_seconds);
        self.realtime.ping_seconds = positive(self.realtime.ping_seconds, d.realtime.ping_seconds);
        self.scheduler.poll_every_minutes = positive(self.scheduler.poll_every_minutes, d.scheduler.poll_every_minutes);
        self.websub.renew_every_seconds = positive(self.websub.renew_every_seconds, d.websub.renew_every_seconds);
        self.http.timeout_seconds = positive(self.http.timeout_seconds, d.http.timeout_seconds);
        self.http.max_body_bytes = positive(self.http.max_body_bytes, d.http.max_body_bytes);
        if self.push.default_topic.trim().is_empty() {
            self.push.default_topic = d.push.default_topic;
        }
        if !self.scheduler.spread_seconds.is_finite() || self.scheduler.spread_seconds < 0.0 {
            self.scheduler.spread_seconds = d.scheduler.spread_seconds;
        }
        self.websub.secret = self.websub.secret.take().filter(|s| !s.trim().is_empty());
    }

    /// All configured sources. Malformed RSS URLs, unknown kinds and two
    /// sources sharing a key are rejected here, once, at load.
    pub fn sources(&self) -> Result<Vec<SourceSpec>, IngestError> {
        let mut out = Vec::with_capacity(self.youtube.len() + self.rss.len());
        for y in &self.youtube {
            let channel = y.channel_id.trim();
            if channel.is_empty() {
                return Err(IngestError::Validation("youtube source without channel_id".into()));
            }
            let mut spec = SourceSpec::youtube(channel);
            spec.name = y.name.clone();
            spec.max_items = y.max_items;
            spec.vertical = y.vertical.clone();
            spec.webhook_window_hours = y.webhook_window_hours;
            out.push(spec);
        }
        for r in &self.rss {
            let url = validate_topic_url(&r.url)?;
            let kind = match r.kind.as_deref() {
                Some(k) => k.parse::<StoryKind>().map_err(IngestError::Validation)?,
                None => StoryKind::News,
            };
            let mut spec = SourceSpec::rss(url.to_string(), kind);
            spec.name = r.name.clone();
            spec.max_items = r.max_items;
            spec.vertical = r.vertical.clone();
            spec.webhook_window_hours = r.webhook_window_hours;
            out.push(spec);
        }
        let mut seen = HashSet::with_capacity(out.len());
        for spec in &out {
            let key = spec.key();
            if !seen.insert(key.clone()) {
                return Err(IngestError::Validation(format!("duplicate source key {key}")));
            }
        }
        Ok(out)
    }

    pub fn youtube_specs(&self) -> Vec<SourceSpec> {
        self.sources()
            .unwrap_or_default()
            .into_iter()
            .filter(|s| s.kind() == crate::ingest::types::SourceKind::Youtube)
            .collect()
    }

    pub fn rss_specs(&self) -> Vec<SourceSpec> {
        self.sources()
            .unwrap_or_default()
            .into_iter()
            .filter(|s| s.kind() == crate::ingest::types::SourceKind::Rss)
            .collect()
    }

    pub fn scheduler_cfg(&self) -> SchedulerCfg {
        let s = &self.scheduler;
        SchedulerCfg {
            youtube_enabled: self.ingest.youtube_enabled,
            rss_enabled: self.ingest.rss_enabled,
            poll_every: Duration::from_secs(s.poll_every_minutes * 60),
            jitter: Duration::from_secs(s.jitter_seconds),
            spread: Duration::from_secs_f64(s.spread_seconds),
            published_after_hours: s.published_after_hours,
            max_youtube_per_run: s.max_youtube_per_run,
            max_rss_per_run: s.max_rss_per_run,
            idle_sleep: Duration::from_secs(s.idle_sleep_seconds.max(1)),
        }
    }

    pub fn queue_cfg(&self) -> QueueCfg {
        QueueCfg {
            job_ttl: Duration::from_secs(self.queue.job_ttl_seconds),
            result_ttl: Duration::from_secs(self.queue.result_ttl_seconds),
        }
    }

    pub fn extract_cfg(&self) -> ExtractCfg {
        ExtractCfg {
            page_fetch_allow: self
                .extract
                .page_fetch_allow
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            strong_score: self.extract.strong_score,
            summary_chars: self.extract.summary_chars,
        }
    }

    pub fn fanout_cfg(&self) -> FanoutCfg {
        FanoutCfg {
            default_topic: self.push.default_topic.clone(),
            max_tokens: self.push.max_tokens,
            summary_chars: self.push.summary_chars,
        }
    }

    pub fn realtime_cfg(&self) -> RealtimeCfg {
        RealtimeCfg {
            heartbeat: Duration::from_secs(self.realtime.heartbeat_seconds),
            ping: Duration::from_secs(self.realtime.ping_seconds),
            broadcast_capacity: self.realtime.broadcast_capacity,
            ..RealtimeCfg::default()
        }
    }

    pub fn hub_cfg(&self) -> HubCfg {
        HubCfg {
            hub_url: self.websub.hub_url.clone(),
            callback_base: self.websub.callback_base.clone(),
            lease: Duration::from_secs(self.websub.lease_seconds),
            renew_before: Duration::from_secs(self.websub.renew_before_seconds),
            secret: self.websub.secret.clone(),
        }
    }

    pub fn signature_ttl(&self) -> Duration {
        Duration::from_secs(self.feed.signature_ttl_hours.max(1) * 3600)
    }

    pub fn cursor_ttl(&self) -> Duration {
        Duration::from_secs(self.cursor.ttl_hours.max(1) * 3600)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_seconds)
    }
}
