// src/notify/mod.rs
//! Push fan-out: one admitted story → topic set → capped token union →
//! one notification per eligible token. Best effort, at most once per token.

pub mod relay;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{stream, StreamExt};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IngestError;
use crate::ingest::types::{Story, StoryKind};
use crate::ingest::worker::StoryConsumer;
use crate::store::{PushRegistration, RegistrationStore};

pub use relay::RelayPushSender;

pub const ENV_PUSH_RELAY_URL: &str = "PUSH_RELAY_URL";
const MAX_TOPIC_LEN: usize = 64;
const SEND_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Web => "web",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" | "apns" => Ok(Self::Ios),
            "android" | "fcm" => Ok(Self::Android),
            "web" | "webpush" => Ok(Self::Web),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

/// Platform-agnostic notification body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub image: Option<String>,
    pub story_id: String,
    pub kind: StoryKind,
}

impl Notification {
    pub fn for_story(story: &Story, body_chars: usize) -> Self {
        Self {
            title: story.title.clone(),
            body: truncate_chars(&story.summary, body_chars),
            url: story.url.clone(),
            image: story.thumb_url.clone(),
            story_id: story.id.clone(),
            kind: story.kind,
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out = out.trim_end().to_string();
    out.push('…');
    out
}

/// Pluggable per-platform delivery.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, platform: Platform, token: &str, notification: &Notification) -> Result<(), IngestError>;
}

/// Sender used when no relay is configured: logs and reports success.
#[derive(Debug, Default, Clone)]
pub struct LogPushSender;

#[async_trait]
impl PushSender for LogPushSender {
    async fn send(&self, platform: Platform, token: &str, notification: &Notification) -> Result<(), IngestError> {
        tracing::info!(
            target: "push",
            platform = %platform,
            token = %token_hash(token),
            story_id = %notification.story_id,
            "push (log only)"
        );
        Ok(())
    }
}

/// Relay sender when `PUSH_RELAY_URL` is set, log sender otherwise.
pub fn sender_from_env() -> Arc<dyn PushSender> {
    match std::env::var(ENV_PUSH_RELAY_URL) {
        Ok(url) if !url.trim().is_empty() => Arc::new(RelayPushSender::new(url.trim().to_string())),
        _ => Arc::new(LogPushSender),
    }
}

/// Short stable handle for logs; tokens are never logged in full.
pub fn token_hash(token: &str) -> String {
    let hex = hex::encode(Sha256::digest(token.as_bytes()));
    hex[..12].to_string()
}

/// Lowercase, spaces to `-`, keep `[a-z0-9_-]`. `None` when nothing is left.
pub fn normalize_topic(raw: &str) -> Option<String> {
    let mut out = String::new();
    for c in raw.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        } else if c.is_whitespace() && !out.ends_with('-') {
            out.push('-');
        }
    }
    let out = out.trim_matches('-');
    (!out.is_empty()).then(|| out.chars().take(MAX_TOPIC_LEN).collect())
}

#[derive(Debug, Clone)]
pub struct FanoutCfg {
    pub default_topic: String,
    pub max_tokens: usize,
    pub summary_chars: usize,
}

impl Default for FanoutCfg {
    fn default() -> Self {
        Self {
            default_topic: "all".into(),
            max_tokens: 5_000,
            summary_chars: 140,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanoutStats {
    pub topics: usize,
    pub considered: usize,
    pub sent: usize,
    pub skipped: usize,
}

pub struct PushFanout {
    cfg: FanoutCfg,
    registrations: Arc<dyn RegistrationStore>,
    sender: Arc<dyn PushSender>,
}

impl PushFanout {
    pub fn new(cfg: FanoutCfg, registrations: Arc<dyn RegistrationStore>, sender: Arc<dyn PushSender>) -> Self {
        Self {
            cfg,
            registrations,
            sender,
        }
    }

    /// Normalised, deduplicated tag labels plus the default topic.
    pub fn topics_for(&self, story: &Story) -> BTreeSet<String> {
        story
            .tags
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.cfg.default_topic.as_str()))
            .filter_map(normalize_topic)
            .collect()
    }

    pub async fn fan_out(&self, story: &Story) -> FanoutStats {
        let topics = self.topics_for(story);
        let mut tokens = BTreeSet::new();
        for topic in &topics {
            match self.registrations.tokens_for_topic(topic).await {
                Ok(members) => tokens.extend(members),
                Err(e) => tracing::warn!(target: "push", topic = %topic, error = %e, "topic lookup failed"),
            }
        }
        let tokens: Vec<String> = tokens.into_iter().take(self.cfg.max_tokens).collect();
        let notification = Notification::for_story(story, self.cfg.summary_chars);

        let notification = &notification;
        let results: Vec<bool> = stream::iter(tokens.iter().cloned())
            .map(|token| async move { self.deliver(&token, notification).await })
            .buffer_unordered(SEND_CONCURRENCY)
            .collect()
            .await;

        let sent = results.iter().filter(|ok| **ok).count();
        let stats = FanoutStats {
            topics: topics.len(),
            considered: tokens.len(),
            sent,
            skipped: tokens.len() - sent,
        };
        counter!("push_sent_total").increment(stats.sent as u64);
        counter!("push_skipped_total").increment(stats.skipped as u64);
        tracing::info!(
            target: "push",
            story_id = %story.id,
            topics = stats.topics,
            token_count = stats.considered,
            sent = stats.sent,
            skipped = stats.skipped,
            "push fan-out finished"
        );
        stats
    }

    /// `true` when delivered. Every failure mode counts as skipped.
    async fn deliver(&self, token: &str, notification: &Notification) -> bool {
        let registration = match self.registrations.registration(token).await {
            Ok(Some(r)) => r,
            Ok(None) => return false,
            Err(e) => {
                tracing::debug!(target: "push", token = %token_hash(token), error = %e, "registration lookup failed");
                return false;
            }
        };
        let Some(platform) = registration
            .platform
            .as_deref()
            .and_then(|p| p.parse::<Platform>().ok())
        else {
            return false;
        };
        match self.sender.send(platform, token, notification).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(target: "push", token = %token_hash(token), error = %e, "delivery failed");
                false
            }
        }
    }
}

#[async_trait]
impl StoryConsumer for PushFanout {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn on_admitted(&self, story: &Story) {
        self.fan_out(story).await;
    }
}

/// Body of `POST /push/register`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub token: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Upsert a registration with normalised topics; the default topic is
/// always included so every device hears the firehose channel.
pub async fn register(
    store: &dyn RegistrationStore,
    default_topic: &str,
    req: RegisterRequest,
) -> Result<PushRegistration, IngestError> {
    let token = req.token.trim();
    if token.is_empty() || token.len() > 4096 {
        return Err(IngestError::Validation("push token missing or oversized".into()));
    }
    let topics: BTreeSet<String> = req
        .topics
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(default_topic))
        .filter_map(normalize_topic)
        .collect();
    let registration = PushRegistration {
        platform: req.platform.map(|p| p.trim().to_ascii_lowercase()),
        lang: req.lang,
        topics: topics.into_iter().collect(),
        registered_at: Utc::now(),
    };
    store.register(token, &registration).await?;
    tracing::info!(target: "push", token = %token_hash(token), topics = registration.topics.len(), "device registered");
    Ok(registration)
}
