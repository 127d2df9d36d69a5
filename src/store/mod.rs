// src/store/mod.rs
//! Shared-state interfaces. Each store exposes exactly one atomic mutation
//! (cursor overwrite, insert-if-absent, push+trim, upsert+set-add, map-upsert,
//! append); no operation spans two stores.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::ingest::types::{CanonicalSignature, FetchCursor, SourceKind, Story, StoryKind};

pub use memory::{
    MemoryCursorStore, MemoryFeedStore, MemoryRegistrationStore, MemorySignatureStore,
    MemoryStoryLog, MemorySubscriptionStore,
};

#[async_trait]
pub trait FetchCursorStore: Send + Sync {
    /// Missing or expired cursors read as `None`.
    async fn get(&self, source_key: &str) -> Result<Option<FetchCursor>, IngestError>;
    async fn put(&self, source_key: &str, cursor: &FetchCursor, ttl: Duration) -> Result<(), IngestError>;
}

#[async_trait]
pub trait SignatureStore: Send + Sync {
    /// Atomic check-and-insert. `true` only for the single caller that inserted.
    async fn insert_if_absent(&self, signature: &CanonicalSignature, ttl: Duration) -> Result<bool, IngestError>;
}

#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Push to head and trim to `max_len` as one step.
    async fn push_trim(&self, story: &Story, max_len: usize) -> Result<(), IngestError>;
    /// Newest first.
    async fn snapshot(&self, limit: usize) -> Result<Vec<Story>, IngestError>;
    async fn len(&self) -> Result<usize, IngestError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRegistration {
    /// Raw platform label as sent by the client; parsed at fan-out time.
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Upsert the registration and add the token to each topic's member set.
    async fn register(&self, token: &str, registration: &PushRegistration) -> Result<(), IngestError>;
    async fn tokens_for_topic(&self, topic: &str) -> Result<Vec<String>, IngestError>;
    async fn registration(&self, token: &str) -> Result<Option<PushRegistration>, IngestError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSubSubscription {
    pub hub: String,
    pub topic: String,
    pub source_kind: SourceKind,
    pub kind_hint: StoryKind,
    pub leased_until: DateTime<Utc>,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn upsert(&self, token: &str, subscription: &WebSubSubscription) -> Result<(), IngestError>;
    async fn get(&self, token: &str) -> Result<Option<WebSubSubscription>, IngestError>;
    async fn remove(&self, token: &str) -> Result<bool, IngestError>;
    async fn all(&self) -> Result<Vec<(String, WebSubSubscription)>, IngestError>;
}

/// Append-only log of admitted stories addressed by sequence number (> 0).
#[async_trait]
pub trait StoryLog: Send + Sync {
    async fn append(&self, story: &Story) -> Result<u64, IngestError>;
    /// Entries with `seq > after`, oldest first, at most `max`. Waits up to
    /// `block` for new data when nothing is available yet.
    async fn read_after(&self, after: u64, max: usize, block: Duration) -> Result<Vec<(u64, Story)>, IngestError>;
    /// Sequence number of the newest entry (0 when empty).
    async fn head(&self) -> Result<u64, IngestError>;
}
