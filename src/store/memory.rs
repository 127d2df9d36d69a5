// src/store/memory.rs
//! Single-process store implementations. Every mutation happens inside one
//! mutex critical section, which is what makes them atomic.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    FeedStore, FetchCursorStore, PushRegistration, RegistrationStore, SignatureStore, StoryLog,
    SubscriptionStore, WebSubSubscription,
};
use crate::error::IngestError;
use crate::ingest::types::{CanonicalSignature, FetchCursor, Story};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    inner: Mutex<HashMap<String, (FetchCursor, Instant)>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FetchCursorStore for MemoryCursorStore {
    async fn get(&self, source_key: &str) -> Result<Option<FetchCursor>, IngestError> {
        let mut map = lock(&self.inner);
        match map.get(source_key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                map.remove(source_key);
                Ok(None)
            }
            Some((cursor, _)) => Ok(Some(cursor.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, source_key: &str, cursor: &FetchCursor, ttl: Duration) -> Result<(), IngestError> {
        lock(&self.inner).insert(source_key.to_string(), (cursor.clone(), Instant::now() + ttl));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySignatureStore {
    inner: Mutex<HashMap<CanonicalSignature, Instant>>,
}

impl MemorySignatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.inner).values().filter(|exp| **exp > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SignatureStore for MemorySignatureStore {
    async fn insert_if_absent(&self, signature: &CanonicalSignature, ttl: Duration) -> Result<bool, IngestError> {
        let now = Instant::now();
        let mut map = lock(&self.inner);
        // Lazy retention: drop expired signatures on the write path.
        map.retain(|_, expires| *expires > now);
        if map.contains_key(signature) {
            return Ok(false);
        }
        map.insert(signature.clone(), now + ttl);
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct MemoryFeedStore {
    inner: Mutex<VecDeque<Story>>,
}

impl MemoryFeedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn push_trim(&self, story: &Story, max_len: usize) -> Result<(), IngestError> {
        let mut feed = lock(&self.inner);
        feed.push_front(story.clone());
        feed.truncate(max_len.max(1));
        Ok(())
    }

    async fn snapshot(&self, limit: usize) -> Result<Vec<Story>, IngestError> {
        Ok(lock(&self.inner).iter().take(limit).cloned().collect())
    }

    async fn len(&self) -> Result<usize, IngestError> {
        Ok(lock(&self.inner).len())
    }
}

#[derive(Debug, Default)]
struct Registrations {
    by_token: HashMap<String, PushRegistration>,
    by_topic: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Default)]
pub struct MemoryRegistrationStore {
    inner: Mutex<Registrations>,
}

impl MemoryRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistrationStore for MemoryRegistrationStore {
    async fn register(&self, token: &str, registration: &PushRegistration) -> Result<(), IngestError> {
        let mut regs = lock(&self.inner);
        let dropped: Vec<String> = regs
            .by_token
            .get(token)
            .map(|prev| {
                prev.topics
                    .iter()
                    .filter(|t| !registration.topics.contains(t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for topic in dropped {
            if let Some(set) = regs.by_topic.get_mut(&topic) {
                set.remove(token);
                if set.is_empty() {
                    regs.by_topic.remove(&topic);
                }
            }
        }
        for topic in &registration.topics {
            regs.by_topic
                .entry(topic.clone())
                .or_default()
                .insert(token.to_string());
        }
        regs.by_token.insert(token.to_string(), registration.clone());
        Ok(())
    }

    async fn tokens_for_topic(&self, topic: &str) -> Result<Vec<String>, IngestError> {
        Ok(lock(&self.inner)
            .by_topic
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn registration(&self, token: &str) -> Result<Option<PushRegistration>, IngestError> {
        Ok(lock(&self.inner).by_token.get(token).cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    inner: Mutex<HashMap<String, WebSubSubscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn upsert(&self, token: &str, subscription: &WebSubSubscription) -> Result<(), IngestError> {
        lock(&self.inner).insert(token.to_string(), subscription.clone());
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<WebSubSubscription>, IngestError> {
        Ok(lock(&self.inner).get(token).cloned())
    }

    async fn remove(&self, token: &str) -> Result<bool, IngestError> {
        Ok(lock(&self.inner).remove(token).is_some())
    }

    async fn all(&self) -> Result<Vec<(String, WebSubSubscription)>, IngestError> {
        let mut out: Vec<_> = lock(&self.inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[derive(Debug)]
struct LogInner {
    entries: VecDeque<(u64, Story)>,
    next_seq: u64,
}

/// Bounded in-memory story log; the oldest entries fall off past `capacity`.
#[derive(Debug)]
pub struct MemoryStoryLog {
    inner: Mutex<LogInner>,
    capacity: usize,
    appended: Notify,
}

impl MemoryStoryLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                entries: VecDeque::new(),
                next_seq: 1,
            }),
            capacity: capacity.max(1),
            appended: Notify::new(),
        }
    }

    fn collect(&self, after: u64, max: usize) -> Vec<(u64, Story)> {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|(seq, _)| *seq > after)
            .take(max)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StoryLog for MemoryStoryLog {
    async fn append(&self, story: &Story) -> Result<u64, IngestError> {
        let seq = {
            let mut log = lock(&self.inner);
            let seq = log.next_seq;
            log.next_seq += 1;
            log.entries.push_back((seq, story.clone()));
            while log.entries.len() > self.capacity {
                log.entries.pop_front();
            }
            seq
        };
        self.appended.notify_waiters();
        Ok(seq)
    }

    async fn read_after(&self, after: u64, max: usize, block: Duration) -> Result<Vec<(u64, Story)>, IngestError> {
        let notified = self.appended.notified();
        tokio::pin!(notified);
        // Register interest before checking so an append in between is not missed.
        notified.as_mut().enable();

        let ready = self.collect(after, max);
        if !ready.is_empty() || block.is_zero() {
            return Ok(ready);
        }
        let _ = tokio::time::timeout(block, notified).await;
        Ok(self.collect(after, max))
    }

    async fn head(&self) -> Result<u64, IngestError> {
        Ok(lock(&self.inner).next_seq - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{SourceKind, SourceRef, StoryKind};
    use chrono::Utc;
    use std::sync::Arc;

    fn story(id: &str) -> Story {
        Story {
            id: id.to_string(),
            kind: StoryKind::News,
            title: id.to_string(),
            summary: String::new(),
            published_at: Utc::now(),
            source: SourceRef {
                kind: SourceKind::Rss,
                key: "rss:test".into(),
            },
            url: None,
            thumb_url: None,
            tags: vec![],
            normalized_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn feed_is_bounded_newest_first() {
        let feed = MemoryFeedStore::new();
        for i in 0..10 {
            feed.push_trim(&story(&format!("s{i}")), 3).await.unwrap();
        }
        let snap = feed.snapshot(10).await.unwrap();
        let ids: Vec<_> = snap.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s9", "s8", "s7"]);
        assert_eq!(feed.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn signature_insert_is_exclusive() {
        let store = MemorySignatureStore::new();
        let sig = CanonicalSignature("abc".into());
        let ttl = Duration::from_secs(60);
        assert!(store.insert_if_absent(&sig, ttl).await.unwrap());
        assert!(!store.insert_if_absent(&sig, ttl).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn signatures_expire_after_ttl() {
        let store = MemorySignatureStore::new();
        let sig = CanonicalSignature("abc".into());
        assert!(store.insert_if_absent(&sig, Duration::from_secs(10)).await.unwrap());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.insert_if_absent(&sig, Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_expires() {
        let store = MemoryCursorStore::new();
        let c = FetchCursor {
            etag: Some("v1".into()),
            last_modified: None,
        };
        store.put("k", &c, Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(c));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn registration_indexes_topics() {
        let store = MemoryRegistrationStore::new();
        let reg = PushRegistration {
            platform: Some("ios".into()),
            lang: None,
            topics: vec!["movies".into(), "all".into()],
            registered_at: Utc::now(),
        };
        store.register("tok1", &reg).await.unwrap();
        assert_eq!(store.tokens_for_topic("movies").await.unwrap(), vec!["tok1"]);
        assert_eq!(store.registration("tok1").await.unwrap(), Some(reg));
        assert!(store.tokens_for_topic("tv").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reregistration_drops_topics_no_longer_listed() {
        let store = MemoryRegistrationStore::new();
        let mut reg = PushRegistration {
            platform: None,
            lang: None,
            topics: vec!["movies".into(), "all".into()],
            registered_at: Utc::now(),
        };
        store.register("tok", &reg).await.unwrap();
        store
            .register(
                "other",
                &PushRegistration {
                    topics: vec!["movies".into()],
                    ..reg.clone()
                },
            )
            .await
            .unwrap();

        reg.topics = vec!["all".into()];
        store.register("tok", &reg).await.unwrap();

        assert_eq!(store.tokens_for_topic("movies").await.unwrap(), vec!["other"]);
        assert_eq!(store.tokens_for_topic("all").await.unwrap(), vec!["tok"]);
        assert_eq!(store.registration("tok").await.unwrap().unwrap().topics, vec!["all"]);
    }

    #[tokio::test]
    async fn story_log_reads_after_cursor() {
        let log = MemoryStoryLog::with_capacity(100);
        assert_eq!(log.head().await.unwrap(), 0);
        log.append(&story("a")).await.unwrap();
        log.append(&story("b")).await.unwrap();
        let got = log.read_after(1, 10, Duration::ZERO).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 2);
        assert_eq!(got[0].1.id, "b");
    }

    #[tokio::test]
    async fn story_log_wakes_blocked_reader() {
        let log = Arc::new(MemoryStoryLog::with_capacity(10));
        let reader = {
            let log = log.clone();
            tokio::spawn(async move { log.read_after(0, 10, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        log.append(&story("late")).await.unwrap();
        let got = reader.await.unwrap().unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn story_log_times_out_empty() {
        let log = MemoryStoryLog::with_capacity(10);
        let got = log.read_after(0, 10, Duration::from_secs(15)).await.unwrap();
        assert!(got.is_empty());
    }
}
