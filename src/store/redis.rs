// src/store/redis.rs
//! Redis-backed stores for multi-instance deployments. Every mutation is a
//! single command, a MULTI pipeline or a Lua script, so the atomicity of the
//! in-memory implementations carries over.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::StreamReadReply;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};

use super::{
    FeedStore, FetchCursorStore, PushRegistration, RegistrationStore, SignatureStore, StoryLog,
    SubscriptionStore, WebSubSubscription,
};
use crate::error::IngestError;
use crate::ingest::queue::{Enqueue, IngestJob, JobQueue, JobResult, QueueCfg};
use crate::ingest::types::{CanonicalSignature, FetchCursor, JobId, Story};

const PREFIX: &str = "reelwire";

// INCR + XADD under one script so sequence numbers and stream ids agree.
const APPEND_SCRIPT: &str = r#"
local seq = redis.call('INCR', KEYS[2])
redis.call('XADD', KEYS[1], 'MAXLEN', '~', ARGV[2], seq .. '-0', 'story', ARGV[1])
return seq
"#;

// Re-registration replaces the topic set: the token leaves every topic the
// previous registration listed that the new one does not.
const REGISTER_SCRIPT: &str = r#"
local prev = redis.call('HGET', KEYS[1], ARGV[1])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
local keep = {}
for i = 4, #ARGV do keep[ARGV[i]] = true end
if prev then
  local ok, old = pcall(cjson.decode, prev)
  if ok and type(old.topics) == 'table' then
    for _, t in ipairs(old.topics) do
      if not keep[t] then redis.call('SREM', ARGV[3] .. t, ARGV[1]) end
    end
  end
end
for i = 4, #ARGV do redis.call('SADD', ARGV[3] .. ARGV[i], ARGV[1]) end
return 1
"#;

fn err(op: &str, e: impl fmt::Display) -> IngestError {
    IngestError::store(format!("redis {op}: {e}"))
}

fn to_json<T: Serialize>(v: &T) -> Result<String, IngestError> {
    serde_json::to_string(v).map_err(|e| err("encode", e))
}

fn from_json<T: DeserializeOwned>(s: &str) -> Result<T, IngestError> {
    serde_json::from_str(s).map_err(|e| err("decode", e))
}

/// One multiplexed connection shared by every Redis store.
#[derive(Clone)]
pub struct RedisStores {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisStores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStores")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisStores {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(target: "store", "connected to redis");
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl FetchCursorStore for RedisStores {
    async fn get(&self, source_key: &str) -> Result<Option<FetchCursor>, IngestError> {
        let raw: Option<String> = self
            .conn()
            .get(format!("{PREFIX}:cursor:{source_key}"))
            .await
            .map_err(|e| err("GET", e))?;
        raw.as_deref().map(from_json).transpose()
    }

    async fn put(&self, source_key: &str, cursor: &FetchCursor, ttl: Duration) -> Result<(), IngestError> {
        self.conn()
            .set_ex::<_, _, ()>(
                format!("{PREFIX}:cursor:{source_key}"),
                to_json(cursor)?,
                ttl.as_secs().max(1),
            )
            .await
            .map_err(|e| err("SETEX", e))
    }
}

#[async_trait]
impl SignatureStore for RedisStores {
    async fn insert_if_absent(&self, signature: &CanonicalSignature, ttl: Duration) -> Result<bool, IngestError> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("{PREFIX}:sig:{}", signature.as_str()))
            .arg(Utc::now().timestamp())
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut self.conn())
            .await
            .map_err(|e| err("SET NX", e))?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl FeedStore for RedisStores {
    async fn push_trim(&self, story: &Story, max_len: usize) -> Result<(), IngestError> {
        let key = format!("{PREFIX}:feed");
        redis::pipe()
            .atomic()
            .lpush(&key, to_json(story)?)
            .ignore()
            .ltrim(&key, 0, max_len.max(1) as isize - 1)
            .ignore()
            .query_async::<()>(&mut self.conn())
            .await
            .map_err(|e| err("LPUSH/LTRIM", e))
    }

    async fn snapshot(&self, limit: usize) -> Result<Vec<Story>, IngestError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw: Vec<String> = self
            .conn()
            .lrange(format!("{PREFIX}:feed"), 0, limit as isize - 1)
            .await
            .map_err(|e| err("LRANGE", e))?;
        raw.iter().map(|s| from_json(s)).collect()
    }

    async fn len(&self) -> Result<usize, IngestError> {
        self.conn()
            .llen(format!("{PREFIX}:feed"))
            .await
            .map_err(|e| err("LLEN", e))
    }
}

#[async_trait]
impl RegistrationStore for RedisStores {
    async fn register(&self, token: &str, registration: &PushRegistration) -> Result<(), IngestError> {
        let script = redis::Script::new(REGISTER_SCRIPT);
        let mut invocation = script.key(format!("{PREFIX}:push:reg"));
        invocation
            .arg(token)
            .arg(to_json(registration)?)
            .arg(format!("{PREFIX}:push:topic:"));
        for topic in &registration.topics {
            invocation.arg(topic);
        }
        let _: i64 = invocation
            .invoke_async(&mut self.conn())
            .await
            .map_err(|e| err("HSET/SADD/SREM", e))?;
        Ok(())
    }

    async fn tokens_for_topic(&self, topic: &str) -> Result<Vec<String>, IngestError> {
        self.conn()
            .smembers(format!("{PREFIX}:push:topic:{topic}"))
            .await
            .map_err(|e| err("SMEMBERS", e))
    }

    async fn registration(&self, token: &str) -> Result<Option<PushRegistration>, IngestError> {
        let raw: Option<String> = self
            .conn()
            .hget(format!("{PREFIX}:push:reg"), token)
            .await
            .map_err(|e| err("HGET", e))?;
        raw.as_deref().map(from_json).transpose()
    }
}

#[async_trait]
impl SubscriptionStore for RedisStores {
    async fn upsert(&self, token: &str, subscription: &WebSubSubscription) -> Result<(), IngestError> {
        self.conn()
            .hset::<_, _, _, ()>(format!("{PREFIX}:websub"), token, to_json(subscription)?)
            .await
            .map_err(|e| err("HSET", e))
    }

    async fn get(&self, token: &str) -> Result<Option<WebSubSubscription>, IngestError> {
        let raw: Option<String> = self
            .conn()
            .hget(format!("{PREFIX}:websub"), token)
            .await
            .map_err(|e| err("HGET", e))?;
        raw.as_deref().map(from_json).transpose()
    }

    async fn remove(&self, token: &str) -> Result<bool, IngestError> {
        let removed: i64 = self
            .conn()
            .hdel(format!("{PREFIX}:websub"), token)
            .await
            .map_err(|e| err("HDEL", e))?;
        Ok(removed > 0)
    }

    async fn all(&self) -> Result<Vec<(String, WebSubSubscription)>, IngestError> {
        let raw: HashMap<String, String> = self
            .conn()
            .hgetall(format!("{PREFIX}:websub"))
            .await
            .map_err(|e| err("HGETALL", e))?;
        let mut out = raw
            .into_iter()
            .map(|(k, v)| Ok((k, from_json(&v)?)))
            .collect::<Result<Vec<_>, IngestError>>()?;
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

/// Story log on a Redis stream with ids `<seq>-0`.
#[derive(Clone)]
pub struct RedisStoryLog {
    stores: RedisStores,
    capacity: usize,
}

impl RedisStoryLog {
    pub fn new(stores: RedisStores, capacity: usize) -> Self {
        Self {
            stores,
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl StoryLog for RedisStoryLog {
    async fn append(&self, story: &Story) -> Result<u64, IngestError> {
        redis::Script::new(APPEND_SCRIPT)
            .key(format!("{PREFIX}:stream"))
            .key(format!("{PREFIX}:stream:seq"))
            .arg(to_json(story)?)
            .arg(self.capacity)
            .invoke_async(&mut self.stores.conn())
            .await
            .map_err(|e| err("XADD", e))
    }

    async fn read_after(&self, after: u64, max: usize, block: Duration) -> Result<Vec<(u64, Story)>, IngestError> {
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT").arg(max.max(1));
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS")
            .arg(format!("{PREFIX}:stream"))
            .arg(format!("{after}-0"));
        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut self.stores.conn())
            .await
            .map_err(|e| err("XREAD", e))?;

        let mut out = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                let seq = entry
                    .id
                    .split_once('-')
                    .and_then(|(s, _)| s.parse::<u64>().ok())
                    .unwrap_or_default();
                if let Some(raw) = entry.get::<String>("story") {
                    out.push((seq, from_json(&raw)?));
                }
            }
        }
        Ok(out)
    }

    async fn head(&self) -> Result<u64, IngestError> {
        let seq: Option<u64> = self
            .stores
            .conn()
            .get(format!("{PREFIX}:stream:seq"))
            .await
            .map_err(|e| err("GET", e))?;
        Ok(seq.unwrap_or(0))
    }
}

/// Dispatch queue shared by worker processes. Identity is a `SET NX EX`
/// marker living as long as the job; expiry is checked on pop from the
/// job's enqueue time.
#[derive(Clone)]
pub struct RedisQueue {
    stores: RedisStores,
    cfg: QueueCfg,
}

impl RedisQueue {
    pub fn new(stores: RedisStores, cfg: QueueCfg) -> Self {
        Self { stores, cfg }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: IngestJob) -> Result<Enqueue, IngestError> {
        let marker: Option<String> = redis::cmd("SET")
            .arg(format!("{PREFIX}:job:{}", job.id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.cfg.job_ttl.as_secs().max(1))
            .query_async(&mut self.stores.conn())
            .await
            .map_err(|e| err("SET NX", e))?;
        if marker.is_none() {
            metrics::counter!("queue_duplicate_total").increment(1);
            return Ok(Enqueue::Duplicate);
        }
        self.stores
            .conn()
            .lpush::<_, _, ()>(format!("{PREFIX}:queue"), to_json(&job)?)
            .await
            .map_err(|e| err("LPUSH", e))?;
        metrics::counter!("queue_enqueued_total").increment(1);
        Ok(Enqueue::Accepted)
    }

    async fn pop(&self, wait: Duration) -> Result<Option<IngestJob>, IngestError> {
        loop {
            let raw: Option<String> = if wait.is_zero() {
                self.stores
                    .conn()
                    .rpop(format!("{PREFIX}:queue"), None)
                    .await
                    .map_err(|e| err("RPOP", e))?
            } else {
                let popped: Option<(String, String)> = self
                    .stores
                    .conn()
                    .brpop(format!("{PREFIX}:queue"), wait.as_secs_f64())
                    .await
                    .map_err(|e| err("BRPOP", e))?;
                popped.map(|(_, v)| v)
            };
            let Some(raw) = raw else { return Ok(None) };
            let job: IngestJob = from_json(&raw)?;
            let age = (Utc::now() - job.enqueued_at).to_std().unwrap_or_default();
            if age >= self.cfg.job_ttl {
                tracing::info!(target: "ingest", job_id = %job.id, "job expired before processing");
                metrics::counter!("queue_expired_total").increment(1);
                self.complete(&job.id, JobResult::Expired).await?;
                continue;
            }
            return Ok(Some(job));
        }
    }

    async fn complete(&self, id: &JobId, result: JobResult) -> Result<(), IngestError> {
        self.stores
            .conn()
            .set_ex::<_, _, ()>(
                format!("{PREFIX}:result:{id}"),
                to_json(&result)?,
                self.cfg.result_ttl.as_secs().max(1),
            )
            .await
            .map_err(|e| err("SETEX", e))
    }

    async fn result(&self, id: &JobId) -> Result<Option<JobResult>, IngestError> {
        let raw: Option<String> = self
            .stores
            .conn()
            .get(format!("{PREFIX}:result:{id}"))
            .await
            .map_err(|e| err("GET", e))?;
        raw.as_deref().map(from_json).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Needs a live server; skipped unless REDIS_URL is set.
    async fn stores() -> Option<RedisStores> {
        let url = std::env::var(crate::config::ENV_REDIS_URL).ok()?;
        RedisStores::connect(&url).await.ok()
    }

    #[tokio::test]
    async fn reregistration_drops_topics_no_longer_listed() {
        let Some(stores) = stores().await else {
            return;
        };
        let token = format!("test-{}", rand::random::<u64>());
        let mut reg = PushRegistration {
            platform: None,
            lang: None,
            topics: vec!["movies".into(), "all".into()],
            registered_at: Utc::now(),
        };
        stores.register(&token, &reg).await.unwrap();
        assert!(stores.tokens_for_topic("movies").await.unwrap().contains(&token));

        reg.topics = vec!["all".into()];
        stores.register(&token, &reg).await.unwrap();

        assert!(!stores.tokens_for_topic("movies").await.unwrap().contains(&token));
        assert!(stores.tokens_for_topic("all").await.unwrap().contains(&token));
        assert_eq!(stores.registration(&token).await.unwrap().unwrap().topics, vec!["all"]);
    }
}
