// src/ingest/queue.rs
//! Dispatch queue between the trigger layer and the extraction workers.
//!
//! At-least-once delivery with an idempotent job identity: enqueueing an id
//! that is still live is a no-op. Jobs that wait longer than `job_ttl` are
//! dropped when popped and rely on the next poll/webhook for another chance.
//! Results stay readable for `result_ttl` for debugging.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::IngestError;
use crate::ingest::types::{AdapterEvent, JobId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestJob {
    pub id: JobId,
    pub event: AdapterEvent,
    pub enqueued_at: DateTime<Utc>,
}

impl IngestJob {
    pub fn new(event: AdapterEvent) -> Self {
        Self {
            id: event.job_id(),
            event,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    /// Same identity already live; nothing was added.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobResult {
    Admitted { story_id: String },
    Duplicate { signature: String },
    Expired,
    Failed { reason: String },
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: IngestJob) -> Result<Enqueue, IngestError>;
    /// Next live job, waiting up to `wait`. Expired jobs are dropped here.
    async fn pop(&self, wait: Duration) -> Result<Option<IngestJob>, IngestError>;
    async fn complete(&self, id: &JobId, result: JobResult) -> Result<(), IngestError>;
    async fn result(&self, id: &JobId) -> Result<Option<JobResult>, IngestError>;
}

#[derive(Debug, Clone, Copy)]
pub struct QueueCfg {
    pub job_ttl: Duration,
    pub result_ttl: Duration,
}

impl Default for QueueCfg {
    fn default() -> Self {
        Self {
            job_ttl: Duration::from_secs(15 * 60),
            result_ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<(IngestJob, Instant)>,
    live_ids: HashMap<JobId, Instant>,
    results: HashMap<JobId, (JobResult, Instant)>,
}

impl QueueState {
    fn prune(&mut self, now: Instant) {
        self.live_ids.retain(|_, exp| *exp > now);
        self.results.retain(|_, (_, exp)| *exp > now);
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    cfg: QueueCfg,
    state: Mutex<QueueState>,
    ready: Notify,
}

impl MemoryQueue {
    pub fn new(cfg: QueueCfg) -> Self {
        Self {
            cfg,
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    fn try_pop(&self) -> Option<IngestJob> {
        let now = Instant::now();
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some((job, expires)) = st.pending.pop_front() {
            if expires <= now {
                tracing::info!(target: "ingest", job_id = %job.id, "job expired before processing");
                counter!("queue_expired_total").increment(1);
                st.results
                    .insert(job.id.clone(), (JobResult::Expired, now + self.cfg.result_ttl));
                continue;
            }
            return Some(job);
        }
        None
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: IngestJob) -> Result<Enqueue, IngestError> {
        let now = Instant::now();
        {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            st.prune(now);
            if st.live_ids.contains_key(&job.id) {
                counter!("queue_duplicate_total").increment(1);
                return Ok(Enqueue::Duplicate);
            }
            let expires = now + self.cfg.job_ttl;
            st.live_ids.insert(job.id.clone(), expires);
            st.pending.push_back((job, expires));
        }
        counter!("queue_enqueued_total").increment(1);
        self.ready.notify_one();
        Ok(Enqueue::Accepted)
    }

    async fn pop(&self, wait: Duration) -> Result<Option<IngestJob>, IngestError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job) = self.try_pop() {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, self.ready.notified())
                .await
                .is_err()
            {
                return Ok(self.try_pop());
            }
        }
    }

    async fn complete(&self, id: &JobId, result: JobResult) -> Result<(), IngestError> {
        let now = Instant::now();
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.results.insert(id.clone(), (result, now + self.cfg.result_ttl));
        Ok(())
    }

    async fn result(&self, id: &JobId) -> Result<Option<JobResult>, IngestError> {
        let now = Instant::now();
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(st
            .results
            .get(id)
            .filter(|(_, exp)| *exp > now)
            .map(|(r, _)| r.clone()))
    }
}
