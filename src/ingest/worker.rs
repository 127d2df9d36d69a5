// src/ingest/worker.rs
//! Queue consumers: Extractor → Canonicalizer → "story admitted" consumers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dedup::{Admission, Canonicalizer};
use crate::extract::Extractor;
use crate::ingest::queue::{IngestJob, JobQueue, JobResult};
use crate::ingest::types::Story;

const POP_WAIT: Duration = Duration::from_secs(5);

/// Independent consumer of admitted stories (push, realtime). Failures stay
/// inside the consumer.
#[async_trait]
pub trait StoryConsumer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn on_admitted(&self, story: &Story);
}

pub struct Pipeline {
    extractor: Extractor,
    canonicalizer: Canonicalizer,
    consumers: Vec<Arc<dyn StoryConsumer>>,
}

impl Pipeline {
    pub fn new(extractor: Extractor, canonicalizer: Canonicalizer) -> Self {
        Self {
            extractor,
            canonicalizer,
            consumers: Vec::new(),
        }
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn StoryConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub async fn process(&self, job: &IngestJob) -> JobResult {
        let payload = self.extractor.extract(&job.event).await;
        match self.canonicalizer.admit(&job.event, &payload).await {
            Ok(Admission::Admitted(story)) => {
                join_all(self.consumers.iter().map(|c| c.on_admitted(&story))).await;
                JobResult::Admitted { story_id: story.id }
            }
            Ok(Admission::Duplicate(sig)) => JobResult::Duplicate {
                signature: sig.0,
            },
            Err(e) => {
                tracing::warn!(target: "ingest", job_id = %job.id, error = %e, "job failed");
                JobResult::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn handle(&self, queue: &dyn JobQueue, job: IngestJob) {
        let result = self.process(&job).await;
        if let Err(e) = queue.complete(&job.id, result).await {
            tracing::warn!(target: "ingest", job_id = %job.id, error = %e, "could not record job result");
        }
    }
}

/// Process everything currently queued and return the number of jobs
/// handled. Used by one-shot mode and tests.
pub async fn drain(queue: &dyn JobQueue, pipeline: &Pipeline) -> usize {
    let mut n = 0;
    loop {
        match queue.pop(Duration::ZERO).await {
            Ok(Some(job)) => {
                pipeline.handle(queue, job).await;
                n += 1;
            }
            Ok(None) => return n,
            Err(e) => {
                tracing::warn!(target: "ingest", error = %e, "queue pop failed");
                return n;
            }
        }
    }
}

/// `n` concurrent workers pulling from `queue` until `shutdown` fires.
pub fn spawn_workers(
    n: usize,
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..n.max(1))
        .map(|worker| {
            let queue = queue.clone();
            let pipeline = pipeline.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tracing::debug!(target: "ingest", worker, "worker started");
                loop {
                    let popped = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        popped = queue.pop(POP_WAIT) => popped,
                    };
                    match popped {
                        Ok(Some(job)) => pipeline.handle(queue.as_ref(), job).await,
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(target: "ingest", worker, error = %e, "queue pop failed");
                            tokio::time::sleep(POP_WAIT).await;
                        }
                    }
                }
                tracing::debug!(target: "ingest", worker, "worker stopped");
            })
        })
        .collect()
}
