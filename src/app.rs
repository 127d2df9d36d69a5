// src/app.rs
//! Wiring: stores → adapter/scheduler → queue → pipeline → consumers.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ENV_REDIS_URL};
use crate::dedup::Canonicalizer;
use crate::extract::Extractor;
use crate::ingest::adapter::{IngestSource, SourceAdapter};
use crate::ingest::fetch::{HttpTransport, Transport};
use crate::ingest::queue::{JobQueue, MemoryQueue};
use crate::ingest::scheduler::PollScheduler;
use crate::ingest::throttle::Throttle;
use crate::ingest::worker::{spawn_workers, Pipeline};
use crate::notify::{sender_from_env, PushFanout, PushSender};
use crate::realtime::RealtimeHub;
use crate::store::{
    FeedStore, FetchCursorStore, MemoryCursorStore, MemoryFeedStore, MemoryRegistrationStore,
    MemorySignatureStore, MemoryStoryLog, MemorySubscriptionStore, RegistrationStore, SignatureStore,
    StoryLog, SubscriptionStore,
};
use crate::webhook::hub::{spawn_lease_renewal, HttpHub, HubApi, SubscriptionManager};
use crate::webhook::WebhookState;

/// Every shared-state handle the service needs.
#[derive(Clone)]
pub struct Stores {
    pub cursors: Arc<dyn FetchCursorStore>,
    pub signatures: Arc<dyn SignatureStore>,
    pub feed: Arc<dyn FeedStore>,
    pub registrations: Arc<dyn RegistrationStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub story_log: Arc<dyn StoryLog>,
    pub queue: Arc<dyn JobQueue>,
}

impl Stores {
    /// Single-process stores.
    pub fn memory(cfg: &AppConfig) -> Self {
        Self {
            cursors: Arc::new(MemoryCursorStore::new()),
            signatures: Arc::new(MemorySignatureStore::new()),
            feed: Arc::new(MemoryFeedStore::new()),
            registrations: Arc::new(MemoryRegistrationStore::new()),
            subscriptions: Arc::new(MemorySubscriptionStore::new()),
            story_log: Arc::new(MemoryStoryLog::with_capacity(cfg.realtime.log_len)),
            queue: Arc::new(MemoryQueue::new(cfg.queue_cfg())),
        }
    }

    #[cfg(feature = "redis-store")]
    pub async fn redis(redis_url: &str, cfg: &AppConfig) -> anyhow::Result<Self> {
        use crate::store::redis::{RedisQueue, RedisStoryLog, RedisStores};

        let shared = RedisStores::connect(redis_url).await?;
        Ok(Self {
            cursors: Arc::new(shared.clone()),
            signatures: Arc::new(shared.clone()),
            feed: Arc::new(shared.clone()),
            registrations: Arc::new(shared.clone()),
            subscriptions: Arc::new(shared.clone()),
            story_log: Arc::new(RedisStoryLog::new(shared.clone(), cfg.realtime.log_len)),
            queue: Arc::new(RedisQueue::new(shared, cfg.queue_cfg())),
        })
    }

    /// Redis when built with `redis-store` and `REDIS_URL` is set, memory
    /// otherwise.
    pub async fn from_env(cfg: &AppConfig) -> anyhow::Result<Self> {
        let redis_url = std::env::var(ENV_REDIS_URL).ok().filter(|u| !u.trim().is_empty());
        match redis_url {
            #[cfg(feature = "redis-store")]
            Some(url) => Self::redis(url.trim(), cfg).await,
            #[cfg(not(feature = "redis-store"))]
            Some(_) => {
                tracing::warn!("REDIS_URL set but built without the redis-store feature; using memory stores");
                Ok(Self::memory(cfg))
            }
            None => Ok(Self::memory(cfg)),
        }
    }
}

pub struct Services {
    pub config: AppConfig,
    pub stores: Stores,
    pub adapter: Arc<SourceAdapter>,
    pub scheduler: Arc<PollScheduler>,
    pub pipeline: Arc<Pipeline>,
    pub push: Arc<PushFanout>,
    pub realtime: Arc<RealtimeHub>,
    pub hub: Arc<SubscriptionManager>,
    pub webhook: Arc<WebhookState>,
}

impl Services {
    /// Production wiring: real HTTP transport, hub client and push sender.
    pub async fn build(config: AppConfig) -> anyhow::Result<Self> {
        let stores = Stores::from_env(&config).await?;
        let transport: Arc<dyn Transport> =
            Arc::new(HttpTransport::new(config.http_timeout(), &config.http.user_agent, config.http.max_body_bytes)?);
        let hub_api: Arc<dyn HubApi> = Arc::new(HttpHub::new(config.http_timeout()));
        Self::assemble(config, stores, transport, hub_api, sender_from_env())
    }

    /// Wire components over explicit collaborators. Tests pass fixtures here.
    pub fn assemble(
        config: AppConfig,
        stores: Stores,
        transport: Arc<dyn Transport>,
        hub_api: Arc<dyn HubApi>,
        sender: Arc<dyn PushSender>,
    ) -> anyhow::Result<Self> {
        crate::metrics::ensure_described();
        let sources = config.sources()?;

        let adapter = Arc::new(SourceAdapter::new(
            transport.clone(),
            stores.cursors.clone(),
            stores.queue.clone(),
            config.cursor_ttl(),
        ));
        let ingest: Arc<dyn IngestSource> = adapter.clone();

        let scheduler = Arc::new(PollScheduler::new(
            config.scheduler_cfg(),
            config.youtube_specs(),
            config.rss_specs(),
            Arc::new(Throttle::new(&config.throttle)),
            ingest.clone(),
        ));

        let push = Arc::new(PushFanout::new(config.fanout_cfg(), stores.registrations.clone(), sender));
        let realtime = Arc::new(RealtimeHub::new(config.realtime_cfg(), stores.story_log.clone()));

        let pipeline = Arc::new(
            Pipeline::new(
                Extractor::new(config.extract_cfg(), Some(transport)),
                Canonicalizer::new(
                    stores.signatures.clone(),
                    stores.feed.clone(),
                    config.feed.max_len,
                    config.signature_ttl(),
                ),
            )
            .with_consumer(push.clone())
            .with_consumer(realtime.clone()),
        );

        let hub = Arc::new(SubscriptionManager::new(
            config.hub_cfg(),
            hub_api,
            stores.subscriptions.clone(),
        ));
        let webhook = Arc::new(
            WebhookState::new(
                ingest,
                stores.subscriptions.clone(),
                hub.clone(),
                config.websub.secret.clone(),
                &sources,
            )
            .with_fallback_window(config.websub.fallback_window_hours),
        );

        tracing::info!(
            youtube = config.youtube.len(),
            rss = config.rss.len(),
            signed_webhooks = config.websub.secret.is_some(),
            "services assembled"
        );

        Ok(Self {
            config,
            stores,
            adapter,
            scheduler,
            pipeline,
            push,
            realtime,
            hub,
            webhook,
        })
    }

    pub fn router(&self) -> Router {
        crate::api::create_router(self)
    }

    /// Scheduler loop, queue workers and lease renewal; all stop on `shutdown`.
    pub fn spawn_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = spawn_workers(
            self.config.queue.workers,
            self.stores.queue.clone(),
            self.pipeline.clone(),
            shutdown.clone(),
        );

        let scheduler = self.scheduler.clone();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { scheduler.run(token).await }));

        handles.push(spawn_lease_renewal(
            self.hub.clone(),
            Duration::from_secs(self.config.websub.renew_every_seconds),
            shutdown,
        ));
        handles
    }
}

/// Resolves on Ctrl-C, or on SIGTERM where the platform has it.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Cancel the background tasks and wait up to `grace` for them to stop.
/// Returns how many finished in time; stragglers are aborted.
pub async fn wind_down(shutdown: &CancellationToken, handles: Vec<JoinHandle<()>>, grace: Duration) -> usize {
    shutdown.cancel();
    let total = handles.len();
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

    match tokio::time::timeout(grace, join_all(handles)).await {
        Ok(results) => {
            let failed = results.iter().filter(|r| r.is_err()).count();
            if failed > 0 {
                tracing::warn!(failed, "background tasks ended abnormally");
            }
            tracing::info!(tasks = total, "background tasks stopped");
            total
        }
        Err(_) => {
            let pending = aborts.iter().filter(|a| !a.is_finished()).count();
            for a in &aborts {
                a.abort();
            }
            tracing::warn!(pending, grace_ms = grace.as_millis() as u64, "background tasks aborted after grace period");
            total - pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wind_down_cancels_and_joins_cooperative_tasks() {
        let shutdown = CancellationToken::new();
        let handles: Vec<JoinHandle<()>> = (0..3)
            .map(|_| {
                let token = shutdown.clone();
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect();

        let stopped = wind_down(&shutdown, handles, Duration::from_secs(5)).await;
        assert_eq!(stopped, 3);
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn wind_down_aborts_tasks_that_ignore_the_token() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let polite = tokio::spawn(async move { token.cancelled().await });
        let stubborn = tokio::spawn(std::future::pending::<()>());
        let stubborn_abort = stubborn.abort_handle();

        let stopped = wind_down(&shutdown, vec![polite, stubborn], Duration::from_secs(1)).await;
        assert_eq!(stopped, 1);
        for _ in 0..10 {
            if stubborn_abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(stubborn_abort.is_finished());
    }
}
