// src/metrics.rs
use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static DESCRIBED: OnceCell<()> = OnceCell::new();

/// Register help text for every pipeline metric. Safe to call repeatedly.
pub fn ensure_described() {
    DESCRIBED.get_or_init(|| {
        describe_counter!("ingest_events_total", "Adapter events produced from upstream feeds");
        describe_counter!("ingest_not_modified_total", "Conditional fetches answered 304");
        describe_counter!("ingest_provider_errors_total", "Source fetch/parse failures");
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds");
        describe_counter!("queue_enqueued_total", "Jobs accepted by the dispatch queue");
        describe_counter!("queue_duplicate_total", "Enqueue calls for a job id already pending");
        describe_counter!("queue_expired_total", "Jobs dropped after their time-to-live");
        describe_counter!("dedup_admitted_total", "Stories admitted to the feed");
        describe_counter!("dedup_suppressed_total", "Events suppressed as duplicates");
        describe_gauge!("feed_len", "Current length of the canonical feed");
        describe_counter!("webhook_notify_total", "Accepted WebSub notifications");
        describe_counter!("webhook_auth_failures_total", "WebSub notifications with a bad signature");
        describe_counter!("push_sent_total", "Push notifications delivered");
        describe_counter!("push_skipped_total", "Push notifications skipped or failed");
        describe_counter!("realtime_published_total", "Stories published to realtime clients");
        describe_histogram!("scheduler_cycle_ms", "Poll cycle duration in milliseconds");
        describe_gauge!("scheduler_last_cycle_ts", "Unix time of the last finished poll cycle");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Fails if another recorder is
    /// already installed in this process.
    pub fn init() -> anyhow::Result<Self> {
        // Use default buckets to avoid API differences across crate versions.
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
