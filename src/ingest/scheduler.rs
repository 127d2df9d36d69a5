// src/ingest/scheduler.rs
//! Cyclic poll driver.
//!
//! Each cycle shuffles the active YouTube and RSS lists, applies the per-run
//! caps, then walks the sources sequentially: throttle, ingest, spread. A
//! failing source is counted and logged; it never aborts the cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{gauge, histogram};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ingest::adapter::IngestSource;
use crate::ingest::throttle::Throttle;
use crate::ingest::types::SourceSpec;

#[derive(Debug, Clone)]
pub struct SchedulerCfg {
    pub youtube_enabled: bool,
    pub rss_enabled: bool,
    pub poll_every: Duration,
    pub jitter: Duration,
    pub spread: Duration,
    /// Freshness window; `<= 0` disables the cutoff.
    pub published_after_hours: i64,
    pub max_youtube_per_run: Option<usize>,
    pub max_rss_per_run: Option<usize>,
    pub idle_sleep: Duration,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            youtube_enabled: true,
            rss_enabled: true,
            poll_every: Duration::from_secs(10 * 60),
            jitter: Duration::from_secs(30),
            spread: Duration::from_millis(500),
            published_after_hours: 24,
            max_youtube_per_run: None,
            max_rss_per_run: None,
            idle_sleep: Duration::from_secs(3600),
        }
    }
}

/// Per-cycle aggregate. Failures are counted here instead of propagated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub sources: usize,
    pub ok: usize,
    pub not_modified: usize,
    pub failed: usize,
    pub events: usize,
    pub enqueued: usize,
    pub duplicates: usize,
}

pub struct PollScheduler {
    cfg: SchedulerCfg,
    youtube: Vec<SourceSpec>,
    rss: Vec<SourceSpec>,
    throttle: Arc<Throttle>,
    source: Arc<dyn IngestSource>,
}

impl PollScheduler {
    pub fn new(
        cfg: SchedulerCfg,
        youtube: Vec<SourceSpec>,
        rss: Vec<SourceSpec>,
        throttle: Arc<Throttle>,
        source: Arc<dyn IngestSource>,
    ) -> Self {
        Self {
            cfg,
            youtube,
            rss,
            throttle,
            source,
        }
    }

    /// True when no source would be polled (empty lists or both toggles off).
    pub fn is_idle(&self) -> bool {
        (!self.cfg.youtube_enabled || self.youtube.is_empty())
            && (!self.cfg.rss_enabled || self.rss.is_empty())
    }

    /// Shuffled, capped order for one cycle: YouTube first, then RSS.
    pub fn plan(&self) -> Vec<SourceSpec> {
        let mut rng = rand::rng();
        let mut pick = |enabled: bool, list: &[SourceSpec], cap: Option<usize>| {
            if !enabled {
                return Vec::new();
            }
            let mut list = list.to_vec();
            list.shuffle(&mut rng);
            if let Some(n) = cap {
                list.truncate(n);
            }
            list
        };
        let mut out = pick(
            self.cfg.youtube_enabled,
            &self.youtube,
            self.cfg.max_youtube_per_run,
        );
        out.extend(pick(self.cfg.rss_enabled, &self.rss, self.cfg.max_rss_per_run));
        out
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.cfg.published_after_hours > 0)
            .then(|| now - chrono::Duration::hours(self.cfg.published_after_hours))
    }

    pub async fn run_cycle(&self) -> CycleStats {
        let t0 = Instant::now();
        let plan = self.plan();
        let mut stats = CycleStats {
            sources: plan.len(),
            ..CycleStats::default()
        };

        for (i, spec) in plan.iter().enumerate() {
            self.throttle.wait(&spec.domain()).await;
            let cutoff = self.cutoff(Utc::now());
            match self.source.ingest(spec, cutoff).await {
                Ok(report) => {
                    stats.ok += 1;
                    if report.not_modified {
                        stats.not_modified += 1;
                    }
                    stats.events += report.events;
                    stats.enqueued += report.enqueued;
                    stats.duplicates += report.duplicates;
                }
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(target: "scheduler", source = %spec.key(), error = %e, "source failed, skipped this cycle");
                }
            }
            if i + 1 < plan.len() && !self.cfg.spread.is_zero() {
                tokio::time::sleep(self.cfg.spread).await;
            }
        }

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("scheduler_cycle_ms").record(ms);
        gauge!("scheduler_last_cycle_ts").set(Utc::now().timestamp() as f64);
        tracing::info!(
            target: "scheduler",
            sources = stats.sources,
            ok = stats.ok,
            not_modified = stats.not_modified,
            failed = stats.failed,
            enqueued = stats.enqueued,
            elapsed_ms = ms as u64,
            "poll cycle finished"
        );
        stats
    }

    /// Loop until `shutdown` fires. An idle configuration parks in a long
    /// sleep instead of spinning.
    pub async fn run(&self, shutdown: CancellationToken) {
        if self.is_idle() {
            tracing::info!(target: "scheduler", "no active sources; parking");
        }
        loop {
            let wait = if self.is_idle() {
                self.cfg.idle_sleep
            } else {
                let started = Instant::now();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.run_cycle() => {}
                }
                let jitter = random_jitter(self.cfg.jitter);
                next_sleep(self.cfg.poll_every, jitter, started.elapsed())
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::info!(target: "scheduler", "scheduler stopped");
    }
}

fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let ms = rand::rng().random_range(0..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

/// `max(0, poll_every + jitter - elapsed)`
pub fn next_sleep(poll_every: Duration, jitter: Duration, elapsed: Duration) -> Duration {
    (poll_every + jitter).saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::ingest::adapter::IngestReport;
    use crate::ingest::types::StoryKind;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Option<DateTime<Utc>>, Instant)>>,
        failing: Vec<String>,
    }

    #[async_trait]
    impl IngestSource for Recorder {
        async fn ingest(
            &self,
            spec: &SourceSpec,
            cutoff: Option<DateTime<Utc>>,
        ) -> Result<IngestReport, IngestError> {
            let key = spec.key();
            self.calls
                .lock()
                .unwrap()
                .push((key.clone(), cutoff, Instant::now()));
            if self.failing.contains(&key) {
                return Err(IngestError::fetch(spec.feed_url(), "boom"));
            }
            Ok(IngestReport {
                source: key,
                events: 1,
                enqueued: 1,
                ..IngestReport::default()
            })
        }
    }

    fn rss(host: &str) -> SourceSpec {
        SourceSpec::rss(format!("https://{host}/feed"), StoryKind::News)
    }

    fn cfg() -> SchedulerCfg {
        SchedulerCfg {
            spread: Duration::ZERO,
            jitter: Duration::ZERO,
            ..SchedulerCfg::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_source_does_not_abort_cycle() {
        let rec = Arc::new(Recorder {
            failing: vec!["rss:b.test".into()],
            ..Recorder::default()
        });
        let sched = PollScheduler::new(
            cfg(),
            vec![SourceSpec::youtube("UC1")],
            vec![rss("a.test"), rss("b.test"), rss("c.test")],
            Arc::new(Throttle::default()),
            rec.clone(),
        );
        let stats = sched.run_cycle().await;
        assert_eq!(stats.sources, 4);
        assert_eq!(stats.ok, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.enqueued, 3);
        let calls = rec.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        // YouTube list is walked before RSS
        assert_eq!(calls[0].0, "youtube:UC1");
        assert!(calls.iter().all(|(_, cut, _)| cut.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn caps_toggles_and_disabled_cutoff() {
        let rec = Arc::new(Recorder::default());
        let sched = PollScheduler::new(
            SchedulerCfg {
                youtube_enabled: false,
                max_rss_per_run: Some(2),
                published_after_hours: 0,
                ..cfg()
            },
            vec![SourceSpec::youtube("UC1")],
            vec![rss("a.test"), rss("b.test"), rss("c.test")],
            Arc::new(Throttle::default()),
            rec.clone(),
        );
        let stats = sched.run_cycle().await;
        assert_eq!(stats.sources, 2);
        let calls = rec.calls.lock().unwrap();
        assert!(calls.iter().all(|(k, cut, _)| k.starts_with("rss:") && cut.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn same_domain_sources_are_throttled() {
        let rec = Arc::new(Recorder::default());
        let table = HashMap::from([("site.test".to_string(), 5.0)]);
        let mut a = rss("site.test");
        a.name = Some("a".into());
        let mut b = rss("site.test");
        b.name = Some("b".into());
        let sched = PollScheduler::new(cfg(), vec![], vec![a, b], Arc::new(Throttle::new(&table)), rec.clone());
        sched.run_cycle().await;
        let calls = rec.calls.lock().unwrap();
        assert!(calls[1].2 - calls[0].2 >= Duration::from_secs(5));
    }

    #[test]
    fn next_sleep_subtracts_elapsed_and_floors_at_zero() {
        let s = next_sleep(Duration::from_secs(600), Duration::from_secs(10), Duration::from_secs(100));
        assert_eq!(s, Duration::from_secs(510));
        let s = next_sleep(Duration::from_secs(60), Duration::ZERO, Duration::from_secs(100));
        assert_eq!(s, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_run_stops_on_shutdown() {
        let sched = PollScheduler::new(
            cfg(),
            vec![],
            vec![],
            Arc::new(Throttle::default()),
            Arc::new(Recorder::default()),
        );
        assert!(sched.is_idle());
        let token = CancellationToken::new();
        let stopper = token.clone();
        let handle = tokio::spawn(async move { sched.run(token).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        stopper.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should stop")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_between_cycles_is_interruptible() {
        let rec = Arc::new(Recorder::default());
        let sched = PollScheduler::new(
            cfg(),
            vec![],
            vec![rss("a.test")],
            Arc::new(Throttle::default()),
            rec.clone(),
        );
        let token = CancellationToken::new();
        let stopper = token.clone();
        let handle = tokio::spawn(async move { sched.run(token).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        stopper.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should stop")
            .unwrap();
        assert_eq!(rec.calls.lock().unwrap().len(), 1);
    }
}
