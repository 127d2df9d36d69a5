// src/ingest/throttle.rs
//! Per-domain minimum-interval gate.
//!
//! `wait(domain)` returns once at least the configured gap has passed since the
//! previous call for the same domain. The first call for a domain never blocks,
//! and a domain without a rule (and no `default` rule) is never throttled.
//!
//! The next slot is reserved under the lock before sleeping, so concurrent
//! callers for one domain are spaced out rather than released together.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_RULE: &str = "default";

#[derive(Debug, Default)]
pub struct Throttle {
    rules: HashMap<String, Duration>,
    default_gap: Option<Duration>,
    last_hit: Mutex<HashMap<String, Instant>>,
}

impl Throttle {
    /// Build from a `domain -> seconds` table. The `default` key applies to any
    /// domain without its own rule. Non-positive gaps are ignored.
    pub fn new(table: &HashMap<String, f64>) -> Self {
        let mut rules = HashMap::new();
        let mut default_gap = None;
        for (domain, secs) in table {
            if !secs.is_finite() || *secs <= 0.0 {
                continue;
            }
            let gap = Duration::from_secs_f64(*secs);
            let key = domain.trim().to_ascii_lowercase();
            if key == DEFAULT_RULE {
                default_gap = Some(gap);
            } else {
                rules.insert(key, gap);
            }
        }
        Self {
            rules,
            default_gap,
            last_hit: Mutex::new(HashMap::new()),
        }
    }

    /// Gap for a domain: exact host, then parent domains, then `default`.
    pub fn gap_for(&self, domain: &str) -> Option<Duration> {
        let domain = domain.trim().to_ascii_lowercase();
        let mut candidate = domain.as_str();
        loop {
            if let Some(gap) = self.rules.get(candidate) {
                return Some(*gap);
            }
            match candidate.split_once('.') {
                Some((_, parent)) if parent.contains('.') => candidate = parent,
                _ => break,
            }
        }
        self.default_gap
    }

    pub async fn wait(&self, domain: &str) {
        let domain = domain.trim().to_ascii_lowercase();
        let Some(gap) = self.gap_for(&domain) else {
            return;
        };
        let delay = {
            let mut last = self.last_hit.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let slot = match last.get(&domain) {
                Some(prev) if *prev + gap > now => *prev + gap,
                _ => now,
            };
            last.insert(domain.clone(), slot);
            slot.saturating_duration_since(now)
        };
        if !delay.is_zero() {
            tracing::debug!(target: "scheduler", domain = %domain, delay_ms = delay.as_millis() as u64, "throttle wait");
            tokio::time::sleep(delay).await;
        }
    }
}
