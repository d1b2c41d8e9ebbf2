//! Crawl statistics
//!
//! Session events are counted in a `StatsSink` under
//! `scrapy-zyte-api/sessions/pools/<pool>/<phase>/<outcome>` and mirrored to
//! the `zyte_api_session_events_total` Prometheus counter.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Monotonic counter store.
pub trait StatsSink: Send + Sync {
    fn inc_value(&self, key: &str);
}

/// In-memory stats, the crawl's stats collector.
#[derive(Debug, Default)]
pub struct MemoryStats {
    values: Mutex<BTreeMap<String, u64>>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_value(&self, key: &str) -> Option<u64> {
        self.lock().get(key).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.lock().clone()
    }

    /// Counters whose key starts with `prefix`.
    pub fn with_prefix(&self, prefix: &str) -> BTreeMap<String, u64> {
        self.lock()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), *value))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, u64>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StatsSink for MemoryStats {
    fn inc_value(&self, key: &str) {
        *self.lock().entry(key.to_string()).or_insert(0) += 1;
    }
}

pub const SESSION_STATS_PREFIX: &str = "scrapy-zyte-api/sessions/pools";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Use,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Use => "use",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    CheckPassed,
    CheckFailed,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::CheckPassed => "check-passed",
            Outcome::CheckFailed => "check-failed",
            Outcome::Failed => "failed",
        }
    }
}

/// Stats key for a session event.
pub fn session_key(pool: &str, phase: Phase, outcome: Outcome) -> String {
    format!(
        "{SESSION_STATS_PREFIX}/{pool}/{}/{}",
        phase.as_str(),
        outcome.as_str()
    )
}

/// Count a session event in `sink` and in Prometheus.
pub(crate) fn record(sink: &dyn StatsSink, pool: &str, phase: Phase, outcome: Outcome) {
    sink.inc_value(&session_key(pool, phase, outcome));
    metrics::counter!(
        "zyte_api_session_events_total",
        "pool" => pool.to_string(),
        "phase" => phase.as_str(),
        "outcome" => outcome.as_str(),
    )
    .increment(1);
}
