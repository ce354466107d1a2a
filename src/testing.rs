//! In-memory doubles for asserting on metrics and logs.
//!
//! Used by the crate's own tests and by embedders that want to check what a
//! handler emitted without installing a global recorder.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;

use crate::context::RequestContext;
use crate::observability::logging::{LogEntry, LogLevel, LogSink};
use crate::observability::metrics::{ContextMetrics, InstrumentKey};
use crate::observability::{Instrumentation, Tracer, W3cTracer};

/// Records every emission keyed by `(name, tags)`.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<InstrumentKey, i64>,
    timers: DashMap<InstrumentKey, Vec<Duration>>,
    histograms: DashMap<InstrumentKey, Vec<Duration>>,
    gauges: DashMap<InstrumentKey, f64>,
}

fn tags_match(key: &InstrumentKey, name: &str, tags: &[(&str, &str)]) -> bool {
    key.name == name
        && tags
            .iter()
            .all(|(k, v)| key.tags.iter().any(|(tk, tv)| tk == k && tv == v))
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of every counter named `name` whose tags include all of `tags`.
    pub fn counter(&self, name: &str, tags: &[(&str, &str)]) -> i64 {
        self.counters
            .iter()
            .filter(|e| tags_match(e.key(), name, tags))
            .map(|e| *e.value())
            .sum()
    }

    /// Recorded timer samples for `name` whose tags include all of `tags`.
    pub fn timer_samples(&self, name: &str, tags: &[(&str, &str)]) -> Vec<Duration> {
        self.timers
            .iter()
            .filter(|e| tags_match(e.key(), name, tags))
            .flat_map(|e| e.value().clone())
            .collect()
    }

    pub fn histogram_samples(&self, name: &str, tags: &[(&str, &str)]) -> Vec<Duration> {
        self.histograms
            .iter()
            .filter(|e| tags_match(e.key(), name, tags))
            .flat_map(|e| e.value().clone())
            .collect()
    }

    pub fn gauge_value(&self, name: &str, tags: &[(&str, &str)]) -> Option<f64> {
        self.gauges
            .iter()
            .find(|e| tags_match(e.key(), name, tags))
            .map(|e| *e.value())
    }

    /// Every distinct tag set `name` was emitted under, across all kinds.
    pub fn tag_sets(&self, name: &str) -> Vec<Vec<(String, String)>> {
        let mut sets: Vec<Vec<(String, String)>> = Vec::new();
        let keys = self
            .counters
            .iter()
            .map(|e| e.key().clone())
            .chain(self.timers.iter().map(|e| e.key().clone()))
            .chain(self.histograms.iter().map(|e| e.key().clone()))
            .chain(self.gauges.iter().map(|e| e.key().clone()));
        for key in keys.filter(|k| k.name == name) {
            if !sets.contains(&key.tags) {
                sets.push(key.tags);
            }
        }
        sets
    }
}

impl ContextMetrics for InMemoryMetrics {
    fn inc_counter(&self, ctx: &RequestContext, name: &str, delta: i64) {
        *self.counters.entry(InstrumentKey::new(ctx, name)).or_insert(0) += delta;
    }

    fn record_timer(&self, ctx: &RequestContext, name: &str, dur: Duration) {
        self.timers
            .entry(InstrumentKey::new(ctx, name))
            .or_default()
            .push(dur);
    }

    fn record_histogram_duration(&self, ctx: &RequestContext, name: &str, dur: Duration) {
        self.histograms
            .entry(InstrumentKey::new(ctx, name))
            .or_default()
            .push(dur);
    }

    fn gauge(&self, ctx: &RequestContext, name: &str, value: f64) {
        self.gauges.insert(InstrumentKey::new(ctx, name), value);
    }
}

/// Keeps every log entry in memory.
#[derive(Debug, Default)]
pub struct CapturingSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn entries_with_message(&self, message: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.message == message)
            .collect()
    }

    pub fn entries_at(&self, level: LogLevel) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.level == level)
            .collect()
    }
}

impl LogSink for CapturingSink {
    fn write(&self, entry: &LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
    }
}

/// Instrumentation wired to in-memory doubles, plus handles to inspect them.
pub struct TestInstrumentation {
    pub instrumentation: Instrumentation,
    pub metrics: Arc<InMemoryMetrics>,
    pub logs: Arc<CapturingSink>,
}

impl TestInstrumentation {
    pub fn new() -> Self {
        Self::with_tracer(Arc::new(W3cTracer))
    }

    pub fn with_tracer(tracer: Arc<dyn Tracer>) -> Self {
        let metrics = Arc::new(InMemoryMetrics::new());
        let logs = Arc::new(CapturingSink::new());
        let instrumentation = Instrumentation::new(metrics.clone(), logs.clone(), tracer);
        Self {
            instrumentation,
            metrics,
            logs,
        }
    }
}

impl Default for TestInstrumentation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_filters_by_tag_subset() {
        let metrics = InMemoryMetrics::new();
        let base = RequestContext::background().with_scope_tags([("client", "bar")]);
        metrics.inc_counter(&base.with_scope_tags([("status", "200")]), "client.status", 1);
        metrics.inc_counter(&base.with_scope_tags([("status", "500")]), "client.status", 1);

        assert_eq!(metrics.counter("client.status", &[]), 2);
        assert_eq!(metrics.counter("client.status", &[("status", "200")]), 1);
        assert_eq!(metrics.counter("client.status", &[("status", "404")]), 0);
        assert_eq!(metrics.tag_sets("client.status").len(), 2);
    }
}
