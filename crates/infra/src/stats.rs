//! Metrics sink.
//!
//! A thin trait so deployments can plug in their own metrics backend. The
//! default sink emits `tracing` debug events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Timer around one bulk store call.
pub const STORE_TIMER: &str = "jobsdb.store";
/// Jobs committed by the writer.
pub const JOBS_STORED: &str = "jobsdb.jobs_stored";
/// Datasets materialised by the handle.
pub const DATASETS_CREATED: &str = "jobsdb.datasets_created";

pub trait StatsSink: Send + Sync {
    fn count(&self, name: &'static str, value: u64);

    fn record_duration(&self, name: &'static str, elapsed: Duration);
}

/// Records the elapsed time into its sink when dropped.
#[must_use = "the timer records when dropped"]
pub struct TimerGuard {
    sink: Arc<dyn StatsSink>,
    name: &'static str,
    started: Instant,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.sink.record_duration(self.name, self.started.elapsed());
    }
}

/// Start a timer on `sink`.
pub fn start_timer(sink: &Arc<dyn StatsSink>, name: &'static str) -> TimerGuard {
    TimerGuard {
        sink: Arc::clone(sink),
        name,
        started: Instant::now(),
    }
}

/// Sink that logs every observation at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStats;

impl StatsSink for TracingStats {
    fn count(&self, name: &'static str, value: u64) {
        tracing::debug!(metric = name, value, "counter");
    }

    fn record_duration(&self, name: &'static str, elapsed: Duration) {
        tracing::debug!(metric = name, elapsed_ms = elapsed.as_millis() as u64, "timer");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn count(&self, _name: &'static str, _value: u64) {}

    fn record_duration(&self, _name: &'static str, _elapsed: Duration) {}
}

/// Sink that keeps observations in memory.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryStats {
    counters: Mutex<HashMap<&'static str, u64>>,
    timings: Mutex<HashMap<&'static str, usize>>,
}

impl InMemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.get(name).copied().unwrap_or(0)
    }

    /// Number of timings recorded under `name`.
    pub fn timings(&self, name: &str) -> usize {
        let timings = self.timings.lock().unwrap_or_else(|e| e.into_inner());
        timings.get(name).copied().unwrap_or(0)
    }
}

impl StatsSink for InMemoryStats {
    fn count(&self, name: &'static str, value: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *counters.entry(name).or_default() += value;
    }

    fn record_duration(&self, name: &'static str, _elapsed: Duration) {
        let mut timings = self.timings.lock().unwrap_or_else(|e| e.into_inner());
        *timings.entry(name).or_default() += 1;
    }
}
