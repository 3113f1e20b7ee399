//! Lightweight runtime counters. Nothing here is shipped anywhere — the
//! counters exist so operators (and tests) can see what the engine did.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Telemetry {
    pub media_included: AtomicU64,
    pub media_dropped_unsupported: AtomicU64,
    pub media_dropped_over_cap: AtomicU64,
    pub search_degraded_keyword_only: AtomicU64,
    pub context_layer_failures: AtomicU64,
    pub tool_calls: AtomicU64,
    pub tool_errors: AtomicU64,
    pub tool_latency_ms_total: AtomicU64,
    pub windows_closed: AtomicU64,
    pub episodes_created: AtomicU64,
    pub facts_stored: AtomicU64,
    pub fact_duplicates_merged: AtomicU64,
    pub fact_conflicts_resolved: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub media_included: u64,
    pub media_dropped_unsupported: u64,
    pub media_dropped_over_cap: u64,
    pub search_degraded_keyword_only: u64,
    pub context_layer_failures: u64,
    pub tool_calls: u64,
    pub tool_errors: u64,
    pub tool_latency_ms_total: u64,
    pub windows_closed: u64,
    pub episodes_created: u64,
    pub facts_stored: u64,
    pub fact_duplicates_merged: u64,
    pub fact_conflicts_resolved: u64,
}

impl Telemetry {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            media_included: self.media_included.load(Ordering::Relaxed),
            media_dropped_unsupported: self.media_dropped_unsupported.load(Ordering::Relaxed),
            media_dropped_over_cap: self.media_dropped_over_cap.load(Ordering::Relaxed),
            search_degraded_keyword_only: self
                .search_degraded_keyword_only
                .load(Ordering::Relaxed),
            context_layer_failures: self.context_layer_failures.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            tool_errors: self.tool_errors.load(Ordering::Relaxed),
            tool_latency_ms_total: self.tool_latency_ms_total.load(Ordering::Relaxed),
            windows_closed: self.windows_closed.load(Ordering::Relaxed),
            episodes_created: self.episodes_created.load(Ordering::Relaxed),
            facts_stored: self.facts_stored.load(Ordering::Relaxed),
            fact_duplicates_merged: self.fact_duplicates_merged.load(Ordering::Relaxed),
            fact_conflicts_resolved: self.fact_conflicts_resolved.load(Ordering::Relaxed),
        }
    }
}
