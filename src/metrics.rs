// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the indexing pipeline.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `indexing_pipeline_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `stage`: prepare, index, save, scheduler
//! - `engine`: google, bing
//! - `result`: SUCCESS, RATE_LIMITED, PERMISSION_DENIED, INVALID, TRANSIENT_ERROR

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Jobs published by the scheduler, by result (scheduled, skipped, failed)
pub fn record_jobs_scheduled(status: &str, count: usize) {
    counter!(
        "indexing_pipeline_jobs_total",
        "status" => status.to_string()
    )
    .increment(count as u64);
}

/// Entries claimed into batches by L1
pub fn record_entries_claimed(engine: &str, count: usize) {
    counter!(
        "indexing_pipeline_entries_claimed_total",
        "engine" => engine.to_string()
    )
    .increment(count as u64);
}

/// Entries that lost the claim CAS to another worker or a newer event
pub fn record_claim_conflicts(count: usize) {
    counter!("indexing_pipeline_claim_conflicts_total").increment(count as u64);
}

pub fn record_batch_published(engine: &str, size: usize) {
    counter!(
        "indexing_pipeline_batches_total",
        "engine" => engine.to_string()
    )
    .increment(1);
    histogram!(
        "indexing_pipeline_batch_size",
        "engine" => engine.to_string()
    )
    .record(size as f64);
}

/// One indexing API call
pub fn record_api_call(engine: &str, urls: usize, duration: Duration) {
    counter!(
        "indexing_pipeline_api_calls_total",
        "engine" => engine.to_string()
    )
    .increment(1);
    histogram!(
        "indexing_pipeline_api_call_seconds",
        "engine" => engine.to_string()
    )
    .record(duration.as_secs_f64());
    histogram!(
        "indexing_pipeline_api_call_urls",
        "engine" => engine.to_string()
    )
    .record(urls as f64);
}

/// Per-URL submission result
pub fn record_url_result(engine: &str, result: &str) {
    counter!(
        "indexing_pipeline_url_results_total",
        "engine" => engine.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// URLs refused locally because the daily quota ran out
pub fn record_quota_rejections(engine: &str, count: usize) {
    counter!(
        "indexing_pipeline_quota_rejections_total",
        "engine" => engine.to_string()
    )
    .increment(count as u64);
}

/// L3 transitions applied, by resolution (completed, failed, requeued)
pub fn record_outcome_applied(resolution: &str) {
    counter!(
        "indexing_pipeline_outcomes_applied_total",
        "resolution" => resolution.to_string()
    )
    .increment(1);
}

/// Outcomes dropped because a newer event or claim owns the entry
pub fn record_outcome_superseded() {
    counter!("indexing_pipeline_outcomes_superseded_total").increment(1);
}

/// Batch URLs skipped before submission because their claim moved on
pub fn record_stale_urls_skipped(engine: &str, count: usize) {
    counter!(
        "indexing_pipeline_stale_urls_skipped_total",
        "engine" => engine.to_string()
    )
    .increment(count as u64);
}

pub fn record_dead_letter(stage: &str, reason: &str) {
    counter!(
        "indexing_pipeline_dead_letters_total",
        "stage" => stage.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Message handled by a stage worker, by status (acked, dead_lettered, retry)
pub fn record_message(stage: &str, status: &str) {
    counter!(
        "indexing_pipeline_messages_total",
        "stage" => stage.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_reclaimed(stage: &str, count: usize) {
    counter!(
        "indexing_pipeline_reclaimed_total",
        "stage" => stage.to_string()
    )
    .increment(count as u64);
}

/// Stream read or storage failure in a worker loop
pub fn record_stage_error(stage: &str, kind: &str) {
    counter!(
        "indexing_pipeline_stage_errors_total",
        "stage" => stage.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_stage_latency(stage: &str, duration: Duration) {
    histogram!(
        "indexing_pipeline_stage_seconds",
        "stage" => stage.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Pending + undelivered messages in the batches stream
pub fn set_batch_backlog(backlog: u64) {
    gauge!("indexing_pipeline_batch_backlog").set(backlog as f64);
}

pub fn set_backpressure_level(level: u8) {
    gauge!("indexing_pipeline_backpressure_level").set(level as f64);
}

pub fn set_pipeline_state(state: &str) {
    // Reset the other states so exactly one series reads 1
    for s in ["Created", "Connecting", "Running", "ShuttingDown", "Stopped"] {
        let value = if s == state { 1.0 } else { 0.0 };
        gauge!("indexing_pipeline_state", "state" => s).set(value);
    }
}

pub fn set_workers_running(stage: &str, count: usize) {
    gauge!(
        "indexing_pipeline_workers_running",
        "stage" => stage.to_string()
    )
    .set(count as f64);
}

/// A timing guard that records stage latency on drop
pub struct LatencyTimer {
    stage: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_stage_latency(self.stage, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_counters_do_not_panic_without_recorder() {
        record_jobs_scheduled("scheduled", 3);
        record_entries_claimed("google", 100);
        record_claim_conflicts(2);
        record_batch_published("bing", 50);
        record_api_call("google", 100, Duration::from_millis(120));
        record_url_result("google", "SUCCESS");
        record_quota_rejections("bing", 5);
        record_outcome_applied("completed");
        record_outcome_superseded();
        record_stale_urls_skipped("google", 3);
        record_dead_letter("index", "malformed");
        record_message("save", "acked");
        record_reclaimed("prepare", 1);
        record_stage_error("prepare", "read");
    }

    #[test]
    fn test_gauges() {
        set_batch_backlog(42);
        set_backpressure_level(2);
        set_pipeline_state("Running");
        set_workers_running("index", 4);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = crate::LatencyTimer::new("save");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }

    #[test]
    fn test_url_results_are_labelled() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_url_result("google", "RATE_LIMITED");
            record_url_result("google", "RATE_LIMITED");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let total: u64 = snapshot
            .iter()
            .filter(|(key, _, _, _)| key.key().name() == "indexing_pipeline_url_results_total")
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(v) => *v,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 2);
    }
}
