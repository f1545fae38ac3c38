//! Metrics and observability utilities
//!
//! Prometheus metrics for the ingestion pipeline with standardized naming.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Metrics prefix for all PaperIntake metrics
pub const METRICS_PREFIX: &str = "paperintake";

/// Buckets for extraction latency (full-text PDF parsing is slow)
pub const EXTRACTION_BUCKETS: &[f64] = &[
    0.5,    // 500ms
    1.0,    // 1s
    2.5,    // 2.5s
    5.0,    // 5s
    10.0,   // 10s
    20.0,   // 20s
    30.0,   // 30s
    60.0,   // 1m
    120.0,  // 2m
    300.0,  // 5m
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_jobs_total", METRICS_PREFIX),
        Unit::Count,
        "Queue messages handled, by outcome"
    );

    describe_histogram!(
        format!("{}_job_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end job latency in seconds"
    );

    describe_histogram!(
        format!("{}_extraction_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Extraction service latency in seconds"
    );

    describe_counter!(
        format!("{}_papers_created_total", METRICS_PREFIX),
        Unit::Count,
        "Papers created"
    );

    describe_counter!(
        format!("{}_papers_matched_total", METRICS_PREFIX),
        Unit::Count,
        "Jobs resolved to an existing paper, by strategy"
    );

    describe_counter!(
        format!("{}_sections_total", METRICS_PREFIX),
        Unit::Count,
        "Sections processed, by result"
    );

    describe_counter!(
        format!("{}_enrichment_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Bibliographic lookups, by source and status"
    );

    describe_counter!(
        format!("{}_failures_handled_total", METRICS_PREFIX),
        Unit::Count,
        "Failure handler invocations, by stage"
    );

    describe_gauge!(
        format!("{}_extraction_healthy", METRICS_PREFIX),
        Unit::Count,
        "1 when the extraction service reports healthy"
    );

    describe_counter!(
        format!("{}_queue_messages_received_total", METRICS_PREFIX),
        Unit::Count,
        "Messages received from the queue"
    );

    tracing::info!("Metrics registered");
}

/// Record a handled job
pub fn record_job(duration_secs: f64, outcome: &str) {
    counter!(
        format!("{}_jobs_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_job_duration_seconds", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}

/// Record one extraction call
pub fn record_extraction(duration_secs: f64, success: bool) {
    let status = if success { "success" } else { "error" };
    histogram!(
        format!("{}_extraction_duration_seconds", METRICS_PREFIX),
        "status" => status
    )
    .record(duration_secs);
}

/// Record how a paper was resolved ("created" or the matching strategy)
pub fn record_resolution(resolution: &str) {
    if resolution == "created" {
        counter!(format!("{}_papers_created_total", METRICS_PREFIX)).increment(1);
    } else {
        counter!(
            format!("{}_papers_matched_total", METRICS_PREFIX),
            "strategy" => resolution.to_string()
        )
        .increment(1);
    }
}

/// Record section persistence results for one job
pub fn record_sections(inserted: usize, skipped: usize, failed: usize) {
    for (result, count) in [("inserted", inserted), ("skipped", skipped), ("failed", failed)] {
        if count > 0 {
            counter!(
                format!("{}_sections_total", METRICS_PREFIX),
                "result" => result
            )
            .increment(count as u64);
        }
    }
}

/// Record a bibliographic lookup
pub fn record_enrichment(source: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        format!("{}_enrichment_requests_total", METRICS_PREFIX),
        "source" => source.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a failure handler invocation
pub fn record_failure(stage: &str) {
    counter!(
        format!("{}_failures_handled_total", METRICS_PREFIX),
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Publish the extraction health flag
pub fn record_health(healthy: bool) {
    gauge!(format!("{}_extraction_healthy", METRICS_PREFIX)).set(if healthy { 1.0 } else { 0.0 });
}

/// Record a received batch
pub fn record_received(count: usize) {
    counter!(format!("{}_queue_messages_received_total", METRICS_PREFIX)).increment(count as u64);
}
