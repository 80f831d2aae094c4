//! Metrics and observability utilities
//!
//! Uses the `metrics` facade; installing an exporter is left to the host.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

/// Metrics prefix for all ExpertMatch metrics
pub const METRICS_PREFIX: &str = "expertmatch";

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_retrievals_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of retrieval requests"
    );

    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end retrieval latency in seconds"
    );

    describe_histogram!(
        format!("{}_channel_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Candidate generation latency per channel"
    );

    describe_histogram!(
        format!("{}_channel_candidates", METRICS_PREFIX),
        Unit::Count,
        "Candidates produced per channel"
    );

    describe_counter!(
        format!("{}_channel_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Channel failures and timeouts resolved to empty lists"
    );

    describe_counter!(
        format!("{}_graph_transient_aborts_total", METRICS_PREFIX),
        Unit::Count,
        "Graph queries that hit an aborted transaction"
    );

    describe_counter!(
        format!("{}_rerank_fallbacks_total", METRICS_PREFIX),
        Unit::Count,
        "Reranker responses discarded in favour of the input order"
    );

    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    tracing::info!("Metrics registered");
}

/// Record one channel's outcome
pub fn record_channel(channel: &str, duration_secs: f64, candidates: usize, failed: bool) {
    histogram!(
        format!("{}_channel_duration_seconds", METRICS_PREFIX),
        "channel" => channel.to_string()
    )
    .record(duration_secs);

    histogram!(
        format!("{}_channel_candidates", METRICS_PREFIX),
        "channel" => channel.to_string()
    )
    .record(candidates as f64);

    if failed {
        counter!(
            format!("{}_channel_failures_total", METRICS_PREFIX),
            "channel" => channel.to_string()
        )
        .increment(1);
    }
}

/// Record a completed retrieval
pub fn record_retrieval(duration_secs: f64, reranked: bool, result_count: usize) {
    let mode = if reranked { "reranked" } else { "fused" };

    counter!(
        format!("{}_retrievals_total", METRICS_PREFIX),
        "mode" => mode
    )
    .increment(1);

    histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        "mode" => mode
    )
    .record(duration_secs);

    tracing::debug!(mode, result_count, "retrieval recorded");
}

pub fn record_graph_transient_abort() {
    counter!(format!("{}_graph_transient_aborts_total", METRICS_PREFIX)).increment(1);
}

/// Reason is one of: foreign_id, invalid_json, empty, error
pub fn record_rerank_fallback(reason: &'static str) {
    counter!(
        format!("{}_rerank_fallbacks_total", METRICS_PREFIX),
        "reason" => reason
    )
    .increment(1);
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every call is a no-op and must not panic
        register_metrics();
        record_channel("graph", 0.01, 3, false);
        record_channel("person", 0.02, 0, true);
        record_retrieval(0.05, true, 10);
        record_graph_transient_abort();
        record_rerank_fallback("foreign_id");
        record_embedding(0.2, "mock-embedding", false);
    }
}
