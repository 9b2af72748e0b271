//! Coordination metrics.
//!
//! Recorded through the `metrics` facade; the HTTP server installs the
//! Prometheus recorder. Without a recorder these calls are no-ops.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Metric Names
// ============================================================================

/// Claims by result (`first`, `follower`, `timeout`, `error`).
pub const CLAIMS_TOTAL: &str = "idempotency_claims_total";

/// Time a claim spent before returning, in seconds.
pub const WAIT_SECONDS: &str = "idempotency_wait_seconds";

/// Claimant completions by result (`resolved`, `released`, `lost`, `failed`).
pub const COMPLETIONS_TOTAL: &str = "idempotency_completions_total";

/// Shared store failures by operation.
pub const STORE_ERRORS_TOTAL: &str = "idempotency_store_errors_total";

/// Claimants whose marker was gone when they completed, by operation.
pub const CLAIMS_LOST_TOTAL: &str = "idempotency_claims_lost_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers coordination metric descriptions.
///
/// Call this once at startup after installing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(CLAIMS_TOTAL, "Idempotency claims by result");
    describe_histogram!(WAIT_SECONDS, "Time spent resolving an idempotency claim");
    describe_counter!(COMPLETIONS_TOTAL, "Claimant completions by result");
    describe_counter!(STORE_ERRORS_TOTAL, "Shared store failures by operation");
    describe_counter!(
        CLAIMS_LOST_TOTAL,
        "Claimants that outlived their pending TTL before completing"
    );
}

// ============================================================================
// Recording
// ============================================================================

/// Records the result of a claim and how long it took.
pub fn record_claim(result: &'static str, elapsed: Duration) {
    let labels = [("result", result)];
    counter!(CLAIMS_TOTAL, &labels).increment(1);
    histogram!(WAIT_SECONDS, &labels).record(elapsed.as_secs_f64());
}

/// Records how a claimant completed.
pub fn record_completion(result: &'static str) {
    counter!(COMPLETIONS_TOTAL, "result" => result).increment(1);
}

/// Records a shared store failure.
pub fn record_store_error(op: &'static str) {
    counter!(STORE_ERRORS_TOTAL, "op" => op).increment(1);
}

/// Records a claimant completing after its claim was lost.
pub fn record_claim_lost(op: &'static str) {
    counter!(CLAIMS_LOST_TOTAL, "op" => op).increment(1);
}
