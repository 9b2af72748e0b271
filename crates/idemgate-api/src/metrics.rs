//! Metrics middleware and Prometheus exposition.
//!
//! Provides:
//! - Request duration and throughput, split by how coordination went
//! - Time spent coordinating (claim or wait) per request
//! - Responses by idempotency source
//! - Fail-open bypasses

use std::sync::OnceLock;
use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use idemgate_core::key::IDEMPOTENCY_KEY_HEADER;

use crate::middleware::{IDEMPOTENCY_DURATION_HEADER, IDEMPOTENCY_SOURCE_HEADER};

// ============================================================================
// Metric Names
// ============================================================================

/// HTTP request duration histogram.
pub const HTTP_REQUEST_DURATION: &str = "idempotency_http_request_duration_seconds";

/// HTTP request counter.
pub const HTTP_REQUESTS_TOTAL: &str = "idempotency_http_requests_total";

/// Time spent claiming or waiting before the response was produced.
pub const COORDINATION_DURATION: &str = "idempotency_coordination_duration_seconds";

/// Coordinated responses by `x-idempotency-source`.
pub const IDEMPOTENT_RESPONSES: &str = "idempotency_responses_total";

/// Requests that ran uncoordinated because the store failed (fail-open mode).
pub const FAIL_OPEN_TOTAL: &str = "idempotency_fail_open_total";

const UNMATCHED_ROUTE: &str = "unmatched";

/// Requests slower than this are logged with their coordination breakdown.
const SLOW_REQUEST_SECS: f64 = 1.0;

// ============================================================================
// Prometheus Recorder
// ============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes the global metrics recorder with Prometheus exporter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Panics
///
/// Panics if the Prometheus recorder cannot be installed. The server should
/// not start without metrics.
#[allow(clippy::panic)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|e| panic!("failed to install prometheus recorder: {e}"));

            describe_histogram!(
                HTTP_REQUEST_DURATION,
                "Duration of HTTP requests in seconds, by coordination disposition"
            );
            describe_counter!(
                HTTP_REQUESTS_TOTAL,
                "HTTP requests by route, method, status and coordination disposition"
            );
            describe_histogram!(
                COORDINATION_DURATION,
                "Seconds spent claiming a key or waiting for its outcome"
            );
            describe_counter!(
                IDEMPOTENT_RESPONSES,
                "Coordinated responses by source (api or cache)"
            );
            describe_counter!(
                FAIL_OPEN_TOTAL,
                "Requests executed uncoordinated after a store failure"
            );
            idemgate_core::metrics::register_metrics();

            tracing::info!("Prometheus metrics recorder initialized");
            handle
        })
        .clone()
}

/// Returns the global Prometheus handle, if initialized.
#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// ============================================================================
// Request Metrics
// ============================================================================

/// How a request went through idempotency coordination, as stamped on the
/// response by the idempotency middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The handler ran under a claim (`x-idempotency-source: api`).
    Executed,
    /// A stored or published outcome was replayed (`x-idempotency-source: cache`).
    Replayed,
    /// A key was resolved but coordination failed (408, 503).
    Rejected,
    /// No key on the response: bypassed method, system route or early rejection.
    Uncoordinated,
}

impl Disposition {
    /// Reads the disposition from the idempotency response headers.
    #[must_use]
    pub fn of(response: &Response) -> Self {
        let headers = response.headers();
        match headers.get(IDEMPOTENCY_SOURCE_HEADER) {
            Some(source) if *source == "api" => Self::Executed,
            Some(source) if *source == "cache" => Self::Replayed,
            _ if headers.contains_key(IDEMPOTENCY_KEY_HEADER) => Self::Rejected,
            _ => Self::Uncoordinated,
        }
    }

    /// Returns the metric label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Replayed => "replayed",
            Self::Rejected => "rejected",
            Self::Uncoordinated => "uncoordinated",
        }
    }
}

/// Milliseconds the idempotency middleware reports having spent coordinating.
fn coordination_millis(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(IDEMPOTENCY_DURATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Middleware that records request metrics.
///
/// Must sit outside the idempotency middleware so the response headers are
/// visible. Captures:
/// - `idempotency_http_request_duration_seconds{route, method, status, disposition}`
/// - `idempotency_http_requests_total{route, method, status, disposition}`
/// - `idempotency_coordination_duration_seconds{disposition}` for coordinated requests
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or(UNMATCHED_ROUTE, MatchedPath::as_str)
        .to_string();
    let method = request.method().to_string();

    let response = next.run(request).await;

    let elapsed = start.elapsed().as_secs_f64();
    let status = response.status().as_u16();
    let disposition = Disposition::of(&response);
    let labels = [
        ("route", route.clone()),
        ("method", method.clone()),
        ("status", status.to_string()),
        ("disposition", disposition.as_str().to_string()),
    ];
    histogram!(HTTP_REQUEST_DURATION, &labels).record(elapsed);
    counter!(HTTP_REQUESTS_TOTAL, &labels).increment(1);

    let coordination_ms = coordination_millis(&response);
    if let Some(ms) = coordination_ms {
        #[allow(clippy::cast_precision_loss)]
        let secs = ms as f64 / 1000.0;
        histogram!(COORDINATION_DURATION, "disposition" => disposition.as_str()).record(secs);
    }

    if elapsed > SLOW_REQUEST_SECS {
        let key = response
            .headers()
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|v| std::str::from_utf8(v.as_bytes()).ok())
            .unwrap_or("-");
        tracing::warn!(
            route = %route,
            method = %method,
            status,
            key,
            disposition = disposition.as_str(),
            coordination_ms = coordination_ms.unwrap_or(0),
            elapsed_secs = %elapsed,
            "slow idempotent request"
        );
    }

    response
}

// ============================================================================
// Metrics Endpoint
// ============================================================================

/// Handler for the `/metrics` endpoint.
pub async fn serve_metrics() -> Response {
    let Some(handle) = prometheus_handle() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed")
            .into_response();
    };
    (
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
        .into_response()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Records a coordinated response by source.
pub fn record_idempotent_response(source: &'static str) {
    counter!(IDEMPOTENT_RESPONSES, "source" => source).increment(1);
}

/// Records a request that bypassed coordination after a store failure.
pub fn record_fail_open() {
    counter!(FAIL_OPEN_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::HeaderValue;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::server::Server;

    fn stamped(headers: &[(&'static str, &'static str)]) -> Response {
        let mut response = StatusCode::OK.into_response();
        for (name, value) in headers {
            response
                .headers_mut()
                .insert(*name, HeaderValue::from_static(value));
        }
        response
    }

    #[test]
    fn disposition_follows_idempotency_headers() {
        let executed = stamped(&[
            (IDEMPOTENCY_KEY_HEADER, "k"),
            (IDEMPOTENCY_SOURCE_HEADER, "api"),
        ]);
        let replayed = stamped(&[
            (IDEMPOTENCY_KEY_HEADER, "k"),
            (IDEMPOTENCY_SOURCE_HEADER, "cache"),
        ]);
        let rejected = stamped(&[
            (IDEMPOTENCY_KEY_HEADER, "k"),
            (IDEMPOTENCY_DURATION_HEADER, "20"),
        ]);

        assert_eq!(Disposition::of(&executed), Disposition::Executed);
        assert_eq!(Disposition::of(&replayed), Disposition::Replayed);
        assert_eq!(Disposition::of(&rejected), Disposition::Rejected);
        assert_eq!(Disposition::of(&stamped(&[])), Disposition::Uncoordinated);
        assert_eq!(coordination_millis(&rejected), Some(20));
        assert_eq!(coordination_millis(&executed), None);
    }

    #[tokio::test]
    async fn request_metrics_carry_disposition_and_route() -> anyhow::Result<()> {
        let handle = init_metrics();
        let router = Server::builder()
            .config(Config {
                debug: true,
                ..Config::default()
            })
            .build()
            .test_router();

        for _ in 0..2 {
            let request = Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/json")
                .header(IDEMPOTENCY_KEY_HEADER, "metrics-order")
                .body(Body::from("{}"))?;
            let response = router
                .clone()
                .oneshot(request)
                .await
                .map_err(|err| -> anyhow::Error { match err {} })?;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let request = Request::builder().uri("/health").body(Body::empty())?;
        router.oneshot(request).await.map_err(|err| -> anyhow::Error { match err {} })?;

        let metrics = handle.render();
        assert!(metrics.contains(HTTP_REQUESTS_TOTAL));
        assert!(metrics.contains("disposition=\"executed\""));
        assert!(metrics.contains("disposition=\"replayed\""));
        assert!(metrics.contains("disposition=\"uncoordinated\""));
        assert!(metrics.contains("route=\"/health\""));
        assert!(metrics.contains(COORDINATION_DURATION));
        assert!(metrics.contains("source=\"cache\""));
        Ok(())
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_text() {
        init_metrics();
        let response = serve_metrics().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with("text/plain"))
        );
    }
}
