//! Idempotency middleware.
//!
//! Per request:
//!
//! 1. Resolve the effective policy for `(method, path)`; a disabled policy
//!    runs the handler untouched.
//! 2. Buffer the request body (up to `max_request_bytes`, else 413) and
//!    resolve the idempotency key. A key header that is not UTF-8 is a 400.
//! 3. Claim the key:
//!    - first caller: run the handler under response capture;
//!    - follower: replay the stored outcome;
//!    - timeout: 408 with `{"error": ...}`;
//!    - store failure: 503, or the handler uncoordinated in fail-open mode.
//!
//! Coordinated responses carry `x-idempotency-key`,
//! `x-idempotency-duration` (milliseconds spent coordinating) and
//! `x-idempotency-source` (`api` or `cache`).

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::http::header::HeaderName;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use idemgate_core::Error as CoreError;
use idemgate_core::coordinator::ClaimResult;
use idemgate_core::key::{IDEMPOTENCY_KEY_HEADER, IdempotencyKey, KeySource, resolve_key};

use crate::capture;
use crate::error::ApiError;
use crate::metrics::{record_fail_open, record_idempotent_response};
use crate::server::AppState;

/// Response header carrying the time spent coordinating, in milliseconds.
pub const IDEMPOTENCY_DURATION_HEADER: &str = "x-idempotency-duration";

/// Response header naming where the response came from.
pub const IDEMPOTENCY_SOURCE_HEADER: &str = "x-idempotency-source";

/// Where a coordinated response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// The handler ran for this request.
    Api,
    /// Replayed from a stored or published outcome.
    Cache,
}

impl ResponseSource {
    /// Returns the header value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Cache => "cache",
        }
    }
}

/// Enforces idempotent execution for every request routed through it.
pub async fn idempotency_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let policy = state
        .policies()
        .resolve(request.method().as_str(), request.uri().path());
    if !policy.enabled {
        return next.run(request).await;
    }

    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let max_request_bytes = state.config.max_request_bytes;
    let body = match axum::body::to_bytes(body, max_request_bytes).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(error = %e, max_request_bytes, "request body rejected");
            return ApiError::payload_too_large(format!(
                "request body exceeds {max_request_bytes} bytes or could not be read"
            ))
            .into_response();
        }
    };

    let header_value = match parts
        .headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|v| std::str::from_utf8(v.as_bytes()))
        .transpose()
    {
        Ok(value) => value,
        Err(_) => {
            return ApiError::bad_request(format!(
                "{IDEMPOTENCY_KEY_HEADER} header must be valid UTF-8"
            ))
            .into_response();
        }
    };
    let (key, key_source) = match resolve_key(parts.uri.path(), &body, header_value) {
        Ok(resolved) => resolved,
        Err(e) => return ApiError::from(e).into_response(),
    };
    tracing::debug!(
        key = %key,
        from_header = key_source == KeySource::Header,
        method = %parts.method,
        path = parts.uri.path(),
        "resolved idempotency key"
    );

    let request = Request::from_parts(parts, Body::from(body));
    let coordinator = state.coordinator();

    match coordinator.claim(&key, &policy).await {
        Ok(ClaimResult::FirstCaller(token)) => {
            let elapsed_ms = started.elapsed().as_millis();
            let response = next.run(request).await;
            let response = capture::complete(
                coordinator,
                &token,
                &policy,
                response,
                state.config.max_capture_bytes,
            )
            .await;
            annotate(response, &key, elapsed_ms, Some(ResponseSource::Api))
        }
        Ok(ClaimResult::Follower(outcome)) => {
            let elapsed_ms = started.elapsed().as_millis();
            annotate(
                capture::replay(&outcome),
                &key,
                elapsed_ms,
                Some(ResponseSource::Cache),
            )
        }
        Err(CoreError::StoreUnavailable { message, .. })
            if state.config.store_failure_mode.is_open() =>
        {
            tracing::warn!(
                key = %key,
                error = %message,
                "store unavailable; running handler uncoordinated"
            );
            record_fail_open();
            let elapsed_ms = started.elapsed().as_millis();
            annotate(next.run(request).await, &key, elapsed_ms, Some(ResponseSource::Api))
        }
        Err(e) => {
            let elapsed_ms = started.elapsed().as_millis();
            annotate(ApiError::from(e).into_response(), &key, elapsed_ms, None)
        }
    }
}

fn annotate(
    mut response: Response,
    key: &IdempotencyKey,
    elapsed_ms: u128,
    source: Option<ResponseSource>,
) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_bytes(key.as_str().as_bytes()) {
        headers.insert(HeaderName::from_static(IDEMPOTENCY_KEY_HEADER), value);
    }
    headers.insert(
        HeaderName::from_static(IDEMPOTENCY_DURATION_HEADER),
        HeaderValue::from(u64::try_from(elapsed_ms).unwrap_or(u64::MAX)),
    );
    if let Some(source) = source {
        record_idempotent_response(source.as_str());
        headers.insert(
            HeaderName::from_static(IDEMPOTENCY_SOURCE_HEADER),
            HeaderValue::from_static(source.as_str()),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn annotate_sets_all_headers() {
        let response = annotate(
            StatusCode::OK.into_response(),
            &IdempotencyKey::new("abc"),
            42,
            Some(ResponseSource::Cache),
        );
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        assert_eq!(header(IDEMPOTENCY_KEY_HEADER).as_deref(), Some("abc"));
        assert_eq!(header(IDEMPOTENCY_DURATION_HEADER).as_deref(), Some("42"));
        assert_eq!(header(IDEMPOTENCY_SOURCE_HEADER).as_deref(), Some("cache"));
    }

    #[test]
    fn errors_carry_key_but_no_source() {
        let response = annotate(
            StatusCode::REQUEST_TIMEOUT.into_response(),
            &IdempotencyKey::new("abc"),
            100,
            None,
        );
        assert!(response.headers().get(IDEMPOTENCY_KEY_HEADER).is_some());
        assert!(response.headers().get(IDEMPOTENCY_SOURCE_HEADER).is_none());
    }

    #[test]
    fn non_ascii_key_is_echoed() {
        let response = annotate(
            StatusCode::OK.into_response(),
            &IdempotencyKey::new("paiement-é"),
            1,
            Some(ResponseSource::Api),
        );
        let echoed = response
            .headers()
            .get(IDEMPOTENCY_KEY_HEADER)
            .map(|v| v.as_bytes().to_vec());
        assert_eq!(echoed.as_deref(), Some("paiement-é".as_bytes()));
    }

    #[test]
    fn source_values() {
        assert_eq!(ResponseSource::Api.as_str(), "api");
        assert_eq!(ResponseSource::Cache.as_str(), "cache");
    }
}
