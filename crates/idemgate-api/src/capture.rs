//! Response capture for claimants, and replay for followers.
//!
//! The claimant's response is buffered once. A cache-eligible response is
//! stored and published through the coordinator; anything else releases the
//! pending claim so a retry can execute. Either way the caller receives the
//! response the handler produced.
//!
//! Both paths are scoped to the claimant's token: a claimant that outlived
//! its pending TTL writes nothing over a later claim.

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use idemgate_core::coordinator::{Coordinator, Resolution};
use idemgate_core::metrics::record_completion;
use idemgate_core::outcome::{ClaimToken, Outcome};
use idemgate_core::policy::MethodPolicy;
use idemgate_core::store::SharedStore;

use crate::error::ApiError;

/// Buffers the claimant's `response` and completes the claim held by `token`.
///
/// Store failures while completing are logged and counted; the live response
/// is still returned. A body over `max_capture_bytes` cannot be replayed, so
/// the claim is released and the caller receives 500.
pub async fn complete<S: SharedStore + ?Sized>(
    coordinator: &Coordinator<S>,
    token: &ClaimToken,
    policy: &MethodPolicy,
    response: Response,
    max_capture_bytes: usize,
) -> Response {
    let key = token.key();
    let (parts, body) = response.into_parts();

    let bytes = match axum::body::to_bytes(body, max_capture_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(
                key = %key,
                error = %e,
                max_capture_bytes,
                "failed to capture response body"
            );
            release(coordinator, token).await;
            record_completion("failed");
            return ApiError::internal(format!(
                "response body could not be captured (limit {max_capture_bytes} bytes)"
            ))
            .into_response();
        }
    };

    let status = parts.status.as_u16();
    if policy.is_cacheable(status) {
        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let outcome = Outcome::new(key.clone(), status, bytes.clone(), content_type);

        match coordinator.resolve(token, &outcome, policy.outcome_ttl()).await {
            Ok(Resolution::Published { receivers }) => {
                tracing::debug!(key = %key, status, receivers, "stored outcome");
                record_completion("resolved");
            }
            Ok(Resolution::ClaimLost) => {
                tracing::warn!(
                    key = %key,
                    status,
                    "claim lost before completion; outcome not stored"
                );
                record_completion("lost");
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "failed to store outcome");
                record_completion("failed");
            }
        }
    } else {
        tracing::debug!(key = %key, status, "response not cacheable; releasing claim");
        release(coordinator, token).await;
        record_completion("released");
    }

    Response::from_parts(parts, Body::from(bytes))
}

async fn release<S: SharedStore + ?Sized>(coordinator: &Coordinator<S>, token: &ClaimToken) {
    if let Err(e) = coordinator.release(token).await {
        tracing::error!(key = %token.key(), error = %e, "failed to release pending claim");
    }
}

/// Rebuilds the response a claimant produced.
#[must_use]
pub fn replay(outcome: &Outcome) -> Response {
    let status = StatusCode::from_u16(outcome.status_code).unwrap_or_else(|_| {
        tracing::warn!(status = outcome.status_code, "stored outcome has an invalid status");
        StatusCode::INTERNAL_SERVER_ERROR
    });

    let mut response = (status, Body::from(outcome.body.clone())).into_response();
    if let Some(value) = outcome
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}
