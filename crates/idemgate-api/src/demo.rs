//! Demonstration handler.
//!
//! `POST /` sleeps for `delay` milliseconds (from the JSON body) and echoes
//! the body back with a `random` field in `0..1000`. Two identical requests
//! sent while the first is still sleeping show the follower receiving the
//! claimant's `random` value.

use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use rand::Rng;
use serde_json::{Map, Value};

use crate::error::{ApiError, ApiResult};

/// Upper bound on the demo delay, in milliseconds.
pub const MAX_DELAY_MS: u64 = 60_000;

/// Handler for `POST /`.
///
/// # Errors
///
/// Returns 400 if `delay` is present but not a non-negative integer.
pub async fn echo_with_delay(
    Json(body): Json<Map<String, Value>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let delay_ms = match body.get("delay") {
        None | Some(Value::Null) => 0,
        Some(value) => value.as_u64().ok_or_else(|| {
            ApiError::bad_request("delay must be a non-negative integer (milliseconds)")
        })?,
    };

    tracing::info!(delay_ms, "demo handler executing");
    tokio::time::sleep(Duration::from_millis(delay_ms.min(MAX_DELAY_MS))).await;

    let mut response = body;
    response.insert(
        "random".to_string(),
        Value::from(rand::thread_rng().gen_range(0..1000_u32)),
    );
    tracing::info!("demo handler finished");
    Ok((StatusCode::OK, Json(Value::Object(response))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(value: Value) -> Json<Map<String, Value>> {
        match value {
            Value::Object(map) => Json(map),
            other => panic!("expected object, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn echoes_body_with_random() {
        let request = body(serde_json::json!({"delay": 10, "name": "x"}));
        let (status, Json(value)) = echo_with_delay(request)
            .await
            .expect("handler should succeed");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["name"], "x");
        assert_eq!(value["delay"], 10);
        let random = value["random"].as_u64().expect("random should be a number");
        assert!(random < 1000);
    }

    #[tokio::test]
    async fn invalid_delay_is_rejected() {
        let err = echo_with_delay(body(serde_json::json!({"delay": "soon"})))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
