//! Stored outcome and claim state for an idempotency key.
//!
//! A key holds one of three raw values in the shared store:
//!
//! - nothing (`Absent`),
//! - a pending marker (`Pending`: claimed, execution in flight),
//! - a JSON-serialized [`Outcome`] (`Resolved`).
//!
//! A claimant writes `PENDING_SENTINEL:<nonce>`, held in its [`ClaimToken`].
//! Only the holder of that exact marker may replace or delete it, so a
//! claimant that outlived its pending TTL cannot clobber the next claim.

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::key::IdempotencyKey;

/// Prefix of every pending marker. The bare value also reads as `Pending`.
pub const PENDING_SENTINEL: &str = "IDEMPOTENCY-PENDING";

/// Returns true if `raw` is a pending marker, bare or claim-scoped.
#[must_use]
pub fn is_pending(raw: &str) -> bool {
    raw.strip_prefix(PENDING_SENTINEL)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
}

/// Proof that a caller won the claim on a key.
///
/// Carries the exact pending marker the claimant wrote; resolving or
/// releasing compares against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    key: IdempotencyKey,
    marker: String,
}

impl ClaimToken {
    /// Creates a token with a fresh random marker for `key`.
    #[must_use]
    pub fn generate(key: IdempotencyKey) -> Self {
        let marker = format!("{PENDING_SENTINEL}:{:032x}", rand::random::<u128>());
        Self { key, marker }
    }

    /// Returns the claimed key.
    #[must_use]
    pub const fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Returns the pending marker stored under the key.
    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }
}

/// Terminal result of an execution, replayed to every follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    /// Key this outcome was stored under.
    pub key: IdempotencyKey,
    /// HTTP status code of the original response.
    pub status_code: u16,
    /// Response payload (base64 on the wire).
    #[serde(with = "base64_bytes")]
    pub body: Bytes,
    /// `Content-Type` of the original response, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// When the claimant stored the outcome.
    pub stored_at: DateTime<Utc>,
}

impl Outcome {
    /// Creates an outcome stamped with the current time.
    #[must_use]
    pub fn new(
        key: IdempotencyKey,
        status_code: u16,
        body: impl Into<Bytes>,
        content_type: Option<String>,
    ) -> Self {
        Self {
            key,
            status_code,
            body: body.into(),
            content_type,
            stored_at: Utc::now(),
        }
    }

    /// Serializes the outcome into its stored/published form.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::serialization(format!("encode outcome for {}: {e}", self.key)))
    }

    /// Decodes a stored/published payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the payload is a pending marker or
    /// is not a valid outcome document.
    pub fn decode(raw: &str) -> Result<Self> {
        if is_pending(raw) {
            return Err(Error::serialization("pending marker is not an outcome"));
        }
        serde_json::from_str(raw).map_err(|e| Error::serialization(format!("decode outcome: {e}")))
    }
}

/// Observed state of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimState {
    /// No record.
    Absent,
    /// Claimed; no result yet.
    Pending,
    /// Terminal outcome stored.
    Resolved(Outcome),
}

impl ClaimState {
    /// Interprets a raw store value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if a non-pending value is not a valid outcome.
    pub fn from_raw(raw: Option<&str>) -> Result<Self> {
        match raw {
            None => Ok(Self::Absent),
            Some(value) if is_pending(value) => Ok(Self::Pending),
            Some(value) => Outcome::decode(value).map(Self::Resolved),
        }
    }

    /// Returns a short label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Pending => "pending",
            Self::Resolved(_) => "resolved",
        }
    }
}

mod base64_bytes {
    use super::{Bytes, Deserialize, Deserializer, Engine, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
